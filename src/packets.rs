//! # Frame structures for bootloader communication
//!
//! This module defines the CAN frames exchanged with the bootloader: the
//! command frames sent by the host, and the classification of the response
//! frames sent back by the target.

use std::fmt::{Debug, Display};

// Command frames, standard 11-bit identifiers:
//
// 0x02 enter bootloader  [0x00]
// 0x03 data chunk        [d0 d1 d2 d3 d4 d5 d6 d7], 0xFF padded
// 0x04 done flashing     [0xAA, 0xFF, crc32 (big-endian, 4 bytes), 0x00, 0x00]
//
// Response frames only carry meaning in their identifier:
//
// 0x7FE ready/ack, 0x7FF retry/nack, 0x7D0 test/ack (alias of ready/ack)

/// Maximum payload of a classic CAN frame
pub const MAX_FRAME_DATA: usize = 8;
/// Largest standard (11-bit) identifier
pub const MAX_STANDARD_ID: u16 = 0x7FF;

/// Enter bootloader command identifier
pub const CMD_ENTER_BOOTLOADER: u16 = 0x02;
/// Data chunk command identifier
pub const CMD_DATA_CHUNK: u16 = 0x03;
/// Done flashing command identifier
pub const CMD_DONE_FLASHING: u16 = 0x04;

/// Ready/Ack response identifier
pub const RESP_READY_ACK: u16 = 0x7FE;
/// Retry/Nack response identifier
pub const RESP_RETRY_NACK: u16 = 0x7FF;
/// Test/Ack response identifier, accepted as an acknowledgment
pub const RESP_TEST_ACK: u16 = 0x7D0;

/// Payload byte of the enter bootloader command
pub const ENTER_BOOTLOADER_PAYLOAD: u8 = 0x00;
/// Payload byte asking a running application to acknowledge with its test identifier
pub const PROBE_TRIGGER_PAYLOAD: u8 = 0xFF;

const FINALIZE_MARKER: [u8; 2] = [0xAA, 0xFF];
const FINALIZE_TRAILER: [u8; 2] = [0x00, 0x00];

/// A single CAN frame as seen by the protocol
///
/// Frames that the backend reports as bus-error frames are flagged with
/// [`CanFrame::is_error`] and never classify as a response.
#[derive(Clone, PartialEq, Eq)]
pub struct CanFrame {
    id: u32,
    data: Vec<u8>,
    error: bool,
}

impl CanFrame {
    /// Create a data frame
    ///
    /// Returns `None` if the payload is longer than 8 bytes.
    pub fn new(id: u32, data: &[u8]) -> Option<Self> {
        if data.len() > MAX_FRAME_DATA {
            return None;
        }
        Some(CanFrame {
            id,
            data: data.to_vec(),
            error: false,
        })
    }

    /// Create a frame flagged as a bus-error frame
    pub fn error(id: u32, data: &[u8]) -> Self {
        let len = data.len().min(MAX_FRAME_DATA);
        CanFrame {
            id,
            data: data[..len].to_vec(),
            error: true,
        }
    }

    /// Frame identifier
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Frame payload
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// `true` if the backend surfaced this frame as a bus-error frame
    pub fn is_error(&self) -> bool {
        self.error
    }
}

impl Debug for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:03X}", self.id))
            .field("data", &format_args!("{:02X?}", self.data))
            .field("error", &self.error)
            .finish()
    }
}

impl Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "id=0x{:03X} dlc={} data={:02X?}", self.id, self.data.len(), self.data)?;
        if self.error {
            write!(f, " (error frame)")?;
        }
        Ok(())
    }
}

/// Identifiers of the command frames sent by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandIds {
    /// Enter bootloader
    pub enter_bootloader: u16,
    /// Data chunk
    pub data_chunk: u16,
    /// Done flashing
    pub done_flashing: u16,
}

impl Default for CommandIds {
    fn default() -> Self {
        CommandIds {
            enter_bootloader: CMD_ENTER_BOOTLOADER,
            data_chunk: CMD_DATA_CHUNK,
            done_flashing: CMD_DONE_FLASHING,
        }
    }
}

impl CommandIds {
    /// Enter bootloader frame
    pub fn enter_bootloader_frame(&self) -> CanFrame {
        self.frame(self.enter_bootloader, &[ENTER_BOOTLOADER_PAYLOAD])
    }

    /// Frame asking a running application to answer with its test identifier
    ///
    /// Same identifier as the enter bootloader command, with the trigger byte
    /// `0xFF` as payload.
    pub fn probe_frame(&self) -> CanFrame {
        self.frame(self.enter_bootloader, &[PROBE_TRIGGER_PAYLOAD])
    }

    /// Data chunk frame carrying `payload`
    ///
    /// Returns `None` if the payload does not fit in a CAN frame.
    pub fn data_chunk_frame(&self, payload: &[u8]) -> Option<CanFrame> {
        CanFrame::new(u32::from(self.data_chunk), payload)
    }

    /// Done flashing frame carrying the image checksum
    pub fn done_flashing_frame(&self, checksum: u32) -> CanFrame {
        self.frame(self.done_flashing, &finalize_payload(checksum))
    }

    fn frame(&self, id: u16, data: &[u8]) -> CanFrame {
        CanFrame {
            id: u32::from(id),
            data: data.to_vec(),
            error: false,
        }
    }

    pub(crate) fn all(&self) -> [u16; 3] {
        [self.enter_bootloader, self.data_chunk, self.done_flashing]
    }
}

/// Protocol-level outcome of one received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The target accepted the last command
    Ack,
    /// The target rejected the last command and expects it again
    RetryNack,
    /// Not a bootloader response; ignored by waiters
    Unrecognized,
}

impl Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Verdict::Ack => write!(f, "ACK"),
            Verdict::RetryNack => write!(f, "NACK"),
            Verdict::Unrecognized => write!(f, "unrecognized"),
        }
    }
}

/// Identifiers of the response frames sent by the target
///
/// Both `ready_ack` and `test_ack` mean acknowledgment. The second one is
/// what the target sends from its self-test path and has to stay accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseIds {
    /// Ready/Ack
    pub ready_ack: u16,
    /// Retry/Nack
    pub retry_nack: u16,
    /// Test/Ack
    pub test_ack: u16,
}

impl Default for ResponseIds {
    fn default() -> Self {
        ResponseIds {
            ready_ack: RESP_READY_ACK,
            retry_nack: RESP_RETRY_NACK,
            test_ack: RESP_TEST_ACK,
        }
    }
}

impl ResponseIds {
    /// Classify a received frame
    pub fn classify(&self, frame: &CanFrame) -> Verdict {
        if frame.is_error() {
            return Verdict::Unrecognized;
        }
        self.classify_id(frame.id())
    }

    /// Classify a received identifier
    pub fn classify_id(&self, id: u32) -> Verdict {
        if id == u32::from(self.ready_ack) || id == u32::from(self.test_ack) {
            Verdict::Ack
        } else if id == u32::from(self.retry_nack) {
            Verdict::RetryNack
        } else {
            Verdict::Unrecognized
        }
    }

    pub(crate) fn all(&self) -> [u16; 3] {
        [self.ready_ack, self.retry_nack, self.test_ack]
    }
}

/// Payload of the done flashing command
///
/// Two marker bytes, the checksum in big-endian order, two trailer bytes.
pub fn finalize_payload(checksum: u32) -> [u8; 8] {
    let mut payload = [0u8; 8];
    payload[..2].copy_from_slice(&FINALIZE_MARKER);
    payload[2..6].copy_from_slice(&checksum.to_be_bytes());
    payload[6..].copy_from_slice(&FINALIZE_TRAILER);
    payload
}
