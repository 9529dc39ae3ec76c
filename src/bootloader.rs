//! # Interface to the CAN bootloader commands
//!
//! Each method sends one command frame and waits for the target's answer.
//! They are the building blocks of the transfer state machine in
//! [`TransferSession`](crate::TransferSession), which decides what an answer
//! (or the lack of one) means for the session.
//!
//! For most use cases, prefer the high-level [`flash_image`](crate::flash_image) function instead.

use std::time::Duration;

use log::debug;

use crate::error::TransportError;
use crate::image::Chunk;
use crate::packets::{CommandIds, ResponseIds, Verdict};
use crate::transport::{Transport, wait_for, wait_for_verdict};

/// Command set of the bootloader
///
/// Holds the identifiers configured for the session and nothing else, the
/// transport is borrowed per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bootloader {
    commands: CommandIds,
    responses: ResponseIds,
}

impl Default for Bootloader {
    fn default() -> Self {
        Bootloader::new(CommandIds::default(), ResponseIds::default())
    }
}

impl Bootloader {
    /// Create a bootloader interface using the given identifiers
    pub fn new(commands: CommandIds, responses: ResponseIds) -> Self {
        Bootloader { commands, responses }
    }

    /// Command identifiers
    pub fn commands(&self) -> &CommandIds {
        &self.commands
    }

    /// Response identifiers
    pub fn responses(&self) -> &ResponseIds {
        &self.responses
    }

    /// Ask the target to enter its bootloader
    ///
    /// # Returns
    ///
    /// The verdict received before `timeout`, or `None` if none arrived
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be sent
    pub async fn enter<T>(&self, transport: &mut T, timeout: Duration) -> Result<Option<Verdict>, TransportError>
    where
        T: Transport + ?Sized,
    {
        transport.send(&self.commands.enter_bootloader_frame()).await?;
        Ok(wait_for_verdict(transport, &self.responses, timeout).await)
    }

    /// Transmit one data chunk
    ///
    /// Buffered frames are flushed first so that a late answer to a previous
    /// transmission cannot be taken for the answer to this one. A failing
    /// flush is logged and ignored.
    ///
    /// # Returns
    ///
    /// The verdict received before `timeout`, or `None` if none arrived
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk could not be sent
    pub async fn send_chunk<T>(&self, transport: &mut T, chunk: &Chunk, timeout: Duration) -> Result<Option<Verdict>, TransportError>
    where
        T: Transport + ?Sized,
    {
        let frame = self.commands.data_chunk_frame(chunk.payload()).ok_or_else(|| {
            TransportError::InvalidFrame(format!("chunk {} is {} bytes", chunk.index(), chunk.payload().len()))
        })?;

        if let Err(e) = transport.flush().await {
            debug!("Flush before chunk {} failed: {e}", chunk.index());
        }
        transport.send(&frame).await?;
        Ok(wait_for_verdict(transport, &self.responses, timeout).await)
    }

    /// Tell the target the transfer is over
    ///
    /// The done flashing frame carries the image checksum, which the target
    /// compares with the CRC of what it received before starting the
    /// application.
    ///
    /// # Returns
    ///
    /// The verdict received before `timeout`, or `None` if none arrived
    ///
    /// # Errors
    ///
    /// Returns an error if the command could not be sent
    pub async fn finish<T>(&self, transport: &mut T, checksum: u32, timeout: Duration) -> Result<Option<Verdict>, TransportError>
    where
        T: Transport + ?Sized,
    {
        transport.send(&self.commands.done_flashing_frame(checksum)).await?;
        Ok(wait_for_verdict(transport, &self.responses, timeout).await)
    }

    /// Check that an application is running and listening on the bus
    ///
    /// Sends the enter bootloader identifier with the trigger payload `0xFF`
    /// and waits for the test acknowledgment identifier. Any other frame is
    /// ignored.
    ///
    /// # Returns
    ///
    /// `true` if the application answered before `timeout`
    pub async fn probe<T>(&self, transport: &mut T, timeout: Duration) -> Result<bool, TransportError>
    where
        T: Transport + ?Sized,
    {
        transport.send(&self.commands.probe_frame()).await?;
        let test_ack = u32::from(self.responses.test_ack);
        let answered = wait_for(transport, timeout, |frame| {
            (!frame.is_error() && frame.id() == test_ack).then_some(())
        })
        .await;
        Ok(answered.is_some())
    }
}
