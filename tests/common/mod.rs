// Scripted CAN transport standing in for a target running the bootloader
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use canflash::packets::{
    CMD_DATA_CHUNK, CMD_DONE_FLASHING, CMD_ENTER_BOOTLOADER, CanFrame, RESP_READY_ACK, RESP_RETRY_NACK,
    RESP_TEST_ACK, ResponseIds, Verdict,
};
use canflash::{FirmwareImage, Transport, TransportError};

/// What the simulated target does with one command
#[derive(Clone, Debug)]
pub enum Reply {
    /// Queue these frames for the host to receive
    Frames(Vec<CanFrame>),
    /// Answer nothing
    Silence,
    /// Make the send itself fail
    SendFails,
    /// Accept the send, then fail the next receive
    ReceiveFails,
}

impl Reply {
    fn acknowledges(&self) -> bool {
        let ids = ResponseIds::default();
        match self {
            Reply::Frames(frames) => frames.iter().any(|f| ids.classify(f) == Verdict::Ack),
            _ => false,
        }
    }
}

pub fn ack() -> Reply {
    Reply::Frames(vec![frame(RESP_READY_ACK)])
}

pub fn test_ack() -> Reply {
    Reply::Frames(vec![frame(RESP_TEST_ACK)])
}

pub fn nack() -> Reply {
    Reply::Frames(vec![frame(RESP_RETRY_NACK)])
}

pub fn frame(id: u16) -> CanFrame {
    CanFrame::new(u32::from(id), &[]).unwrap()
}

/// Behavior of the simulated target per command
pub struct Target {
    pub on_enter: Reply,
    /// Called with (chunk index, attempt number starting at 1)
    pub on_chunk: Box<dyn FnMut(usize, u32) -> Reply + Send>,
    pub on_done: Reply,
}

impl Target {
    /// A target acknowledging everything
    pub fn cooperative() -> Self {
        Target {
            on_enter: ack(),
            on_chunk: Box::new(|_, _| ack()),
            on_done: ack(),
        }
    }

    pub fn with_chunks(on_chunk: impl FnMut(usize, u32) -> Reply + Send + 'static) -> Self {
        Target {
            on_chunk: Box::new(on_chunk),
            ..Target::cooperative()
        }
    }
}

/// Everything the host did to the transport
#[derive(Default, Debug)]
pub struct Recorder {
    pub sent: Vec<CanFrame>,
    pub flushes: usize,
    pub closes: usize,
}

impl Recorder {
    pub fn sent_with_id(&self, id: u16) -> Vec<&CanFrame> {
        self.sent.iter().filter(|f| f.id() == u32::from(id)).collect()
    }

    pub fn enter_sends(&self) -> usize {
        self.sent_with_id(CMD_ENTER_BOOTLOADER).len()
    }

    pub fn chunk_sends(&self) -> usize {
        self.sent_with_id(CMD_DATA_CHUNK).len()
    }

    pub fn done_sends(&self) -> usize {
        self.sent_with_id(CMD_DONE_FLASHING).len()
    }

    /// Payloads of the data chunk frames, in order of transmission
    pub fn chunk_payloads(&self) -> Vec<Vec<u8>> {
        self.sent_with_id(CMD_DATA_CHUNK).into_iter().map(|f| f.data().to_vec()).collect()
    }
}

pub struct ScriptedTransport {
    target: Target,
    inbox: VecDeque<CanFrame>,
    chunk_index: usize,
    attempt: u32,
    receive_fault: bool,
    recorder: Arc<Mutex<Recorder>>,
}

impl ScriptedTransport {
    pub fn new(target: Target) -> (Self, Arc<Mutex<Recorder>>) {
        let recorder = Arc::new(Mutex::new(Recorder::default()));
        let transport = ScriptedTransport {
            target,
            inbox: VecDeque::new(),
            chunk_index: 0,
            attempt: 0,
            receive_fault: false,
            recorder: Arc::clone(&recorder),
        };
        (transport, recorder)
    }

    /// Queue a frame as if it had been received before any command
    pub fn preload(&mut self, frame: CanFrame) {
        self.inbox.push_back(frame);
    }

    fn reply_to(&mut self, frame: &CanFrame) -> Reply {
        match u16::try_from(frame.id()).unwrap_or(u16::MAX) {
            CMD_ENTER_BOOTLOADER => self.target.on_enter.clone(),
            CMD_DONE_FLASHING => self.target.on_done.clone(),
            CMD_DATA_CHUNK => {
                self.attempt += 1;
                let reply = (self.target.on_chunk)(self.chunk_index, self.attempt);
                if reply.acknowledges() {
                    self.chunk_index += 1;
                    self.attempt = 0;
                }
                reply
            }
            _ => Reply::Silence,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        self.recorder.lock().unwrap().sent.push(frame.clone());
        match self.reply_to(frame) {
            Reply::Frames(frames) => {
                self.inbox.extend(frames);
                Ok(())
            }
            Reply::Silence => Ok(()),
            Reply::ReceiveFails => {
                self.receive_fault = true;
                Ok(())
            }
            Reply::SendFails => Err(TransportError::Io(std::io::Error::other("bus off"))),
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        if std::mem::take(&mut self.receive_fault) {
            return Err(TransportError::Io(std::io::Error::other("controller error")));
        }
        match self.inbox.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            }
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        self.recorder.lock().unwrap().flushes += 1;
        self.inbox.clear();
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.recorder.lock().unwrap().closes += 1;
        Ok(())
    }
}

/// Image of `len` bytes with a recognizable pattern
pub fn image(len: usize) -> FirmwareImage {
    let data = (0..len).map(|i| (i * 7 + 3) as u8).collect();
    FirmwareImage::from_bytes(data, 96 * 1024).unwrap()
}
