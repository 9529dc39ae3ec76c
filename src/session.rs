// Transfer state machine driving one flashing session
// Idle -> EnteringBootloader -> Flashing -> Finalizing -> Succeeded | Failed

use std::time::Duration;

use log::{info, warn};

use crate::bootloader::Bootloader;
use crate::config::FlashConfig;
use crate::error::FlashError;
use crate::image::{Chunk, Chunks, FirmwareImage};
use crate::packets::Verdict;
use crate::transport::{CloseOnDrop, Transport};

/// Phase of a transfer session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, nothing sent yet
    Idle,
    /// Waiting for the target to acknowledge the enter bootloader command
    EnteringBootloader,
    /// Transmitting data chunks
    Flashing,
    /// Sending the checksum and waiting for the final acknowledgment
    Finalizing,
    /// Terminal: the target confirmed the image
    Succeeded,
    /// Terminal: the session stopped, see [`FailureReason`]
    Failed(FailureReason),
}

impl Phase {
    /// `true` for [`Phase::Succeeded`] and [`Phase::Failed`]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed(_))
    }
}

/// Why a session ended in [`Phase::Failed`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// No acknowledgment to the enter bootloader command
    BootloaderNotReady,
    /// A chunk used up its retry budget
    ChunkRetriesExhausted {
        /// Index of the chunk
        index: usize,
    },
    /// Every chunk was accepted but the final acknowledgment did not come
    FinalAckMissing,
}

/// Summary of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionReport {
    /// Image size in bytes
    pub image_len: usize,
    /// Number of chunks in the image
    pub chunk_count: usize,
    /// Data chunk frames sent, retransmissions included
    pub chunk_sends: usize,
    /// Retransmissions over all chunks
    pub retries: usize,
    /// CRC-32 sent in the done flashing frame
    pub checksum: u32,
}

/// One end-to-end attempt to transfer and activate a firmware image
///
/// Every phase has its own transition method so that the state machine can
/// be driven one step at a time; [`run`](Self::run) simply steps until a
/// terminal phase is reached. A transition called outside of its phase does
/// nothing and returns the current phase.
///
/// There is no deadline for the whole session. Each wait is bounded on its
/// own, which puts the worst case at
/// [`FlashConfig::worst_case_duration`].
pub struct TransferSession<'a> {
    config: &'a FlashConfig,
    image: &'a FirmwareImage,
    bootloader: Bootloader,
    checksum: u32,
    chunk_count: usize,
    phase: Phase,
    chunks: Chunks<'a>,
    chunk: Option<Chunk>,
    retries: u32,
    chunk_sends: usize,
    total_retries: usize,
}

impl<'a> TransferSession<'a> {
    /// Prepare a session for `image`
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the image exceeds
    /// the configured maximum size
    pub fn new(image: &'a FirmwareImage, config: &'a FlashConfig) -> Result<Self, FlashError> {
        config.validate()?;
        if image.len() > config.max_image_size {
            return Err(FlashError::ImageTooLarge {
                size: image.len(),
                max: config.max_image_size,
            });
        }

        let mut chunks = image.chunks(config.chunk_size);
        let chunk = chunks.next();

        Ok(TransferSession {
            config,
            image,
            bootloader: Bootloader::new(config.command_ids, config.response_ids),
            checksum: image.crc32(),
            chunk_count: image.chunk_count(config.chunk_size),
            phase: Phase::Idle,
            chunks,
            chunk,
            retries: 0,
            chunk_sends: 0,
            total_retries: 0,
        })
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// CRC-32 of the image, computed when the session was created
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Number of chunks in the image
    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// Index of the chunk being transmitted
    ///
    /// Equal to [`chunk_count`](Self::chunk_count) once every chunk is acknowledged.
    pub fn chunk_index(&self) -> usize {
        self.chunk.as_ref().map_or(self.chunk_count, Chunk::index)
    }

    /// Failed transmissions of the current chunk
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Summary of the transfer so far
    pub fn report(&self) -> SessionReport {
        SessionReport {
            image_len: self.image.len(),
            chunk_count: self.chunk_count,
            chunk_sends: self.chunk_sends,
            retries: self.total_retries,
            checksum: self.checksum,
        }
    }

    /// Idle -> EnteringBootloader
    pub fn start(&mut self) -> Phase {
        if self.phase == Phase::Idle {
            info!(
                "Starting session: {} bytes, {} chunks, CRC32 0x{:08X}",
                self.image.len(),
                self.chunk_count,
                self.checksum
            );
            self.enter_phase(Phase::EnteringBootloader);
        }
        self.phase
    }

    /// EnteringBootloader -> Flashing | Failed
    pub async fn enter_bootloader<T>(&mut self, transport: &mut T) -> Phase
    where
        T: Transport + ?Sized,
    {
        if self.phase != Phase::EnteringBootloader {
            return self.phase;
        }

        info!("Entering bootloader");
        let next = match self.bootloader.enter(transport, self.config.entry_timeout).await {
            Ok(Some(Verdict::Ack)) => Phase::Flashing,
            Ok(Some(verdict)) => {
                warn!("Bootloader answered {verdict} to enter command");
                Phase::Failed(FailureReason::BootloaderNotReady)
            }
            Ok(None) => {
                warn!("No bootloader response within {:?}", self.config.entry_timeout);
                Phase::Failed(FailureReason::BootloaderNotReady)
            }
            Err(e) => {
                warn!("Failed to send enter bootloader command: {e}");
                Phase::Failed(FailureReason::BootloaderNotReady)
            }
        };
        self.enter_phase(next);
        self.phase
    }

    /// Flashing: one transmission of the current chunk
    ///
    /// On acknowledgment the session moves to the next chunk, or to
    /// Finalizing after the last one. Otherwise the retry counter goes up and
    /// the same chunk is sent again on the next call, until the retry budget
    /// is spent.
    pub async fn flash_chunk<T>(&mut self, transport: &mut T) -> Phase
    where
        T: Transport + ?Sized,
    {
        if self.phase != Phase::Flashing {
            return self.phase;
        }
        let Some(chunk) = self.chunk.as_ref() else {
            self.enter_phase(Phase::Finalizing);
            return self.phase;
        };
        let index = chunk.index();

        self.chunk_sends += 1;
        let result = self.bootloader.send_chunk(transport, chunk, self.config.chunk_timeout).await;

        if let Ok(Some(Verdict::Ack)) = result {
            self.chunk = self.chunks.next();
            self.retries = 0;
            if self.chunk.is_none() {
                info!("All data sent");
                self.enter_phase(Phase::Finalizing);
            }
            return self.phase;
        }

        match result {
            Ok(Some(verdict)) => warn!("Chunk {index} answered {verdict}"),
            Ok(None) => warn!("Chunk {index}: no response within {:?}", self.config.chunk_timeout),
            Err(e) => warn!("Chunk {index}: send failed: {e}"),
        }

        self.retries += 1;
        self.total_retries += 1;
        warn!(
            "Retry chunk {}/{} ({}/{})",
            index + 1,
            self.chunk_count,
            self.retries,
            self.config.max_retries
        );
        if self.retries >= self.config.max_retries {
            self.enter_phase(Phase::Failed(FailureReason::ChunkRetriesExhausted { index }));
        }
        self.phase
    }

    /// Finalizing -> Succeeded | Failed
    pub async fn finalize<T>(&mut self, transport: &mut T) -> Phase
    where
        T: Transport + ?Sized,
    {
        if self.phase != Phase::Finalizing {
            return self.phase;
        }

        info!("Finalizing, CRC32 0x{:08X}", self.checksum);
        let next = match self
            .bootloader
            .finish(transport, self.checksum, self.config.finalize_timeout)
            .await
        {
            Ok(Some(Verdict::Ack)) => Phase::Succeeded,
            Ok(Some(verdict)) => {
                warn!("Final response was {verdict}");
                Phase::Failed(FailureReason::FinalAckMissing)
            }
            Ok(None) => {
                warn!("No final ACK within {:?}", self.config.finalize_timeout);
                Phase::Failed(FailureReason::FinalAckMissing)
            }
            Err(e) => {
                warn!("Failed to send done flashing command: {e}");
                Phase::Failed(FailureReason::FinalAckMissing)
            }
        };
        self.enter_phase(next);
        self.phase
    }

    /// Run the transition of the current phase
    pub async fn step<T>(&mut self, transport: &mut T) -> Phase
    where
        T: Transport + ?Sized,
    {
        match self.phase {
            Phase::Idle => self.start(),
            Phase::EnteringBootloader => self.enter_bootloader(transport).await,
            Phase::Flashing => self.flash_chunk(transport).await,
            Phase::Finalizing => self.finalize(transport).await,
            Phase::Succeeded | Phase::Failed(_) => self.phase,
        }
    }

    /// Step until a terminal phase, reporting progress as chunks are acknowledged
    ///
    /// # Arguments
    ///
    /// * `transport` - Transport to the target
    /// * `progress_callback` - Optional callback receiving (chunks_acknowledged, chunk_count)
    pub async fn run<T, F>(&mut self, transport: &mut T, progress_callback: &mut Option<F>) -> Result<SessionReport, FlashError>
    where
        T: Transport + ?Sized,
        F: FnMut(usize, usize),
    {
        loop {
            if let Some(outcome) = self.outcome() {
                return outcome;
            }

            let before = self.chunk_index();
            self.step(transport).await;
            let after = self.chunk_index();

            if after != before {
                if let Some(callback) = progress_callback {
                    callback(after, self.chunk_count);
                }
            }
        }
    }

    /// Terminal result of the session, `None` while it is still running
    pub fn outcome(&self) -> Option<Result<SessionReport, FlashError>> {
        let result = match self.phase {
            Phase::Succeeded => Ok(self.report()),
            Phase::Failed(FailureReason::BootloaderNotReady) => Err(FlashError::BootloaderNotReady),
            Phase::Failed(FailureReason::ChunkRetriesExhausted { index }) => Err(FlashError::ChunkRetriesExhausted {
                index,
                attempts: self.config.max_retries,
            }),
            Phase::Failed(FailureReason::FinalAckMissing) => Err(FlashError::FinalAckMissing { report: self.report() }),
            Phase::Idle | Phase::EnteringBootloader | Phase::Flashing | Phase::Finalizing => return None,
        };
        Some(result)
    }

    fn enter_phase(&mut self, phase: Phase) {
        if phase != self.phase {
            info!("{:?} -> {:?}", self.phase, phase);
        }
        self.phase = phase;
        self.retries = 0;
    }
}

/// Flash an image over `transport` with progress callback
///
/// The transport is owned for the duration of the session and closed on
/// every exit path.
///
/// # Arguments
/// * `transport` - An opened CAN transport to the target
/// * `image` - The image to flash
/// * `config` - Protocol parameters
/// * `progress_callback` - Optional callback function to report progress (chunks_acknowledged, chunk_count)
///
/// # Errors
///
/// The terminal failure of the session. [`FlashError::FinalAckMissing`] is
/// soft: all data was accepted by the target.
pub async fn flash_image_with_progress<T, F>(
    transport: T,
    image: &FirmwareImage,
    config: &FlashConfig,
    mut progress_callback: Option<F>,
) -> Result<SessionReport, FlashError>
where
    T: Transport,
    F: FnMut(usize, usize),
{
    flash_image_internal(transport, image, config, &mut progress_callback).await
}

/// Flash an image over `transport`
///
/// See [`flash_image_with_progress`].
pub async fn flash_image<T>(transport: T, image: &FirmwareImage, config: &FlashConfig) -> Result<SessionReport, FlashError>
where
    T: Transport,
{
    flash_image_internal(transport, image, config, &mut None::<fn(usize, usize)>).await
}

/// Check that the application answers on the bus after flashing
///
/// The transport is closed before returning.
///
/// # Errors
///
/// [`FlashError::TransportIoFailed`] if the probe command could not be sent
pub async fn probe_application<T>(transport: T, timeout: Duration) -> Result<bool, FlashError>
where
    T: Transport,
{
    let mut guard = CloseOnDrop::new(transport);
    let answered = Bootloader::default().probe(guard.transport(), timeout).await?;
    info!("Application {}", if answered { "answered" } else { "silent" });
    Ok(answered)
}

async fn flash_image_internal<T, F>(
    transport: T,
    image: &FirmwareImage,
    config: &FlashConfig,
    progress_callback: &mut Option<F>,
) -> Result<SessionReport, FlashError>
where
    T: Transport,
    F: FnMut(usize, usize),
{
    let mut guard = CloseOnDrop::new(transport);
    let mut session = TransferSession::new(image, config)?;
    session.run(guard.transport(), progress_callback).await
}
