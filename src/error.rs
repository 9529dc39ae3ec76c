//! # Error types
//!
//! [`FlashError`] is the terminal result of everything that can go wrong while
//! loading an image or running a transfer session. [`TransportError`] covers
//! faults raised by a CAN backend.

use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionReport;

/// Fault raised by a CAN backend while opening, sending, receiving or closing
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operating system level I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Serial port error from a serial-line CAN adapter
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    /// Netlink error while configuring a SocketCAN interface
    #[error("netlink error: {0}")]
    Netlink(String),
    /// The transport was already closed
    #[error("transport is closed")]
    Closed,
    /// The frame cannot be expressed on this bus
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    /// The adapter answered BEL to a configuration command
    #[error("adapter rejected command {0:?}")]
    AdapterRejected(String),
    /// The adapter did not answer a configuration command
    #[error("no answer from adapter to command {0:?}")]
    AdapterSilent(String),
    /// The requested bit rate is not supported by the adapter
    #[error("unsupported bit rate: {0} bit/s")]
    UnsupportedBitRate(u32),
}

/// Terminal error of a flashing session
///
/// [`FlashError::FinalAckMissing`] is a soft failure: every chunk was
/// acknowledged, only the final confirmation was lost. Use
/// [`FlashError::is_soft`] to tell it apart from the hard failures.
#[derive(Debug, Error)]
pub enum FlashError {
    /// The CAN channel could not be opened
    #[error("failed to open CAN channel {channel}: {source}")]
    TransportOpenFailed {
        /// Name of the channel (interface or serial port)
        channel: String,
        /// Backend fault
        #[source]
        source: TransportError,
    },
    /// A send or receive failed outside of a retryable exchange
    ///
    /// Raised by [`probe_application`](crate::probe_application). Inside a
    /// transfer session, transport faults use up chunk attempts instead.
    #[error("CAN transport failure: {0}")]
    TransportIoFailed(#[from] TransportError),
    /// The image file does not exist
    #[error("firmware image not found: {}", .0.display())]
    ImageNotFound(PathBuf),
    /// The image file exists but could not be read
    #[error("failed to read firmware image {}: {source}", path.display())]
    ImageRead {
        /// Path of the image
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },
    /// The image is empty
    #[error("firmware image is empty")]
    ImageEmpty,
    /// The image does not fit in the target flash region
    #[error("firmware image is {size} bytes, limit is {max} bytes")]
    ImageTooLarge {
        /// Size of the image in bytes
        size: usize,
        /// Configured maximum in bytes
        max: usize,
    },
    /// The configuration violates a protocol constraint
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// The target did not acknowledge the enter-bootloader command
    #[error("bootloader not ready: no acknowledgment to the enter command")]
    BootloaderNotReady,
    /// A chunk was rejected or unanswered for the whole retry budget
    #[error("chunk {index} not acknowledged after {attempts} attempts")]
    ChunkRetriesExhausted {
        /// Index of the failing chunk
        index: usize,
        /// Number of transmissions of that chunk
        attempts: u32,
    },
    /// All chunks were accepted but the final acknowledgment never arrived
    #[error("all data sent but no final acknowledgment (CRC32 0x{:08X})", report.checksum)]
    FinalAckMissing {
        /// Summary of the transfer that preceded the missing acknowledgment
        report: SessionReport,
    },
}

impl FlashError {
    /// Returns `true` when the image was fully transferred and only the
    /// final acknowledgment is missing
    pub fn is_soft(&self) -> bool {
        matches!(self, FlashError::FinalAckMissing { .. })
    }
}
