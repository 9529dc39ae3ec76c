//! # CAN adapter backends
//!
//! Two interchangeable implementations of [`Transport`]:
//! - [`SocketCanTransport`] for Linux network interfaces (`can0`, `vcan0`)
//! - [`SlcanTransport`] for serial-line adapters (`/dev/ttyACM0`, `COM3`)

mod slcan;
mod socket_can;

pub use slcan::{DEFAULT_SERIAL_BAUD, SlcanTransport};
pub use socket_can::SocketCanTransport;

use crate::error::{FlashError, TransportError};
use crate::transport::Transport;

/// Default CAN bit rate of the bootloader
pub const DEFAULT_BIT_RATE: u32 = 1_000_000;

/// Kind of CAN adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Linux SocketCAN network interface
    SocketCan,
    /// Serial-line CAN adapter
    Slcan,
}

/// Open a transport of the requested kind on `channel`
///
/// For SocketCAN, `bit_rate` is only applied when given; for SLCAN the
/// channel always has to be started at a bit rate and
/// [`DEFAULT_BIT_RATE`] is used when none is given.
pub fn open(kind: BackendKind, channel: &str, bit_rate: Option<u32>) -> Result<Box<dyn Transport>, FlashError> {
    let opened: Result<Box<dyn Transport>, TransportError> = match kind {
        BackendKind::SocketCan => SocketCanTransport::open(channel, bit_rate).map(|t| Box::new(t) as Box<dyn Transport>),
        BackendKind::Slcan => SlcanTransport::open(channel, bit_rate.unwrap_or(DEFAULT_BIT_RATE), DEFAULT_SERIAL_BAUD)
            .map(|t| Box::new(t) as Box<dyn Transport>),
    };
    opened.map_err(|source| FlashError::TransportOpenFailed {
        channel: channel.to_string(),
        source,
    })
}

// Run blocking adapter I/O on tokio's blocking pool
pub(crate) async fn run_blocking<R, F>(f: F) -> Result<R, TransportError>
where
    R: Send + 'static,
    F: FnOnce() -> Result<R, TransportError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::Io(std::io::Error::other(e)))?
}
