//! Linux SocketCAN backend

use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use socketcan::{CanFrame as RawFrame, CanInterface, CanSocket, EmbeddedFrame, Id, Socket, StandardId};

use super::run_blocking;
use crate::error::TransportError;
use crate::packets::CanFrame;
use crate::transport::Transport;

/// Transport over a SocketCAN network interface such as `can0` or `vcan0`
///
/// The socket is blocking; every call runs on tokio's blocking pool so the
/// runtime is never stalled by a read timeout.
pub struct SocketCanTransport {
    interface: String,
    socket: Option<Arc<CanSocket>>,
}

impl SocketCanTransport {
    /// Open `interface` for exclusive use by the session
    ///
    /// With a `bit_rate`, the interface is brought down, reconfigured through
    /// netlink and brought up again, which needs `CAP_NET_ADMIN`. Without one,
    /// the interface is used as currently configured.
    pub fn open(interface: &str, bit_rate: Option<u32>) -> Result<Self, TransportError> {
        if let Some(bit_rate) = bit_rate {
            set_bit_rate(interface, bit_rate)?;
        }

        let socket = CanSocket::open(interface)?;
        info!("Opened SocketCAN interface {interface}");

        Ok(SocketCanTransport {
            interface: interface.to_string(),
            socket: Some(Arc::new(socket)),
        })
    }

    fn socket(&self) -> Result<Arc<CanSocket>, TransportError> {
        self.socket.clone().ok_or(TransportError::Closed)
    }
}

fn set_bit_rate(interface: &str, bit_rate: u32) -> Result<(), TransportError> {
    let netlink = |e: &dyn std::fmt::Debug| TransportError::Netlink(format!("{interface}: {e:?}"));

    let iface = CanInterface::open(interface).map_err(|e| netlink(&e))?;
    iface.bring_down().map_err(|e| netlink(&e))?;
    iface.set_bitrate(bit_rate, None::<u32>).map_err(|e| netlink(&e))?;
    iface.bring_up().map_err(|e| netlink(&e))?;

    info!("Set {interface} bit rate to {bit_rate} bit/s");
    Ok(())
}

fn to_raw(frame: &CanFrame) -> Result<RawFrame, TransportError> {
    let id = u16::try_from(frame.id())
        .ok()
        .and_then(StandardId::new)
        .ok_or_else(|| TransportError::InvalidFrame(format!("0x{:X} is not a standard identifier", frame.id())))?;
    RawFrame::new(id, frame.data()).ok_or_else(|| TransportError::InvalidFrame(format!("{frame}")))
}

fn from_raw(raw: &RawFrame) -> CanFrame {
    let id = match raw.id() {
        Id::Standard(id) => u32::from(id.as_raw()),
        Id::Extended(id) => id.as_raw(),
    };
    match raw {
        RawFrame::Error(_) => CanFrame::error(id, raw.data()),
        // Data and remote frames both fit in eight bytes
        _ => CanFrame::new(id, raw.data()).unwrap_or_else(|| CanFrame::error(id, raw.data())),
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

#[async_trait]
impl Transport for SocketCanTransport {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        let socket = self.socket()?;
        let raw = to_raw(frame)?;
        run_blocking(move || socket.write_frame(&raw).map_err(TransportError::from)).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let socket = self.socket()?;
        run_blocking(move || match socket.read_frame_timeout(timeout) {
            Ok(raw) => Ok(Some(from_raw(&raw))),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let socket = self.socket()?;
        run_blocking(move || {
            socket.set_nonblocking(true)?;
            let mut dropped = 0usize;
            let result = loop {
                match socket.read_frame() {
                    Ok(_) => dropped += 1,
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            socket.set_nonblocking(false)?;
            if dropped > 0 {
                debug!("Flushed {dropped} stale frames");
            }
            result.map_err(TransportError::from)
        })
        .await
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.socket.take().is_some() {
            info!("Closed SocketCAN interface {}", self.interface);
        }
        Ok(())
    }
}
