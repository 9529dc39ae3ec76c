//! # CAN transport
//!
//! The protocol only needs four things from a CAN adapter: send a frame,
//! receive a frame with a bounded wait, drop whatever is buffered, and
//! release the adapter. Each backend in [`crate::backend`] implements
//! [`Transport`]; the protocol never depends on a concrete backend.
//!
//! The transport is used as a half-duplex link: a command is sent, then the
//! caller waits for the response before sending anything else.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::time::Instant;

use crate::error::TransportError;
use crate::packets::{CanFrame, ResponseIds, Verdict};

// Granularity of the receive calls making up a bounded wait
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Capability consumed by the protocol core
///
/// Backends are opened by their own constructor (channel name and bit rate)
/// and own the adapter exclusively until [`close`](Transport::close).
#[async_trait]
pub trait Transport: Send {
    /// Send one frame
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError>;

    /// Receive one frame, waiting at most `timeout`
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;

    /// Discard any received frame not yet read
    async fn flush(&mut self) -> Result<(), TransportError>;

    /// Release the adapter
    ///
    /// Must be safe to call more than once.
    fn close(&mut self) -> Result<(), TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        (**self).receive(timeout).await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush().await
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for &mut T {
    async fn send(&mut self, frame: &CanFrame) -> Result<(), TransportError> {
        (**self).send(frame).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        (**self).receive(timeout).await
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        (**self).flush().await
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }
}

/// Wait until `accept` picks a received frame, or `timeout` expires
///
/// Frames rejected by `accept` are logged and skipped without extending the
/// deadline. A receive error ends the wait early, like a timeout.
pub async fn wait_for<T, R, F>(transport: &mut T, timeout: Duration, mut accept: F) -> Option<R>
where
    T: Transport + ?Sized,
    F: FnMut(&CanFrame) -> Option<R>,
{
    let deadline = Instant::now() + timeout;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let slice = (deadline - now).min(POLL_INTERVAL);

        match transport.receive(slice).await {
            Ok(None) => continue,
            Ok(Some(frame)) => {
                debug!("RX {frame}");
                if let Some(result) = accept(&frame) {
                    return Some(result);
                }
            }
            Err(e) => {
                warn!("CAN error while waiting for response: {e}");
                return None;
            }
        }
    }
}

/// Wait for an `Ack` or `RetryNack` from the target
///
/// Never returns `Some(Verdict::Unrecognized)`: unrecognized frames are
/// skipped and `None` means no verdict arrived before the deadline.
pub async fn wait_for_verdict<T>(transport: &mut T, responses: &ResponseIds, timeout: Duration) -> Option<Verdict>
where
    T: Transport + ?Sized,
{
    wait_for(transport, timeout, |frame| match responses.classify(frame) {
        Verdict::Unrecognized => None,
        verdict => Some(verdict),
    })
    .await
}

/// Owns a transport and closes it when dropped
///
/// Guarantees the adapter is released on every exit path of a session,
/// including early returns and unwinding.
pub struct CloseOnDrop<T: Transport> {
    transport: T,
}

impl<T: Transport> CloseOnDrop<T> {
    /// Take ownership of `transport`
    pub fn new(transport: T) -> Self {
        CloseOnDrop { transport }
    }

    /// Borrow the guarded transport
    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }
}

impl<T: Transport> Drop for CloseOnDrop<T> {
    fn drop(&mut self) {
        match self.transport.close() {
            Ok(()) => debug!("CAN transport closed"),
            Err(e) => warn!("Failed to close CAN transport: {e}"),
        }
    }
}
