//! # Crate to flash firmware through a CAN bus bootloader
//!
//! This crate pushes a binary application image to a microcontroller whose
//! bootloader listens on a CAN bus. It works with Linux SocketCAN interfaces
//! and with serial-line (SLCAN) USB adapters.
//!
//! # Bootloader protocol
//!
//! The exchange is strictly half-duplex, one command at a time:
//!
//! 1. The host sends *enter bootloader* (`0x02`) and waits for an acknowledgment.
//! 2. The image is cut into 8-byte chunks, the last one padded with `0xFF`.
//!    Each chunk is sent in a *data chunk* frame (`0x03`) and has to be
//!    acknowledged before the next one is sent. A negative acknowledgment or a
//!    timeout makes the host send the same chunk again, up to 5 times.
//! 3. The host sends *done flashing* (`0x04`) carrying the CRC-32 of the whole
//!    image. The target checks it and starts the application.
//!
//! The target answers with `0x7FE` (ack), `0x7FF` (nack, send again) or
//! `0x7D0` (ack sent by the target's self-test path). Any other frame on the
//! bus is ignored.
//!
//! A lost final acknowledgment is reported as the soft error
//! [`FlashError::FinalAckMissing`]: every chunk was accepted, and the target has
//! most likely started the new application.
//!
//! See `src/main.rs` for a complete command line tool using this crate.

#![deny(missing_docs)]

pub mod backend;
pub mod bootloader;
mod checksum;
pub mod config;
mod error;
pub mod image;
pub mod packets;
mod session;
mod transport;

pub use bootloader::Bootloader;
pub use checksum::crc32;
pub use config::FlashConfig;
pub use error::{FlashError, TransportError};
pub use image::FirmwareImage;
pub use session::{FailureReason, Phase, SessionReport, TransferSession, flash_image, flash_image_with_progress, probe_application};
pub use transport::{CloseOnDrop, Transport, wait_for, wait_for_verdict};
