//! Session configuration.

use std::time::Duration;

use crate::error::FlashError;
use crate::packets::{CommandIds, MAX_FRAME_DATA, MAX_STANDARD_ID, ResponseIds};

/// Default capacity of the application flash region
pub const DEFAULT_MAX_IMAGE_SIZE: usize = 96 * 1024;

/// Protocol parameters of one flashing session
///
/// Immutable for the lifetime of a session. The [`Default`] value matches the
/// bootloader shipped with the targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashConfig {
    /// Wait for the acknowledgment of the enter bootloader command
    pub entry_timeout: Duration,
    /// Wait for the acknowledgment of each data chunk transmission
    pub chunk_timeout: Duration,
    /// Wait for the acknowledgment of the done flashing command
    pub finalize_timeout: Duration,
    /// Transmissions of one chunk before the session gives up
    pub max_retries: u32,
    /// Payload bytes per data chunk frame
    pub chunk_size: usize,
    /// Largest accepted image, in bytes
    pub max_image_size: usize,
    /// Command frame identifiers
    pub command_ids: CommandIds,
    /// Response frame identifiers
    pub response_ids: ResponseIds,
}

impl Default for FlashConfig {
    fn default() -> Self {
        FlashConfig {
            entry_timeout: Duration::from_millis(5000),
            chunk_timeout: Duration::from_millis(5000),
            finalize_timeout: Duration::from_millis(2000),
            max_retries: 5,
            chunk_size: 8,
            max_image_size: DEFAULT_MAX_IMAGE_SIZE,
            command_ids: CommandIds::default(),
            response_ids: ResponseIds::default(),
        }
    }
}

impl FlashConfig {
    /// Check the parameters against the limits of the bus and the protocol
    pub fn validate(&self) -> Result<(), FlashError> {
        if self.chunk_size == 0 || self.chunk_size > MAX_FRAME_DATA {
            return Err(FlashError::InvalidConfig(format!(
                "chunk size {} outside 1..={}",
                self.chunk_size, MAX_FRAME_DATA
            )));
        }
        if self.max_retries == 0 {
            return Err(FlashError::InvalidConfig("max retries must be at least 1".into()));
        }
        if self.max_image_size == 0 {
            return Err(FlashError::InvalidConfig("max image size must be non-zero".into()));
        }
        let ids = self.command_ids.all().into_iter().chain(self.response_ids.all());
        if let Some(id) = ids.into_iter().find(|&id| id > MAX_STANDARD_ID) {
            return Err(FlashError::InvalidConfig(format!(
                "identifier 0x{id:X} is not a standard 11-bit identifier"
            )));
        }
        Ok(())
    }

    /// Longest possible session duration for `chunk_count` chunks
    ///
    /// There is no global deadline: every wait has its own timeout, so the
    /// worst case is every chunk exhausting its retries on timeouts.
    pub fn worst_case_duration(&self, chunk_count: usize) -> Duration {
        let per_chunk = self.chunk_timeout.saturating_mul(self.max_retries);
        let chunks = u32::try_from(chunk_count).unwrap_or(u32::MAX);
        self.entry_timeout
            .saturating_add(per_chunk.saturating_mul(chunks))
            .saturating_add(self.finalize_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        FlashConfig::default().validate().unwrap();
    }

    #[test]
    fn chunk_size_must_fit_in_a_frame() {
        for chunk_size in [0, 9] {
            let config = FlashConfig { chunk_size, ..FlashConfig::default() };
            assert!(matches!(config.validate(), Err(FlashError::InvalidConfig(_))));
        }
    }

    #[test]
    fn zero_retries_is_rejected() {
        let config = FlashConfig { max_retries: 0, ..FlashConfig::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn extended_identifiers_are_rejected() {
        let mut config = FlashConfig::default();
        config.response_ids.test_ack = 0x800;
        assert!(config.validate().is_err());
    }

    #[test]
    fn worst_case_duration() {
        let config = FlashConfig::default();
        assert_eq!(config.worst_case_duration(2), Duration::from_millis(5000 + 2 * 5 * 5000 + 2000));
    }
}
