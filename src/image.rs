//! # Firmware image and chunking
//!
//! A [`FirmwareImage`] is validated once, when it is loaded, against the
//! capacity of the target flash region. It is then cut into fixed-size
//! [`Chunk`]s, each one carried by a single data chunk frame.

use std::io::ErrorKind;
use std::path::Path;

use crate::checksum;
use crate::error::FlashError;

/// Fill byte appended to the last chunk when the image is not a multiple of the chunk size
pub const PAD_BYTE: u8 = 0xFF;

/// Immutable firmware image, `0 < len <= max_size`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
}

impl FirmwareImage {
    /// Create an image from raw bytes
    ///
    /// # Errors
    ///
    /// [`FlashError::ImageEmpty`] if `data` is empty,
    /// [`FlashError::ImageTooLarge`] if it is longer than `max_size`.
    pub fn from_bytes(data: Vec<u8>, max_size: usize) -> Result<Self, FlashError> {
        if data.is_empty() {
            return Err(FlashError::ImageEmpty);
        }
        if data.len() > max_size {
            return Err(FlashError::ImageTooLarge {
                size: data.len(),
                max: max_size,
            });
        }
        Ok(FirmwareImage { data })
    }

    /// Read an image from a binary file
    ///
    /// # Errors
    ///
    /// [`FlashError::ImageNotFound`] if the file does not exist,
    /// [`FlashError::ImageRead`] for any other I/O error, plus the errors of
    /// [`from_bytes`](Self::from_bytes).
    pub fn load(path: impl AsRef<Path>, max_size: usize) -> Result<Self, FlashError> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| match e.kind() {
            ErrorKind::NotFound => FlashError::ImageNotFound(path.to_path_buf()),
            _ => FlashError::ImageRead {
                path: path.to_path_buf(),
                source: e,
            },
        })?;
        Self::from_bytes(data, max_size)
    }

    /// Image length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` if the image holds no bytes (never the case for a loaded image)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw image bytes, unpadded
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// CRC-32 of the unpadded image
    pub fn crc32(&self) -> u32 {
        checksum::crc32(&self.data)
    }

    /// Number of chunks of `chunk_size` bytes needed to carry the image
    pub fn chunk_count(&self, chunk_size: usize) -> usize {
        self.data.len().div_ceil(chunk_size)
    }

    /// Chunk at `index`, or `None` past the end of the image
    pub fn chunk(&self, index: usize, chunk_size: usize) -> Option<Chunk> {
        let start = index.checked_mul(chunk_size)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + chunk_size).min(self.data.len());

        let mut payload = Vec::with_capacity(chunk_size);
        payload.extend_from_slice(&self.data[start..end]);
        payload.resize(chunk_size, PAD_BYTE);

        Some(Chunk { index, payload })
    }

    /// Iterate over the chunks of the image, in order
    ///
    /// Each call starts again from chunk 0 and yields byte-identical chunks.
    ///
    /// # Panics
    ///
    /// Panics if `chunk_size` is zero
    pub fn chunks(&self, chunk_size: usize) -> Chunks<'_> {
        assert!(chunk_size > 0, "chunk size must be non-zero");
        Chunks {
            image: self,
            chunk_size,
            next: 0,
        }
    }
}

/// Fixed-size window into the image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    index: usize,
    payload: Vec<u8>,
}

impl Chunk {
    /// Position of the chunk in the image, starting at 0
    pub fn index(&self) -> usize {
        self.index
    }

    /// Chunk bytes, padded with [`PAD_BYTE`] to the chunk size
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Lazy iterator over the chunks of a [`FirmwareImage`]
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    image: &'a FirmwareImage,
    chunk_size: usize,
    next: usize,
}

impl Iterator for Chunks<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        let chunk = self.image.chunk(self.next, self.chunk_size)?;
        self.next += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.image.chunk_count(self.chunk_size).saturating_sub(self.next);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks<'_> {}
