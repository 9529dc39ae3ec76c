//! Whole-image integrity value sent with the done flashing command.

use crc::{CRC_32_ISO_HDLC, Crc};

// Reflected polynomial 0xEDB88320, init 0xFFFFFFFF, xorout 0xFFFFFFFF (zlib/PNG variant)
const IMAGE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of `data`
pub fn crc32(data: &[u8]) -> u32 {
    IMAGE_CRC.checksum(data)
}
