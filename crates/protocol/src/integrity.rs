//! Checksums for capture frames
//!
//! Every capture frame carries a CRC32 of its payload so that a truncated
//! or partially overwritten capture file is detected on read instead of
//! decoding into garbage records.

use crc32fast::Hasher;

/// Compute the CRC32 of a frame payload
#[inline]
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Verify a frame payload against its stored CRC32
#[inline]
pub fn verify_checksum(data: &[u8], expected_checksum: u32) -> bool {
    compute_checksum(data) == expected_checksum
}
