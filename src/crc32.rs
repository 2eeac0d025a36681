//! CRC32 calculation for RAR archives.
//!
//! Both format generations use the standard reflected CRC32 (polynomial
//! 0xEDB88320). RAR4 block headers store only its low 16 bits.

/// CRC32 of `data`.
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// RAR4 header checksum: low half of the CRC32.
pub fn crc16(data: &[u8]) -> u16 {
    (crc32(data) & 0xFFFF) as u16
}
