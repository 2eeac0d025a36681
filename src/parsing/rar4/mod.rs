//! RAR 1.5 to 4.x block parsing.
//!
//! Every block starts with the same 7-byte base header:
//!
//! | Field     | Size | Notes                                         |
//! |-----------|------|-----------------------------------------------|
//! | HEAD_CRC  | 2    | low 16 bits of CRC32 over bytes `2..HEAD_SIZE` |
//! | HEAD_TYPE | 1    | block type                                     |
//! | HEAD_FLAGS| 2    | 0x8000 means a 4-byte ADD_SIZE follows          |
//! | HEAD_SIZE | 2    | total header size including this base          |
//!
//! ADD_SIZE counts the data bytes that follow the header. For file blocks it
//! is the PACK_SIZE field.

pub mod archive_header;
pub mod file_header;

pub use archive_header::{Rar4EndHeader, Rar4MainHeader, Rar4MainHeaderParser};
pub use file_header::{decode_unicode_name, Rar4FileFlags, Rar4FileHeader, Rar4FileHeaderParser};

use crate::crc32::crc16;
use crate::error::{RarError, Result};

/// Block types.
pub const HEAD_MARK: u8 = 0x72;
pub const HEAD_MAIN: u8 = 0x73;
pub const HEAD_FILE: u8 = 0x74;
pub const HEAD_COMMENT: u8 = 0x75;
pub const HEAD_AV: u8 = 0x76;
pub const HEAD_SUB: u8 = 0x77;
pub const HEAD_PROTECT: u8 = 0x78;
pub const HEAD_SIGN: u8 = 0x79;
pub const HEAD_SERVICE: u8 = 0x7a;
pub const HEAD_END: u8 = 0x7b;

/// ADD_SIZE present.
pub const LONG_BLOCK: u16 = 0x8000;

/// Common prefix of every RAR4 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rar4BlockHeader {
    pub crc: u16,
    pub header_type: u8,
    pub flags: u16,
    pub head_size: u16,
    pub add_size: u32,
}

impl Rar4BlockHeader {
    /// Size of the data area following the header.
    pub fn data_size(&self) -> u64 {
        if self.flags & LONG_BLOCK != 0 {
            u64::from(self.add_size)
        } else {
            0
        }
    }
}

pub struct Rar4BlockParser;

impl Rar4BlockParser {
    pub const HEADER_SIZE: usize = 7;

    /// Parse the base fields. `buffer` must hold at least the first 7 bytes;
    /// ADD_SIZE is read when present and available.
    pub fn parse(buffer: &[u8]) -> Result<Rar4BlockHeader> {
        if buffer.len() < Self::HEADER_SIZE {
            return Err(RarError::truncated("block header is incomplete"));
        }
        let crc = u16::from_le_bytes([buffer[0], buffer[1]]);
        let header_type = buffer[2];
        let flags = u16::from_le_bytes([buffer[3], buffer[4]]);
        let head_size = u16::from_le_bytes([buffer[5], buffer[6]]);

        let min_size = if flags & LONG_BLOCK != 0 { 11 } else { 7 };
        if usize::from(head_size) < min_size {
            return Err(RarError::corrupt(format!(
                "block header size {head_size} is too small"
            )));
        }

        let add_size = match buffer.get(7..11) {
            Some(b) if flags & LONG_BLOCK != 0 => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            _ => 0,
        };

        Ok(Rar4BlockHeader {
            crc,
            header_type,
            flags,
            head_size,
            add_size,
        })
    }

    /// Check the stored CRC16 against the full header bytes.
    pub fn verify(header: &Rar4BlockHeader, bytes: &[u8]) -> bool {
        let end = usize::from(header.head_size).min(bytes.len());
        end >= Self::HEADER_SIZE && crc16(&bytes[2..end]) == header.crc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(header_type: u8, flags: u16, body: &[u8]) -> Vec<u8> {
        let size = (7 + body.len()) as u16;
        let mut out = vec![0, 0, header_type];
        out.extend_from_slice(&flags.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(body);
        let crc = crc16(&out[2..]);
        out[..2].copy_from_slice(&crc.to_le_bytes());
        out
    }

    #[test]
    fn test_parse_and_verify() {
        let bytes = block(HEAD_MAIN, 0, &[0; 6]);
        let header = Rar4BlockParser::parse(&bytes).unwrap();
        assert_eq!(header.header_type, HEAD_MAIN);
        assert_eq!(header.head_size, 13);
        assert_eq!(header.data_size(), 0);
        assert!(Rar4BlockParser::verify(&header, &bytes));
    }

    #[test]
    fn test_long_block_data_size() {
        let bytes = block(HEAD_PROTECT, LONG_BLOCK, &500u32.to_le_bytes());
        let header = Rar4BlockParser::parse(&bytes).unwrap();
        assert_eq!(header.data_size(), 500);
    }

    #[test]
    fn test_crc_mismatch() {
        let mut bytes = block(HEAD_MAIN, 0, &[0; 6]);
        bytes[8] ^= 1;
        let header = Rar4BlockParser::parse(&bytes).unwrap();
        assert!(!Rar4BlockParser::verify(&header, &bytes));
    }

    #[test]
    fn test_undersized_header_is_corrupt() {
        let bytes = [0, 0, HEAD_MAIN, 0, 0, 3, 0];
        let err = Rar4BlockParser::parse(&bytes).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptHeader);
    }
}
