//! Main archive header and end-of-archive block.
//!
//! The main header follows the marker block and carries archive-level flags.
//! The optional end block closes the archive and tells whether another volume
//! follows.

use super::{Rar4BlockParser, HEAD_END, HEAD_MAIN};
use crate::error::{RarError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rar4MainHeader {
    pub flags: u16,
    pub high_pos_av: u16,
    pub pos_av: u32,
    pub encrypt_version: Option<u8>,
    // Parsed flags
    pub is_volume: bool,
    pub has_comment: bool,
    pub is_locked: bool,
    pub is_solid: bool,
    pub is_new_name_scheme: bool,
    pub has_auth_info: bool,
    pub has_recovery: bool,
    pub headers_encrypted: bool,
    pub is_first_volume: bool,
}

pub struct Rar4MainHeaderParser;

impl Rar4MainHeaderParser {
    pub const HEADER_SIZE: usize = 13;

    pub fn parse(buffer: &[u8]) -> Result<Rar4MainHeader> {
        let block = Rar4BlockParser::parse(buffer)?;
        if block.header_type != HEAD_MAIN {
            return Err(RarError::corrupt(format!(
                "expected main header, found block type {:#04x}",
                block.header_type
            )));
        }
        if buffer.len() < Self::HEADER_SIZE {
            return Err(RarError::corrupt("main header is too short"));
        }

        let flags = block.flags;
        let high_pos_av = u16::from_le_bytes([buffer[7], buffer[8]]);
        let pos_av = u32::from_le_bytes([buffer[9], buffer[10], buffer[11], buffer[12]]);
        let encrypt_version = if flags & 0x0200 != 0 {
            buffer.get(13).copied()
        } else {
            None
        };

        Ok(Rar4MainHeader {
            flags,
            high_pos_av,
            pos_av,
            encrypt_version,
            is_volume: flags & 0x0001 != 0,
            has_comment: flags & 0x0002 != 0,
            is_locked: flags & 0x0004 != 0,
            is_solid: flags & 0x0008 != 0,
            is_new_name_scheme: flags & 0x0010 != 0,
            has_auth_info: flags & 0x0020 != 0,
            has_recovery: flags & 0x0040 != 0,
            headers_encrypted: flags & 0x0080 != 0,
            is_first_volume: flags & 0x0100 != 0,
        })
    }
}

/// End-of-archive block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rar4EndHeader {
    pub next_volume: bool,
}

impl Rar4EndHeader {
    pub fn parse(buffer: &[u8]) -> Result<Self> {
        let block = Rar4BlockParser::parse(buffer)?;
        if block.header_type != HEAD_END {
            return Err(RarError::corrupt("expected end of archive block"));
        }
        Ok(Self {
            next_volume: block.flags & 0x0001 != 0,
        })
    }
}
