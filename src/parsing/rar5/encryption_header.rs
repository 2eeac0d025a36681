//! RAR5 archive encryption header parser.
//!
//! The archive encryption header (type 4) appears in archives with encrypted
//! headers, right after the signature. Every header after it is preceded by
//! a 16-byte IV and encrypted with AES-256-CBC, padded to the block size.

use super::{Rar5Block, Rar5HeaderType};
use crate::crypto::Rar5EncryptionInfo;
use crate::error::{RarError, Result};

pub struct Rar5EncryptionHeaderParser;

impl Rar5EncryptionHeaderParser {
    pub fn parse(block: &Rar5Block<'_>) -> Result<Rar5EncryptionInfo> {
        if block.header_type != Rar5HeaderType::Encryption as u64 {
            return Err(RarError::corrupt("expected archive encryption header"));
        }
        Ok(Rar5EncryptionInfo::parse_archive_header(block.body)?)
    }
}
