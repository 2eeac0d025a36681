//! RAR5 end of archive header parser.
//!
//! The end header marks the end of the archive. Its only flag says whether
//! the archive continues in another volume.

use super::{Rar5Block, Rar5HeaderType, VintReader};
use crate::error::{RarError, Result};

/// Parsed RAR5 end of archive header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rar5EndHeader {
    pub has_next_volume: bool,
}

pub struct Rar5EndHeaderParser;

impl Rar5EndHeaderParser {
    pub fn parse(block: &Rar5Block<'_>) -> Result<Rar5EndHeader> {
        if block.header_type != Rar5HeaderType::End as u64 {
            return Err(RarError::corrupt("expected end of archive header"));
        }
        let flags = VintReader::new(block.body)
            .read()
            .ok_or_else(|| RarError::corrupt("malformed end of archive header"))?;
        Ok(Rar5EndHeader {
            has_next_volume: flags & 0x0001 != 0,
        })
    }
}
