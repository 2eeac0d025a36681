//! RAR5 main archive header parser.
//!
//! The main archive header appears once after the signature (or after the
//! encryption header) and carries archive-level flags. Its extra area may
//! hold a locator record pointing at the quick-open data; it is not needed
//! for sequential reading and is ignored.

use super::{Rar5Block, Rar5HeaderType, VintReader};
use crate::error::{RarError, Result};

/// RAR5 archive flags (specific to main header).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rar5ArchiveFlags {
    /// Archive is part of multi-volume set
    pub is_volume: bool,
    /// Volume number field is present
    pub has_volume_number: bool,
    /// Solid archive
    pub is_solid: bool,
    /// Recovery record present
    pub has_recovery_record: bool,
    /// Archive is locked
    pub is_locked: bool,
}

impl From<u64> for Rar5ArchiveFlags {
    fn from(flags: u64) -> Self {
        Self {
            is_volume: flags & 0x0001 != 0,
            has_volume_number: flags & 0x0002 != 0,
            is_solid: flags & 0x0004 != 0,
            has_recovery_record: flags & 0x0008 != 0,
            is_locked: flags & 0x0010 != 0,
        }
    }
}

/// Parsed RAR5 main archive header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rar5ArchiveHeader {
    pub archive_flags: Rar5ArchiveFlags,
    /// Zero-based volume number; absent on the first volume.
    pub volume_number: Option<u64>,
}

pub struct Rar5ArchiveHeaderParser;

impl Rar5ArchiveHeaderParser {
    pub fn parse(block: &Rar5Block<'_>) -> Result<Rar5ArchiveHeader> {
        if block.header_type != Rar5HeaderType::Main as u64 {
            return Err(RarError::corrupt(format!(
                "expected main archive header, found type {}",
                block.header_type
            )));
        }
        let bad = || RarError::corrupt("malformed main archive header");
        let mut reader = VintReader::new(block.body);
        let archive_flags = Rar5ArchiveFlags::from(reader.read().ok_or_else(bad)?);
        let volume_number = if archive_flags.has_volume_number {
            Some(reader.read().ok_or_else(bad)?)
        } else {
            None
        };

        Ok(Rar5ArchiveHeader {
            archive_flags,
            volume_number,
        })
    }
}
