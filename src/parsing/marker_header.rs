//! Marker header: the RAR signature that opens every archive.
//!
//! RAR 1.5 to 4.x: `52 61 72 21 1A 07 00`
//! RAR 5.0+:       `52 61 72 21 1A 07 01 00`
//!
//! Self-extracting archives prefix the signature with an executable stub, so
//! the marker is searched for when it is not at offset 0.

use crate::error::{ErrorKind, RarError, Result};
use crate::file_media::FileMedia;
use crate::formats::{Signature, SignatureMatch, MAX_SFX_SIZE};

use super::ArchiveVersion;

/// Location of the signature within the media.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkerHeader {
    pub version: ArchiveVersion,
    /// Offset of the signature; non-zero for self-extracting archives.
    pub offset: u64,
    /// Offset of the first block header.
    pub headers_start: u64,
}

pub struct MarkerHeaderParser;

impl MarkerHeaderParser {
    /// Bytes that suffice to classify a signature at offset 0.
    pub const HEADER_SIZE: usize = 8;

    /// Classify `buffer`, which holds the first bytes of the media.
    pub fn parse(buffer: &[u8]) -> Result<MarkerHeader> {
        if buffer.is_empty() {
            return Err(RarError::new(ErrorKind::NotAnArchive, "archive is empty"));
        }
        match Signature::find(buffer) {
            SignatureMatch::Found { signature, offset } => {
                let version = match signature {
                    Signature::Rar15 => ArchiveVersion::V4,
                    Signature::Rar50 => ArchiveVersion::V5,
                };
                Ok(MarkerHeader {
                    version,
                    offset,
                    headers_start: offset + signature.size(),
                })
            }
            SignatureMatch::Unsupported { offset } => Err(RarError::new(
                ErrorKind::UnsupportedVersion,
                format!("unsupported RAR signature at offset {offset}"),
            )),
            SignatureMatch::Incomplete => Err(RarError::truncated(
                "archive is shorter than the RAR signature",
            )),
            SignatureMatch::Missing => Err(RarError::from_kind(ErrorKind::NotAnArchive)),
        }
    }

    /// Read the head of `media` and locate the signature.
    pub fn locate(media: &dyn FileMedia) -> Result<MarkerHeader> {
        let want = media.length().min(MAX_SFX_SIZE as u64) as usize;
        let mut buffer = vec![0u8; want];
        let got = media.read_at(0, &mut buffer)?;
        buffer.truncate(got);
        Self::parse(&buffer)
    }
}
