//! RAR5 format parsing modules.
//!
//! RAR5 uses a completely different header format than RAR4:
//! - Variable-length integers (vint) for sizes
//! - CRC-32 instead of CRC-16
//! - Different header type codes
//! - Optional extra area of typed records at the end of a header
//!
//! Generic layout:
//!
//! ```text
//! CRC32 u32 | HEADER_SIZE vint | TYPE vint | FLAGS vint |
//! [EXTRA_SIZE vint] | [DATA_SIZE vint] | type fields ... | extra area
//! ```

mod vint;

pub mod archive_header;
pub mod encryption_header;
pub mod end_header;
pub mod file_header;

pub use archive_header::{Rar5ArchiveHeader, Rar5ArchiveHeaderParser};
pub use encryption_header::Rar5EncryptionHeaderParser;
pub use end_header::{Rar5EndHeader, Rar5EndHeaderParser};
pub use file_header::{Rar5CompressionInfo, Rar5FileFlags, Rar5FileHeader, Rar5FileHeaderParser};
pub use vint::{read_vint, VintReader};

use crate::crc32::crc32;
use crate::error::{RarError, Result};

/// Headers larger than this are rejected as corrupt.
pub const MAX_HEADER_SIZE: u64 = 0x200000;

/// RAR5 header type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Rar5HeaderType {
    /// Main archive header
    Main = 1,
    /// File header
    File = 2,
    /// Service header (e.g., NTFS streams, ACL, comment)
    Service = 3,
    /// Encryption header
    Encryption = 4,
    /// End of archive header
    End = 5,
}

impl TryFrom<u64> for Rar5HeaderType {
    type Error = ();

    fn try_from(value: u64) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Main),
            2 => Ok(Self::File),
            3 => Ok(Self::Service),
            4 => Ok(Self::Encryption),
            5 => Ok(Self::End),
            _ => Err(()),
        }
    }
}

/// RAR5 common header flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rar5HeaderFlags {
    /// Extra area is present after header
    pub has_extra_area: bool,
    /// Data area is present after header
    pub has_data_area: bool,
    /// Skip header if unknown type
    pub skip_if_unknown: bool,
    /// Data continues from previous volume
    pub split_before: bool,
    /// Data continues in next volume
    pub split_after: bool,
}

impl From<u64> for Rar5HeaderFlags {
    fn from(flags: u64) -> Self {
        Self {
            has_extra_area: flags & 0x0001 != 0,
            has_data_area: flags & 0x0002 != 0,
            skip_if_unknown: flags & 0x0004 != 0,
            split_before: flags & 0x0008 != 0,
            split_after: flags & 0x0010 != 0,
        }
    }
}

/// A checked header split into its generic parts.
#[derive(Debug, Clone, Copy)]
pub struct Rar5Block<'a> {
    pub header_type: u64,
    pub flags: Rar5HeaderFlags,
    pub data_size: u64,
    /// Type-specific fields.
    pub body: &'a [u8],
    /// Extra area records.
    pub extra: &'a [u8],
}

pub struct Rar5BlockParser;

impl Rar5BlockParser {
    /// Bytes that always suffice to compute the header length.
    pub const PREFIX_SIZE: usize = 7;

    /// Total header length (CRC and size field included) from its first
    /// bytes.
    pub fn header_len(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < 5 {
            return Err(RarError::truncated("block header is incomplete"));
        }
        let (size, consumed) = match read_vint(&prefix[4..]) {
            Some(v) => v,
            None if prefix.len() < Self::PREFIX_SIZE => {
                return Err(RarError::truncated("block header is incomplete"))
            }
            None => return Err(RarError::corrupt("invalid header size")),
        };
        if size == 0 || size > MAX_HEADER_SIZE {
            return Err(RarError::corrupt(format!("invalid header size {size}")));
        }
        Ok(4 + consumed + size as usize)
    }

    /// Verify the CRC and split the generic fields. `header` is exactly the
    /// length reported by [`header_len`](Self::header_len).
    pub fn parse(header: &[u8]) -> Result<Rar5Block<'_>> {
        if header.len() < 5 {
            return Err(RarError::truncated("block header is incomplete"));
        }
        let stored = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if crc32(&header[4..]) != stored {
            return Err(RarError::corrupt("header CRC mismatch"));
        }

        let bad = || RarError::corrupt("malformed block header");
        let mut reader = VintReader::new(&header[4..]);
        reader.read().ok_or_else(bad)?;
        let header_type = reader.read().ok_or_else(bad)?;
        let flags = Rar5HeaderFlags::from(reader.read().ok_or_else(bad)?);
        let extra_size = if flags.has_extra_area {
            reader.read_usize().ok_or_else(bad)?
        } else {
            0
        };
        let data_size = if flags.has_data_area {
            reader.read().ok_or_else(bad)?
        } else {
            0
        };

        let rest = reader.remaining();
        if extra_size > rest.len() {
            return Err(bad());
        }
        let (body, extra) = rest.split_at(rest.len() - extra_size);

        Ok(Rar5Block {
            header_type,
            flags,
            data_size,
            body,
            extra,
        })
    }
}

/// One record of an extra area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtraRecord<'a> {
    pub record_type: u64,
    pub data: &'a [u8],
}

/// Iterate the records of an extra area. A malformed record ends the
/// iteration with an error.
pub fn extra_records(extra: &[u8]) -> impl Iterator<Item = Result<ExtraRecord<'_>>> {
    let mut pos = 0usize;
    std::iter::from_fn(move || {
        if pos >= extra.len() {
            return None;
        }
        let parsed = (|| {
            let mut reader = VintReader::new(&extra[pos..]);
            let size = reader.read_usize()?;
            let size_len = reader.position();
            let record_type = reader.read()?;
            let type_len = reader.position() - size_len;
            let data_len = size.checked_sub(type_len)?;
            let data = reader.read_bytes(data_len)?;
            Some((ExtraRecord { record_type, data }, size_len + size))
        })();
        match parsed {
            Some((record, consumed)) => {
                pos += consumed;
                Some(Ok(record))
            }
            None => {
                pos = extra.len();
                Some(Err(RarError::corrupt("malformed extra area record")))
            }
        }
    })
}

#[cfg(test)]
pub(crate) fn build_header(header_type: u64, flags: u64, fields: &[u8], extra: &[u8], data_size: Option<u64>) -> Vec<u8> {
    fn vint(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let b = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(b);
                break;
            }
            out.push(b | 0x80);
        }
    }
    let mut flags = flags;
    if !extra.is_empty() {
        flags |= 0x01;
    }
    if data_size.is_some() {
        flags |= 0x02;
    }
    let mut body = Vec::new();
    vint(header_type, &mut body);
    vint(flags, &mut body);
    if !extra.is_empty() {
        vint(extra.len() as u64, &mut body);
    }
    if let Some(size) = data_size {
        vint(size, &mut body);
    }
    body.extend_from_slice(fields);
    body.extend_from_slice(extra);
    let mut sized = Vec::new();
    vint(body.len() as u64, &mut sized);
    sized.extend_from_slice(&body);
    let mut out = crc32(&sized).to_le_bytes().to_vec();
    out.extend_from_slice(&sized);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_round() {
        let header = build_header(5, 0, &[0x00], &[], None);
        assert_eq!(Rar5BlockParser::header_len(&header).unwrap(), header.len());
        let block = Rar5BlockParser::parse(&header).unwrap();
        assert_eq!(block.header_type, 5);
        assert_eq!(block.body, &[0x00]);
        assert!(block.extra.is_empty());
    }

    #[test]
    fn test_extra_and_data_areas() {
        let extra = [0x02, 0x07, 0xAA];
        let header = build_header(2, 0, &[1, 2, 3], &extra, Some(1000));
        let block = Rar5BlockParser::parse(&header).unwrap();
        assert_eq!(block.data_size, 1000);
        assert_eq!(block.body, &[1, 2, 3]);
        let records: Vec<_> = extra_records(block.extra).collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_type, 7);
        assert_eq!(records[0].data, &[0xAA]);
    }

    #[test]
    fn test_crc_mismatch_is_corrupt() {
        let mut header = build_header(1, 0, &[0x00], &[], None);
        let last = header.len() - 1;
        header[last] ^= 0x40;
        let err = Rar5BlockParser::parse(&header).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::CorruptHeader);
    }

    #[test]
    fn test_header_len_limits() {
        assert_eq!(
            Rar5BlockParser::header_len(&[0, 0, 0, 0]).unwrap_err().kind(),
            crate::error::ErrorKind::Truncated
        );
        assert_eq!(
            Rar5BlockParser::header_len(&[0, 0, 0, 0, 0]).unwrap_err().kind(),
            crate::error::ErrorKind::CorruptHeader
        );
        assert_eq!(
            Rar5BlockParser::header_len(&[0, 0, 0, 0, 0xff, 0xff, 0xff]).unwrap_err().kind(),
            crate::error::ErrorKind::CorruptHeader
        );
    }

    #[test]
    fn test_malformed_extra_record() {
        let records: Vec<_> = extra_records(&[0x09, 0x01]).collect();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_err());
    }
}
