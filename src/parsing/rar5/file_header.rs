//! RAR5 file header parser.
//!
//! The file header contains information about each file in the archive,
//! including name, size, compression method and timestamps. Service headers
//! share the layout.
//!
//! Extra records understood here:
//!
//! | Type | Record     |
//! |------|------------|
//! | 0x01 | encryption |
//! | 0x02 | file hash  |
//! | 0x03 | file times |
//! | 0x05 | redirection (links) |

use super::{extra_records, Rar5Block, Rar5HeaderFlags, Rar5HeaderType, VintReader};
use crate::crypto::Rar5EncryptionInfo;
use crate::error::{RarError, Result};
use crate::formats::Timestamp;

const FHEXTRA_CRYPT: u64 = 0x01;
const FHEXTRA_HASH: u64 = 0x02;
const FHEXTRA_HTIME: u64 = 0x03;
const FHEXTRA_REDIR: u64 = 0x05;

const HASH_BLAKE2: u64 = 0x00;

/// RAR5 file flags (specific to file header).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rar5FileFlags {
    /// File is a directory
    pub is_directory: bool,
    /// File modification time is present
    pub has_mtime: bool,
    /// File CRC32 is present
    pub has_crc32: bool,
    /// Unpacked size is unknown
    pub unpacked_size_unknown: bool,
}

impl From<u64> for Rar5FileFlags {
    fn from(flags: u64) -> Self {
        Self {
            is_directory: flags & 0x0001 != 0,
            has_mtime: flags & 0x0002 != 0,
            has_crc32: flags & 0x0004 != 0,
            unpacked_size_unknown: flags & 0x0008 != 0,
        }
    }
}

/// RAR5 compression information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rar5CompressionInfo {
    /// Algorithm version: 0 is RAR 5.0, 1 is RAR 7.0
    pub version: u8,
    /// Continues the dictionary of the previous file
    pub is_solid: bool,
    /// Compression method (0 = store, 1-5 = compression levels)
    pub method: u8,
    /// Dictionary size as a shift of 128 KiB
    pub dict_shift: u8,
}

impl From<u64> for Rar5CompressionInfo {
    fn from(info: u64) -> Self {
        Self {
            version: (info & 0x3F) as u8,
            is_solid: (info >> 6) & 1 != 0,
            method: ((info >> 7) & 0x07) as u8,
            dict_shift: ((info >> 10) & 0x1F) as u8,
        }
    }
}

impl Rar5CompressionInfo {
    /// Dictionary size in bytes.
    pub fn dict_size(&self) -> u64 {
        0x20000u64 << self.dict_shift.min(31)
    }

    pub fn is_stored(&self) -> bool {
        self.method == 0
    }
}

/// Parsed RAR5 file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rar5FileHeader {
    pub header_flags: Rar5HeaderFlags,
    pub file_flags: Rar5FileFlags,
    pub unpacked_size: u64,
    pub attributes: u64,
    pub mtime: Option<Timestamp>,
    pub data_crc: Option<u32>,
    pub compression: Rar5CompressionInfo,
    pub host_os: u64,
    /// UTF-8 name bytes, `/` separated.
    pub raw_name: Vec<u8>,
    pub packed_size: u64,
    pub blake2: Option<[u8; 32]>,
    pub encryption: Option<Rar5EncryptionInfo>,
    /// Symbolic link, hard link or file copy reference.
    pub is_redirection: bool,
}

pub struct Rar5FileHeaderParser;

impl Rar5FileHeaderParser {
    pub fn parse(block: &Rar5Block<'_>) -> Result<Rar5FileHeader> {
        if block.header_type != Rar5HeaderType::File as u64
            && block.header_type != Rar5HeaderType::Service as u64
        {
            return Err(RarError::corrupt("expected file header"));
        }
        let bad = || RarError::corrupt("malformed file header");
        let mut reader = VintReader::new(block.body);

        let file_flags = Rar5FileFlags::from(reader.read().ok_or_else(bad)?);
        let unpacked_size = reader.read().ok_or_else(bad)?;
        let attributes = reader.read().ok_or_else(bad)?;
        let mut mtime = if file_flags.has_mtime {
            let secs = reader.read_u32_le().ok_or_else(bad)?;
            Some(Timestamp::from_unix_secs(i64::from(secs)))
        } else {
            None
        };
        let data_crc = if file_flags.has_crc32 {
            Some(reader.read_u32_le().ok_or_else(bad)?)
        } else {
            None
        };
        let compression = Rar5CompressionInfo::from(reader.read().ok_or_else(bad)?);
        let host_os = reader.read().ok_or_else(bad)?;
        let name_len = reader.read_usize().ok_or_else(bad)?;
        let raw_name = reader.read_bytes(name_len).ok_or_else(bad)?.to_vec();

        let mut blake2 = None;
        let mut encryption = None;
        let mut is_redirection = false;
        for record in extra_records(block.extra) {
            let record = record?;
            match record.record_type {
                FHEXTRA_CRYPT => {
                    encryption = Some(Rar5EncryptionInfo::parse_file_record(record.data)?);
                }
                FHEXTRA_HASH => {
                    let mut r = VintReader::new(record.data);
                    if r.read() == Some(HASH_BLAKE2) {
                        blake2 = Some(r.read_array::<32>().ok_or_else(bad)?);
                    }
                }
                FHEXTRA_HTIME => {
                    if let Some(t) = parse_mtime_record(record.data).ok_or_else(bad)? {
                        mtime = Some(t);
                    }
                }
                FHEXTRA_REDIR => is_redirection = true,
                _ => {}
            }
        }

        Ok(Rar5FileHeader {
            header_flags: block.flags,
            file_flags,
            unpacked_size,
            attributes,
            mtime,
            data_crc,
            compression,
            host_os,
            raw_name,
            packed_size: block.data_size,
            blake2,
            encryption,
            is_redirection,
        })
    }
}

/// High precision time record. The outer `None` means malformed; the inner
/// one means the record carries no modification time.
fn parse_mtime_record(data: &[u8]) -> Option<Option<Timestamp>> {
    const UNIX_TIME: u64 = 0x01;
    const HAS_MTIME: u64 = 0x02;
    const HAS_CTIME: u64 = 0x04;
    const HAS_ATIME: u64 = 0x08;
    const UNIX_NS: u64 = 0x10;

    let mut reader = VintReader::new(data);
    let flags = reader.read()?;
    if flags & HAS_MTIME == 0 {
        return Some(None);
    }
    let unix = flags & UNIX_TIME != 0;
    let mtime = if unix {
        Timestamp::from_unix_secs(i64::from(reader.read_u32_le()?))
    } else {
        Timestamp::from_windows_filetime(reader.read_u64_le()?)
    };
    if unix && flags & UNIX_NS != 0 {
        // Nanoseconds follow all the present times, mtime first.
        for skip in [HAS_CTIME, HAS_ATIME] {
            if flags & skip != 0 {
                reader.read_u32_le()?;
            }
        }
        let nanos = reader.read_u32_le()? & 0x3fff_ffff;
        return Some(Some(mtime.saturating_add(i64::from(nanos))));
    }
    Some(Some(mtime))
}
