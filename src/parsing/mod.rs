//! RAR header parsing and the archive entry model.
//!
//! Both format generations are parsed into the same [`Entry`] record. The
//! [`Scanner`] walks the block headers of an archive, decrypting them when
//! the archive encrypts its headers, and yields one entry per file header.

pub mod marker_header;
pub mod rar4;
pub mod rar5;
mod scanner;

pub use marker_header::{MarkerHeader, MarkerHeaderParser};
pub use scanner::Scanner;

use std::borrow::Cow;

use crate::crypto::EncryptionParams;
use crate::decompress::CompressionMethod;
use crate::formats::Timestamp;
use rar4::{decode_unicode_name, Rar4FileHeader};
use rar5::{Rar5CompressionInfo, Rar5FileHeader};

/// Largest dictionary the RAR 5.0 decoder accepts.
pub const MAX_DICT_SIZE: u64 = 1 << 30;

/// Archive format generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveVersion {
    /// RAR 1.5 to 4.x block format.
    V4,
    /// RAR 5.0+ block format.
    V5,
}

/// How the stored name bytes are to be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameEncoding {
    Utf8,
    /// Single-byte OEM code page; decoded as Latin-1.
    Oem,
    /// RAR4 ASCII name followed by compressed UTF-16.
    Rar4Unicode,
}

/// Operating system that created an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOs {
    MsDos,
    Os2,
    Windows,
    Unix,
    MacOs,
    BeOs,
    Unknown(u64),
}

impl HostOs {
    fn from_rar4(code: u8) -> Self {
        match code {
            0 => Self::MsDos,
            1 => Self::Os2,
            2 => Self::Windows,
            3 => Self::Unix,
            4 => Self::MacOs,
            5 => Self::BeOs,
            other => Self::Unknown(u64::from(other)),
        }
    }

    fn from_rar5(code: u64) -> Self {
        match code {
            0 => Self::Windows,
            1 => Self::Unix,
            other => Self::Unknown(other),
        }
    }
}

/// Integrity value stored for an entry's unpacked data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    Crc32(u32),
    Blake2sp([u8; 32]),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryFlags {
    pub is_directory: bool,
    pub is_encrypted: bool,
    /// Extended (sub-second) modification time was stored.
    pub has_extra_time_attrs: bool,
    pub continues_from_previous_volume: bool,
    pub continues_in_next_volume: bool,
    /// Decompression continues from the previous entry's dictionary.
    pub is_solid: bool,
}

/// One file or directory stored in an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Position among the archive's entries, from 0.
    pub index: usize,
    pub version: ArchiveVersion,
    pub raw_name: Vec<u8>,
    pub name_encoding: NameEncoding,
    pub unpacked_size: u64,
    pub unpacked_size_known: bool,
    pub packed_size: u64,
    pub method: CompressionMethod,
    pub checksum: Option<Checksum>,
    pub flags: EntryFlags,
    /// Absolute offset of the packed data in the archive source.
    pub data_offset: u64,
    pub dict_size: u64,
    pub host_os: HostOs,
    pub attributes: u64,
    pub mtime: Option<Timestamp>,
    pub encryption: Option<EncryptionParams>,
    /// Set for entry kinds that are listed but cannot be extracted.
    pub unsupported: Option<&'static str>,
}

impl Entry {
    /// Entry path with `/` separators.
    pub fn path(&self) -> String {
        let name: Cow<'_, str> = match self.name_encoding {
            NameEncoding::Utf8 => String::from_utf8_lossy(&self.raw_name),
            NameEncoding::Oem => Cow::Owned(self.raw_name.iter().map(|&b| char::from(b)).collect()),
            NameEncoding::Rar4Unicode => Cow::Owned(decode_unicode_name(&self.raw_name)),
        };
        match self.version {
            ArchiveVersion::V4 => name.replace('\\', "/"),
            ArchiveVersion::V5 => name.into_owned(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.flags.is_directory
    }

    pub fn is_encrypted(&self) -> bool {
        self.flags.is_encrypted
    }

    pub fn is_split(&self) -> bool {
        self.flags.continues_from_previous_volume || self.flags.continues_in_next_volume
    }

    pub(crate) fn from_rar4(index: usize, header: Rar4FileHeader, data_offset: u64) -> Self {
        let is_directory = header.is_directory();
        let method = if is_directory {
            CompressionMethod::Store
        } else {
            rar4_method(header.unp_ver, header.method)
        };
        let name_encoding = if !header.flags.unicode {
            NameEncoding::Oem
        } else if header.raw_name.contains(&0) {
            NameEncoding::Rar4Unicode
        } else {
            NameEncoding::Utf8
        };
        let encryption = header.flags.encrypted.then(|| {
            if header.unp_ver >= 29 {
                EncryptionParams::Rar4 { salt: header.salt }
            } else {
                EncryptionParams::Legacy {
                    version: header.unp_ver,
                }
            }
        });

        Self {
            index,
            version: ArchiveVersion::V4,
            name_encoding,
            unpacked_size: header.unpacked_size,
            unpacked_size_known: header.unpacked_size_known,
            packed_size: header.packed_size,
            method,
            checksum: (!is_directory).then_some(Checksum::Crc32(header.file_crc)),
            flags: EntryFlags {
                is_directory,
                is_encrypted: header.flags.encrypted,
                has_extra_time_attrs: header.flags.ext_time,
                continues_from_previous_volume: header.flags.split_before,
                continues_in_next_volume: header.flags.split_after,
                is_solid: header.flags.solid,
            },
            data_offset,
            dict_size: header.dict_size(),
            host_os: HostOs::from_rar4(header.host_os),
            attributes: u64::from(header.attributes),
            mtime: Some(header.mtime),
            encryption,
            unsupported: None,
            raw_name: header.raw_name,
        }
    }

    pub(crate) fn from_rar5(index: usize, header: Rar5FileHeader, data_offset: u64) -> Self {
        let is_directory = header.file_flags.is_directory;
        let method = if is_directory {
            CompressionMethod::Store
        } else {
            rar5_method(&header.compression)
        };
        let dict_size = header.compression.dict_size();
        let unsupported = if header.is_redirection {
            Some("links and file references are not supported")
        } else if matches!(method, CompressionMethod::Lz5 { .. }) && dict_size > MAX_DICT_SIZE {
            Some("dictionary larger than 1 GiB is not supported")
        } else {
            None
        };
        let checksum = match (header.blake2, header.data_crc) {
            _ if is_directory => None,
            (Some(digest), _) => Some(Checksum::Blake2sp(digest)),
            (None, Some(crc)) => Some(Checksum::Crc32(crc)),
            (None, None) => None,
        };

        Self {
            index,
            version: ArchiveVersion::V5,
            name_encoding: NameEncoding::Utf8,
            unpacked_size: header.unpacked_size,
            unpacked_size_known: !header.file_flags.unpacked_size_unknown,
            packed_size: header.packed_size,
            method,
            checksum,
            flags: EntryFlags {
                is_directory,
                is_encrypted: header.encryption.is_some(),
                has_extra_time_attrs: false,
                continues_from_previous_volume: header.header_flags.split_before,
                continues_in_next_volume: header.header_flags.split_after,
                is_solid: header.compression.is_solid,
            },
            data_offset,
            dict_size,
            host_os: HostOs::from_rar5(header.host_os),
            attributes: header.attributes,
            mtime: header.mtime,
            encryption: header.encryption.map(EncryptionParams::Rar5),
            unsupported,
            raw_name: header.raw_name,
        }
    }
}

fn rar4_method(unp_ver: u8, method: u8) -> CompressionMethod {
    match (unp_ver, method) {
        (_, 0x30) => CompressionMethod::Store,
        (29, 0x31..=0x35) => CompressionMethod::Lz29 {
            level: method - 0x30,
        },
        _ => CompressionMethod::Unsupported {
            version: unp_ver,
            method,
        },
    }
}

fn rar5_method(info: &Rar5CompressionInfo) -> CompressionMethod {
    match (info.version, info.method) {
        (_, 0) => CompressionMethod::Store,
        (0, level @ 1..=5) => CompressionMethod::Lz5 { level },
        (version, method) => CompressionMethod::Unsupported { version, method },
    }
}

/// Archive-level properties gathered while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub version: ArchiveVersion,
    /// Offset of the signature; non-zero for self-extracting archives.
    pub sfx_offset: u64,
    pub is_solid: bool,
    pub is_volume: bool,
    pub is_first_volume: bool,
    pub volume_number: Option<u64>,
    pub is_locked: bool,
    pub has_recovery_record: bool,
    pub has_comment: bool,
    pub headers_encrypted: bool,
    /// Set by the end-of-archive header.
    pub continues_in_next_volume: bool,
}

impl ArchiveInfo {
    fn new(version: ArchiveVersion, sfx_offset: u64) -> Self {
        Self {
            version,
            sfx_offset,
            is_solid: false,
            is_volume: false,
            is_first_volume: true,
            volume_number: None,
            is_locked: false,
            has_recovery_record: false,
            has_comment: false,
            headers_encrypted: false,
            continues_in_next_volume: false,
        }
    }
}
