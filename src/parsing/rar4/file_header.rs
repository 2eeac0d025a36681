//! File header parser.
//!
//! Each file in a RAR4 archive has a file header that describes the file's
//! name, sizes, compression method and timestamps. Layout after the base
//! block fields:
//!
//! ```text
//! PACK_SIZE 4, UNP_SIZE 4, HOST_OS 1, FILE_CRC 4, FTIME 4, UNP_VER 1,
//! METHOD 1, NAME_SIZE 2, ATTR 4, [HIGH_PACK 4, HIGH_UNP 4], NAME,
//! [SALT 8], [EXT_TIME]
//! ```

use super::{Rar4BlockParser, HEAD_FILE, HEAD_SERVICE};
use crate::error::{RarError, Result};
use crate::formats::Timestamp;
use crate::parsing::rar5::VintReader;

/// RAR4 file header flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rar4FileFlags {
    pub split_before: bool,
    pub split_after: bool,
    pub encrypted: bool,
    pub has_comment: bool,
    pub solid: bool,
    /// Dictionary selector; 7 marks a directory.
    pub window_bits: u8,
    pub large: bool,
    pub unicode: bool,
    pub has_salt: bool,
    pub has_version: bool,
    pub ext_time: bool,
}

impl From<u16> for Rar4FileFlags {
    fn from(flags: u16) -> Self {
        Self {
            split_before: flags & 0x0001 != 0,
            split_after: flags & 0x0002 != 0,
            encrypted: flags & 0x0004 != 0,
            has_comment: flags & 0x0008 != 0,
            solid: flags & 0x0010 != 0,
            window_bits: ((flags >> 5) & 7) as u8,
            large: flags & 0x0100 != 0,
            unicode: flags & 0x0200 != 0,
            has_salt: flags & 0x0400 != 0,
            has_version: flags & 0x0800 != 0,
            ext_time: flags & 0x1000 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rar4FileHeader {
    pub header_type: u8,
    pub flags: Rar4FileFlags,
    pub packed_size: u64,
    pub unpacked_size: u64,
    pub unpacked_size_known: bool,
    pub host_os: u8,
    pub file_crc: u32,
    pub dos_time: u32,
    pub unp_ver: u8,
    pub method: u8,
    pub attributes: u32,
    pub raw_name: Vec<u8>,
    pub salt: Option<[u8; 8]>,
    pub mtime: Timestamp,
}

impl Rar4FileHeader {
    pub fn is_directory(&self) -> bool {
        self.flags.window_bits == 7 || (self.unp_ver < 20 && self.attributes & 0x10 != 0)
    }

    /// Dictionary size selected by the window bits.
    pub fn dict_size(&self) -> u64 {
        if self.is_directory() {
            0
        } else {
            0x10000 << self.flags.window_bits
        }
    }

    pub fn is_stored(&self) -> bool {
        self.method == 0x30
    }
}

pub struct Rar4FileHeaderParser;

impl Rar4FileHeaderParser {
    /// Fixed part of the header before the name.
    const FIXED_SIZE: usize = 32;

    /// Parse a complete file (or service) block. `buffer` holds exactly
    /// HEAD_SIZE bytes.
    pub fn parse(buffer: &[u8]) -> Result<Rar4FileHeader> {
        let block = Rar4BlockParser::parse(buffer)?;
        if block.header_type != HEAD_FILE && block.header_type != HEAD_SERVICE {
            return Err(RarError::corrupt("expected file header"));
        }
        if buffer.len() < Self::FIXED_SIZE {
            return Err(RarError::corrupt("file header is too short"));
        }
        let flags = Rar4FileFlags::from(block.flags);
        let bad = || RarError::corrupt("file header fields exceed header size");

        let mut reader = VintReader::new(&buffer[7..]);
        let low_packed = reader.read_u32_le().ok_or_else(bad)?;
        let low_unpacked = reader.read_u32_le().ok_or_else(bad)?;
        let host_os = reader.read_u8().ok_or_else(bad)?;
        let file_crc = reader.read_u32_le().ok_or_else(bad)?;
        let dos_time = reader.read_u32_le().ok_or_else(bad)?;
        let unp_ver = reader.read_u8().ok_or_else(bad)?;
        let method = reader.read_u8().ok_or_else(bad)?;
        let name_size = reader.read_u16_le().ok_or_else(bad)?;
        let attributes = reader.read_u32_le().ok_or_else(bad)?;

        let (high_packed, high_unpacked) = if flags.large {
            (
                reader.read_u32_le().ok_or_else(bad)?,
                reader.read_u32_le().ok_or_else(bad)?,
            )
        } else {
            (0, 0)
        };
        let unpacked_size_known = if flags.large {
            !(low_unpacked == u32::MAX && high_unpacked == u32::MAX)
        } else {
            low_unpacked != u32::MAX
        };

        let raw_name = reader
            .read_bytes(usize::from(name_size))
            .ok_or_else(bad)?
            .to_vec();

        let salt = if flags.has_salt {
            Some(reader.read_array::<8>().ok_or_else(bad)?)
        } else {
            None
        };

        let dos_mtime = Timestamp::from_dos(dos_time);
        let mtime = if flags.ext_time {
            parse_ext_mtime(&mut reader, dos_mtime).ok_or_else(bad)?
        } else {
            dos_mtime
        };

        Ok(Rar4FileHeader {
            header_type: block.header_type,
            flags,
            packed_size: u64::from(high_packed) << 32 | u64::from(low_packed),
            unpacked_size: u64::from(high_unpacked) << 32 | u64::from(low_unpacked),
            unpacked_size_known,
            host_os,
            file_crc,
            dos_time,
            unp_ver,
            method,
            attributes,
            raw_name,
            salt,
            mtime,
        })
    }
}

/// Extended time block. Four nibbles (mtime, ctime, atime, arctime, high
/// nibble first) each say whether the time is present (bit 3), whether to add
/// one second (bit 2) and how many 100 ns remainder bytes follow (bits 0-1).
/// Only mtime reuses the DOS time from the fixed header; the others carry
/// their own.
fn parse_ext_mtime(reader: &mut VintReader<'_>, dos_mtime: Timestamp) -> Option<Timestamp> {
    let flags = reader.read_u16_le()?;
    let mut mtime = dos_mtime;
    for i in 0..4 {
        let rmode = flags >> ((3 - i) * 4);
        if rmode & 8 == 0 {
            continue;
        }
        let mut base = dos_mtime;
        if i != 0 {
            base = Timestamp::from_dos(reader.read_u32_le()?);
        }
        if rmode & 4 != 0 {
            base = base.saturating_add(1_000_000_000);
        }
        let count = u32::from(rmode & 3);
        let mut remainder = 0u32;
        for j in 0..count {
            remainder |= u32::from(reader.read_u8()?) << ((j + 3 - count) * 8);
        }
        if i == 0 {
            mtime = base.saturating_add(i64::from(remainder) * 100);
        }
    }
    Some(mtime)
}

/// Decode the compressed UTF-16 form of a RAR4 Unicode file name.
///
/// `raw` is the stored name: an ASCII rendering, a zero byte, then the
/// encoded UTF-16 stream. Without a zero byte the name is plain UTF-8.
pub fn decode_unicode_name(raw: &[u8]) -> String {
    let Some(zero) = raw.iter().position(|&b| b == 0) else {
        return String::from_utf8_lossy(raw).into_owned();
    };
    let ascii = &raw[..zero];
    let enc = &raw[zero + 1..];

    let mut out: Vec<u16> = Vec::with_capacity(ascii.len());
    let mut pos = 0;
    let next = |pos: &mut usize| -> Option<u8> {
        let b = enc.get(*pos).copied();
        *pos += 1;
        b
    };
    let high_byte = u16::from(next(&mut pos).unwrap_or(0));
    let mut flags = 0u8;
    let mut flag_bits = 0;

    while pos < enc.len() {
        if flag_bits == 0 {
            let Some(f) = next(&mut pos) else { break };
            flags = f;
            flag_bits = 8;
        }
        match flags >> 6 {
            0 => {
                let Some(b) = next(&mut pos) else { break };
                out.push(u16::from(b));
            }
            1 => {
                let Some(b) = next(&mut pos) else { break };
                out.push(u16::from(b) | (high_byte << 8));
            }
            2 => {
                if pos + 1 >= enc.len() {
                    break;
                }
                out.push(u16::from_le_bytes([enc[pos], enc[pos + 1]]));
                pos += 2;
            }
            _ => {
                let Some(len) = next(&mut pos) else { break };
                if len & 0x80 != 0 {
                    let Some(correction) = next(&mut pos) else { break };
                    for _ in 0..(len & 0x7f) + 2 {
                        let Some(&c) = ascii.get(out.len()) else { break };
                        out.push(u16::from(c.wrapping_add(correction)) | (high_byte << 8));
                    }
                } else {
                    for _ in 0..len + 2 {
                        let Some(&c) = ascii.get(out.len()) else { break };
                        out.push(u16::from(c));
                    }
                }
            }
        }
        flags <<= 2;
        flag_bits -= 2;
    }

    String::from_utf16_lossy(&out)
}
