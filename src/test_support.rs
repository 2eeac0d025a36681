//! Archive fixtures for tests.
//!
//! [`ArchiveBuilder`] writes small RAR4 and RAR5 archives: stored,
//! compressed, solid and encrypted entries, optionally split over several
//! volumes. Compressed data is produced by the token encoders of the
//! decompression tests.

use sha2::{Digest, Sha256};

use crate::crc32::{crc16, crc32};
use crate::crypto::{crc32_to_mac, encrypt_cbc, CipherKey, Rar4Key, Rar5Key};
use crate::decompress::tests::{encode_rar29, encode_rar29_solid, encode_rar5, Token};
use crate::formats::Signature;
use crate::parsing::rar4::{HEAD_END, HEAD_FILE, HEAD_MAIN, LONG_BLOCK};
use crate::parsing::rar5::build_header;

/// 2024-01-15 12:30:00 UTC in both header encodings.
pub const FIXTURE_DOS_TIME: u32 = 0x582F_63C0;
pub const FIXTURE_UNIX_TIME: u32 = 1_705_321_800;

const RAR5_LG2_COUNT: u8 = 4;
const RAR4_HEADER_SALT: [u8; 8] = [0xc3; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Rar4,
    Rar5,
}

#[derive(Debug, Clone)]
enum Content {
    Directory,
    Stored(Vec<u8>),
    Compressed(Vec<u8>),
    /// One match into the output of earlier entries of the solid stream.
    SolidMatch { distance: usize, length: usize },
}

#[derive(Debug, Clone)]
pub struct TestEntry {
    name: String,
    content: Content,
    crc: Option<u32>,
    blake2: bool,
    split_after: bool,
    split_at: Option<usize>,
    rar4_method: Option<(u8, u8)>,
}

impl TestEntry {
    fn new(name: &str, content: Content) -> Self {
        Self {
            name: name.to_string(),
            content,
            crc: None,
            blake2: false,
            split_after: false,
            split_at: None,
            rar4_method: None,
        }
    }

    pub fn stored(name: &str, data: &[u8]) -> Self {
        Self::new(name, Content::Stored(data.to_vec()))
    }

    pub fn compressed(name: &str, data: &[u8]) -> Self {
        Self::new(name, Content::Compressed(data.to_vec()))
    }

    pub fn directory(name: &str) -> Self {
        Self::new(name, Content::Directory)
    }

    /// A solid continuation copying `length` bytes from `distance` bytes
    /// back in the solid stream. Its data is the text `prefix` would
    /// produce; only the match is encoded.
    pub fn solid_match(name: &str, prefix: &[u8], length: usize) -> Self {
        Self::new(
            name,
            Content::SolidMatch {
                distance: prefix.len(),
                length,
            },
        )
    }

    /// Store this CRC instead of the real one.
    pub fn with_crc(mut self, crc: u32) -> Self {
        self.crc = Some(crc);
        self
    }

    /// RAR5: record a BLAKE2sp digest instead of a CRC32.
    pub fn with_blake2(mut self) -> Self {
        self.blake2 = true;
        self
    }

    /// Only flag the entry as continuing in a next volume.
    pub fn split_after(mut self) -> Self {
        self.split_after = true;
        self
    }

    /// Cut the packed data into parts of `size` bytes, each starting a new
    /// volume. Encrypted parts must stay whole cipher blocks, so `size`
    /// must then be a multiple of 16.
    pub fn split_at(mut self, size: usize) -> Self {
        self.split_at = Some(size);
        self
    }

    /// RAR4: override the unpack version and method bytes.
    pub fn with_rar4_method(mut self, unp_ver: u8, method: u8) -> Self {
        self.rar4_method = Some((unp_ver, method));
        self
    }
}

/// Entry payload after compression and encryption.
struct Packed {
    data: Vec<u8>,
    unpacked: Vec<u8>,
    compressed: bool,
}

pub struct ArchiveBuilder {
    format: Format,
    password: Option<String>,
    encrypt_headers: bool,
    solid: bool,
    sfx: Vec<u8>,
    entries: Vec<TestEntry>,
}

impl ArchiveBuilder {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            password: None,
            encrypt_headers: false,
            solid: false,
            sfx: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Encrypt every file entry with `password`.
    pub fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    /// Also encrypt the headers. Needs a password.
    pub fn encrypt_headers(mut self) -> Self {
        self.encrypt_headers = true;
        self
    }

    pub fn solid(mut self) -> Self {
        self.solid = true;
        self
    }

    /// Bytes placed before the signature, like a self-extractor stub.
    pub fn sfx_stub(mut self, stub: &[u8]) -> Self {
        self.sfx = stub.to_vec();
        self
    }

    pub fn entry(mut self, entry: TestEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// A single-volume archive.
    pub fn build(self) -> Vec<u8> {
        let mut volumes = self.build_volumes();
        assert_eq!(volumes.len(), 1, "split entries need build_volumes");
        volumes.remove(0)
    }

    /// The archive as its volumes, in order.
    pub fn build_volumes(self) -> Vec<Vec<u8>> {
        match self.format {
            Format::Rar4 => self.build_rar4(),
            Format::Rar5 => self.build_rar5(),
        }
    }

    fn is_multi_volume(&self) -> bool {
        self.entries.iter().any(|e| e.split_at.is_some())
    }

    /// Produce the packed payloads in archive order, tracking the solid
    /// stream so that matches can be resolved.
    fn pack_all(&self) -> Vec<Option<Packed>> {
        let mut history: Vec<u8> = Vec::new();
        let mut compressed_seen = false;
        self.entries
            .iter()
            .map(|entry| {
                let (unpacked, tokens) = match &entry.content {
                    Content::Directory => return None,
                    Content::Stored(data) => (data.clone(), None),
                    Content::Compressed(data) => (data.clone(), Some(Token::literals(data))),
                    Content::SolidMatch { distance, length } => {
                        let start = history.len() - distance;
                        let data = history[start..start + length].to_vec();
                        let token = Token::Match {
                            length: *length,
                            distance: *distance,
                        };
                        (data, Some(vec![token]))
                    }
                };
                let Some(tokens) = tokens else {
                    return Some(Packed {
                        data: unpacked.clone(),
                        unpacked,
                        compressed: false,
                    });
                };
                let data = match self.format {
                    Format::Rar5 => encode_rar5(&tokens),
                    Format::Rar4 if self.solid && compressed_seen => encode_rar29_solid(&tokens),
                    Format::Rar4 => encode_rar29(&tokens),
                };
                compressed_seen = true;
                history.extend_from_slice(&unpacked);
                Some(Packed {
                    data,
                    unpacked,
                    compressed: true,
                })
            })
            .collect()
    }

    fn build_rar4(&self) -> Vec<Vec<u8>> {
        let header_password = self.password.as_deref().filter(|_| self.encrypt_headers);
        let multi = self.is_multi_volume();
        let mut main_flags = if self.solid { 0x0008 } else { 0 };
        if header_password.is_some() {
            main_flags |= 0x0080;
        }
        if multi {
            main_flags |= 0x0001;
        }
        let start = |first: bool| {
            let mut out = if first { self.sfx.clone() } else { Vec::new() };
            out.extend_from_slice(Signature::RAR15);
            let flags = if first && multi { main_flags | 0x0100 } else { main_flags };
            out.extend(rar4_block(HEAD_MAIN, flags, &[0; 6]));
            out
        };
        // Headers after the main one are salted and padded to the cipher
        // block size. One salt keeps key derivation to a single run.
        let header_key = header_password.map(|pw| Rar4Key::derive(pw, Some(&RAR4_HEADER_SALT)));
        let emit = |out: &mut Vec<u8>, header: Vec<u8>| match &header_key {
            Some(key) => {
                let mut padded = header;
                padded.resize(padded.len().div_ceil(16) * 16, 0);
                encrypt_cbc(&CipherKey::Aes128(key.key), &key.iv, &mut padded);
                out.extend_from_slice(&RAR4_HEADER_SALT);
                out.extend(padded);
            }
            None => out.extend(header),
        };

        let mut volumes = Vec::new();
        let mut out = start(true);
        let mut compressed_seen = false;
        for (index, (entry, packed)) in self.entries.iter().zip(self.pack_all()).enumerate() {
            let mut flags = LONG_BLOCK;
            let mut method = (29u8, 0x30u8);
            let (data, crc, unpacked_len) = match &packed {
                None => {
                    flags |= 0x00e0;
                    (Vec::new(), 0, 0)
                }
                Some(p) => {
                    if p.compressed {
                        method.1 = 0x33;
                        if self.solid && compressed_seen {
                            flags |= 0x0010;
                        }
                        compressed_seen = true;
                    }
                    (p.data.clone(), crc32(&p.unpacked), p.unpacked.len())
                }
            };
            if let Some(m) = entry.rar4_method {
                method = m;
            }

            let pieces = split_pieces(&data, entry.split_at);
            let last = pieces.len() - 1;
            for (part, mut piece) in pieces.into_iter().enumerate() {
                let mut part_flags = flags;
                if part > 0 {
                    part_flags |= 0x0001;
                }
                if part < last || entry.split_after {
                    part_flags |= 0x0002;
                }

                let mut salt = None;
                if let (Some(password), Some(_)) = (&self.password, &packed) {
                    let s = [(index as u8 ^ 0x5c).wrapping_add(part as u8 * 0x10); 8];
                    let key = Rar4Key::derive(password, Some(&s));
                    piece.resize(piece.len().div_ceil(16) * 16, 0);
                    encrypt_cbc(&CipherKey::Aes128(key.key), &key.iv, &mut piece);
                    part_flags |= 0x0004 | 0x0400;
                    salt = Some(s);
                }
                // Only the last part records the file's CRC
                let part_crc = if part == last {
                    entry.crc.unwrap_or(crc)
                } else {
                    crc32(&piece)
                };

                let name = entry.name.as_bytes();
                let mut body = Vec::new();
                body.extend_from_slice(&(piece.len() as u32).to_le_bytes());
                body.extend_from_slice(&(unpacked_len as u32).to_le_bytes());
                body.push(3);
                body.extend_from_slice(&part_crc.to_le_bytes());
                body.extend_from_slice(&FIXTURE_DOS_TIME.to_le_bytes());
                body.push(method.0);
                body.push(method.1);
                body.extend_from_slice(&(name.len() as u16).to_le_bytes());
                let attributes: u32 = if packed.is_none() { 0o40755 } else { 0o100644 };
                body.extend_from_slice(&attributes.to_le_bytes());
                body.extend_from_slice(name);
                if let Some(s) = salt {
                    body.extend_from_slice(&s);
                }
                emit(&mut out, rar4_block(HEAD_FILE, part_flags, &body));
                out.extend_from_slice(&piece);

                if part < last {
                    emit(&mut out, rar4_block(HEAD_END, 0x4000 | 0x0001, &[]));
                    volumes.push(std::mem::replace(&mut out, start(false)));
                }
            }
        }
        emit(&mut out, rar4_block(HEAD_END, 0x4000, &[]));
        volumes.push(out);
        volumes
    }

    fn build_rar5(&self) -> Vec<Vec<u8>> {
        let multi = self.is_multi_volume();
        let header_salt = [0x33u8; 16];
        let header_key = self
            .password
            .as_deref()
            .filter(|_| self.encrypt_headers)
            .map(|pw| Rar5Key::derive(pw, &header_salt, RAR5_LG2_COUNT));
        let emit = |out: &mut Vec<u8>, header: Vec<u8>, seq: u8| match &header_key {
            Some(key) => {
                let iv = [seq ^ 0xa5; 16];
                let mut padded = header;
                padded.resize(padded.len().div_ceil(16) * 16, 0);
                encrypt_cbc(&CipherKey::Aes256(key.key), &iv, &mut padded);
                out.extend_from_slice(&iv);
                out.extend(padded);
            }
            None => out.extend(header),
        };
        // Every volume starts with its own encryption and main headers
        let start = |volume: u64| {
            let mut out = if volume == 0 { self.sfx.clone() } else { Vec::new() };
            out.extend_from_slice(Signature::RAR50);
            if let Some(key) = &header_key {
                let mut fields = vec![0u8, 0x01, RAR5_LG2_COUNT];
                fields.extend_from_slice(&header_salt);
                fields.extend_from_slice(&check_with_sum(key));
                out.extend(build_header(4, 0, &fields, &[], None));
            }
            let mut flags = if self.solid { 0x04 } else { 0 };
            if multi {
                flags |= 0x01;
            }
            if volume > 0 {
                flags |= 0x02;
            }
            let mut fields = Vec::new();
            vint(flags, &mut fields);
            if volume > 0 {
                vint(volume, &mut fields);
            }
            emit(&mut out, build_header(1, 0, &fields, &[], None), 0);
            out
        };

        let mut volumes = Vec::new();
        let mut out = start(0);
        let mut seq = 0u8;
        let mut compressed_seen = false;
        for (index, (entry, packed)) in self.entries.iter().zip(self.pack_all()).enumerate() {
            let mut file_flags = 0x02u8;
            let mut compression = 0u64;
            let (data, unpacked) = match &packed {
                None => {
                    file_flags |= 0x01;
                    (Vec::new(), Vec::new())
                }
                Some(p) => {
                    if p.compressed {
                        compression = 3 << 7;
                        if self.solid && compressed_seen {
                            compression |= 0x40;
                        }
                        compressed_seen = true;
                    }
                    (p.data.clone(), p.unpacked.clone())
                }
            };

            let pieces = split_pieces(&data, entry.split_at);
            let last = pieces.len() - 1;
            for (part, mut piece) in pieces.into_iter().enumerate() {
                let mut header_flags = 0u64;
                if part > 0 {
                    header_flags |= 0x08;
                }
                if part < last || entry.split_after {
                    header_flags |= 0x10;
                }

                let mut extra = Vec::new();
                let mut mac_key = None;
                if let (Some(password), Some(_)) = (&self.password, &packed) {
                    let shift = part as u8 * 0x10;
                    let salt = [(index as u8 ^ 0x77).wrapping_add(shift); 16];
                    let iv = [(index as u8 ^ 0x19).wrapping_add(shift); 16];
                    let key = Rar5Key::derive(password, &salt, RAR5_LG2_COUNT);
                    piece.resize(piece.len().div_ceil(16) * 16, 0);
                    encrypt_cbc(&CipherKey::Aes256(key.key), &iv, &mut piece);

                    let mut record = vec![0u8, 0x03, RAR5_LG2_COUNT];
                    record.extend_from_slice(&salt);
                    record.extend_from_slice(&iv);
                    record.extend_from_slice(&check_with_sum(&key));
                    extra.extend(extra_record(0x01, &record));
                    mac_key = Some(key.hash_key);
                }

                let mut part_file_flags = file_flags;
                let mut crc_field = None;
                if packed.is_some() {
                    if part < last {
                        part_file_flags |= 0x04;
                        crc_field = Some(crc32(&piece));
                    } else if entry.blake2 {
                        let mut digest = [0u8; 32];
                        digest.copy_from_slice(blake2s_simd::blake2sp::blake2sp(&unpacked).as_bytes());
                        let mut record = vec![0u8];
                        record.extend_from_slice(&digest);
                        extra.extend(extra_record(0x02, &record));
                    } else {
                        let crc = entry.crc.unwrap_or_else(|| {
                            let crc = crc32(&unpacked);
                            mac_key.map_or(crc, |key| crc32_to_mac(&key, crc))
                        });
                        part_file_flags |= 0x04;
                        crc_field = Some(crc);
                    }
                }

                let name = entry.name.as_bytes();
                let mut fields = Vec::new();
                vint(u64::from(part_file_flags), &mut fields);
                vint(unpacked.len() as u64, &mut fields);
                vint(if packed.is_none() { 0x10 } else { 0x20 }, &mut fields);
                fields.extend_from_slice(&FIXTURE_UNIX_TIME.to_le_bytes());
                if let Some(crc) = crc_field {
                    fields.extend_from_slice(&crc.to_le_bytes());
                }
                vint(compression, &mut fields);
                vint(1, &mut fields);
                vint(name.len() as u64, &mut fields);
                fields.extend_from_slice(name);

                seq = seq.wrapping_add(1);
                let data_size = packed.is_some().then_some(piece.len() as u64);
                emit(&mut out, build_header(2, header_flags, &fields, &extra, data_size), seq);
                out.extend_from_slice(&piece);

                if part < last {
                    emit(&mut out, build_header(5, 0, &[0x01], &[], None), 0xfe);
                    let next = volumes.len() as u64 + 1;
                    volumes.push(std::mem::replace(&mut out, start(next)));
                }
            }
        }
        emit(&mut out, build_header(5, 0, &[0x00], &[], None), 0xff);
        volumes.push(out);
        volumes
    }
}

/// Packed data cut into volume parts.
fn split_pieces(data: &[u8], size: Option<usize>) -> Vec<Vec<u8>> {
    match size {
        Some(size) if size > 0 && size < data.len() => data.chunks(size).map(<[u8]>::to_vec).collect(),
        _ => vec![data.to_vec()],
    }
}

fn rar4_block(header_type: u8, flags: u16, body: &[u8]) -> Vec<u8> {
    let size = (7 + body.len()) as u16;
    let mut out = vec![0, 0, header_type];
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(body);
    let crc = crc16(&out[2..]);
    out[..2].copy_from_slice(&crc.to_le_bytes());
    out
}

fn extra_record(record_type: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    vint(data.len() as u64 + 1, &mut out);
    out.push(record_type);
    out.extend_from_slice(data);
    out
}

fn check_with_sum(key: &Rar5Key) -> Vec<u8> {
    let check = key.check_value();
    let mut out = check.to_vec();
    out.extend_from_slice(&Sha256::digest(check)[..4]);
    out
}

fn vint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}
