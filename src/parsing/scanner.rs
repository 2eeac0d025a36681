//! Sequential header walk over an archive source.

use std::sync::Arc;

use tracing::{debug, trace};

use super::rar4::{
    Rar4BlockHeader, Rar4BlockParser, Rar4EndHeader, Rar4FileHeaderParser, Rar4MainHeaderParser,
    HEAD_FILE, HEAD_END,
};
use super::rar5::{
    Rar5ArchiveHeaderParser, Rar5Block, Rar5BlockParser, Rar5EncryptionHeaderParser,
    Rar5EndHeaderParser, Rar5FileHeaderParser, Rar5HeaderType,
};
use super::{ArchiveInfo, ArchiveVersion, Entry, MarkerHeaderParser};
use crate::crypto::{align_to_block, CipherKey, KeyCache, Rar5Key, CRYPT_BLOCK_SIZE};
use crate::error::{ErrorKind, RarError, Result};
use crate::file_media::{FileMedia, MediaReader};

/// How block headers are stored.
enum HeaderCrypt {
    Plain,
    /// Each header is preceded by its own 8-byte salt.
    Rar4,
    /// Each header is preceded by a 16-byte IV. `verified` records whether
    /// the password was checked against the encryption header.
    Rar5 { key: Arc<Rar5Key>, verified: bool },
}

/// Header bytes with the position of the data area that follows them.
struct RawHeader {
    bytes: Vec<u8>,
    data_offset: u64,
}

enum Step {
    Entry(Box<Entry>),
    Skip,
    End,
}

/// Iterator over the entries of an archive.
///
/// The main archive header is read by [`Scanner::open`], so password and
/// format problems surface before the first entry. Iteration stops after
/// the first error.
pub struct Scanner {
    reader: MediaReader,
    keys: Arc<KeyCache>,
    info: ArchiveInfo,
    header_crypt: HeaderCrypt,
    next_index: usize,
    finished: bool,
}

impl Scanner {
    pub fn open(media: Arc<dyn FileMedia>, keys: Arc<KeyCache>) -> Result<Self> {
        let marker = MarkerHeaderParser::locate(media.as_ref())?;
        let mut reader = MediaReader::new(media);
        reader.seek(marker.headers_start)?;

        let mut scanner = Self {
            reader,
            keys,
            info: ArchiveInfo::new(marker.version, marker.offset),
            header_crypt: HeaderCrypt::Plain,
            next_index: 0,
            finished: false,
        };
        match marker.version {
            ArchiveVersion::V4 => scanner.open_rar4()?,
            ArchiveVersion::V5 => scanner.open_rar5()?,
        }
        debug!(
            version = ?scanner.info.version,
            sfx_offset = scanner.info.sfx_offset,
            solid = scanner.info.is_solid,
            headers_encrypted = scanner.info.headers_encrypted,
            "opened archive"
        );
        Ok(scanner)
    }

    /// Archive properties. The volume continuation flag is known only once
    /// iteration has reached the end header.
    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    fn open_rar4(&mut self) -> Result<()> {
        let (_, raw) = self
            .read_rar4_header()?
            .ok_or_else(|| RarError::truncated("missing main archive header"))?;
        let main = Rar4MainHeaderParser::parse(&raw.bytes)?;
        self.reader.seek(raw.data_offset)?;

        self.info.is_solid = main.is_solid;
        self.info.is_volume = main.is_volume;
        self.info.is_first_volume = !main.is_volume || main.is_first_volume;
        self.info.is_locked = main.is_locked;
        self.info.has_recovery_record = main.has_recovery;
        self.info.has_comment = main.has_comment;
        self.info.headers_encrypted = main.headers_encrypted;

        if main.headers_encrypted {
            if !self.keys.has_password() {
                return Err(RarError::new(
                    ErrorKind::PasswordRequired,
                    "archive headers are encrypted",
                ));
            }
            self.header_crypt = HeaderCrypt::Rar4;
        }
        Ok(())
    }

    fn open_rar5(&mut self) -> Result<()> {
        let mut raw = self
            .read_rar5_header()?
            .ok_or_else(|| RarError::truncated("missing main archive header"))?;
        let first = self.parse_rar5_block(&raw.bytes)?;

        if first.header_type == Rar5HeaderType::Encryption as u64 {
            let params = Rar5EncryptionHeaderParser::parse(&first)?;
            let key = self.keys.rar5(&params.salt, params.lg2_count).map_err(|e| {
                let err = RarError::from(e);
                if err.kind() == ErrorKind::PasswordRequired {
                    RarError::new(ErrorKind::PasswordRequired, "archive headers are encrypted")
                } else {
                    err
                }
            })?;
            let verified = match &params.psw_check {
                Some(check) if !key.verify_password(check) => {
                    return Err(RarError::from_kind(ErrorKind::BadPassword));
                }
                Some(_) => true,
                None => false,
            };
            self.reader.seek(raw.data_offset)?;
            self.header_crypt = HeaderCrypt::Rar5 { key, verified };
            self.info.headers_encrypted = true;
            raw = self
                .read_rar5_header()?
                .ok_or_else(|| RarError::truncated("missing main archive header"))?;
        }

        let block = self.parse_rar5_block(&raw.bytes)?;
        let main = Rar5ArchiveHeaderParser::parse(&block)?;
        self.reader.seek(raw.data_offset.saturating_add(block.data_size))?;

        let flags = main.archive_flags;
        self.info.is_solid = flags.is_solid;
        self.info.is_volume = flags.is_volume;
        self.info.volume_number = main.volume_number;
        self.info.is_first_volume = main.volume_number.unwrap_or(0) == 0;
        self.info.is_locked = flags.is_locked;
        self.info.has_recovery_record = flags.has_recovery_record;
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<Entry>> {
        loop {
            let step = match self.info.version {
                ArchiveVersion::V4 => self.step_rar4()?,
                ArchiveVersion::V5 => self.step_rar5()?,
            };
            match step {
                Step::Entry(entry) => return Ok(Some(*entry)),
                Step::Skip => continue,
                Step::End => return Ok(None),
            }
        }
    }

    fn step_rar4(&mut self) -> Result<Step> {
        let Some((block, raw)) = self.read_rar4_header()? else {
            return Ok(Step::End);
        };
        match block.header_type {
            HEAD_FILE => {
                let header = Rar4FileHeaderParser::parse(&raw.bytes)?;
                self.skip_data(raw.data_offset, header.packed_size)?;
                let entry = Entry::from_rar4(self.next_index, header, raw.data_offset);
                self.next_index += 1;
                trace!(index = entry.index, path = %entry.path(), "file header");
                Ok(Step::Entry(Box::new(entry)))
            }
            HEAD_END => {
                let end = Rar4EndHeader::parse(&raw.bytes)?;
                self.info.continues_in_next_volume = end.next_volume;
                Ok(Step::End)
            }
            other => {
                trace!(header_type = other, "skipping block");
                self.skip_data(raw.data_offset, block.data_size())?;
                Ok(Step::Skip)
            }
        }
    }

    fn step_rar5(&mut self) -> Result<Step> {
        let Some(raw) = self.read_rar5_header()? else {
            return Ok(Step::End);
        };
        let block = self.parse_rar5_block(&raw.bytes)?;
        match Rar5HeaderType::try_from(block.header_type) {
            Ok(Rar5HeaderType::File) => {
                let header = Rar5FileHeaderParser::parse(&block)?;
                self.skip_data(raw.data_offset, header.packed_size)?;
                let entry = Entry::from_rar5(self.next_index, header, raw.data_offset);
                self.next_index += 1;
                trace!(index = entry.index, path = %entry.path(), "file header");
                Ok(Step::Entry(Box::new(entry)))
            }
            Ok(Rar5HeaderType::End) => {
                let end = Rar5EndHeaderParser::parse(&block)?;
                self.info.continues_in_next_volume = end.has_next_volume;
                Ok(Step::End)
            }
            Ok(Rar5HeaderType::Service) => {
                let header = Rar5FileHeaderParser::parse(&block)?;
                if header.raw_name == b"CMT" {
                    self.info.has_comment = true;
                }
                self.skip_data(raw.data_offset, header.packed_size)?;
                Ok(Step::Skip)
            }
            _ => {
                trace!(header_type = block.header_type, "skipping block");
                self.skip_data(raw.data_offset, block.data_size)?;
                Ok(Step::Skip)
            }
        }
    }

    fn skip_data(&mut self, data_offset: u64, size: u64) -> Result<()> {
        let end = data_offset
            .checked_add(size)
            .filter(|&end| end <= self.reader.end())
            .ok_or_else(|| RarError::truncated("data area extends past the end of the archive"))?;
        self.reader.seek(end)
    }

    fn header_password_error(&self) -> RarError {
        RarError::new(ErrorKind::BadPassword, "encrypted header failed to decrypt")
    }

    fn read_rar4_header(&mut self) -> Result<Option<(Rar4BlockHeader, RawHeader)>> {
        let start = self.reader.position();
        if self.reader.remaining() == 0 {
            return Ok(None);
        }

        let (bytes, data_offset) = match &self.header_crypt {
            HeaderCrypt::Plain => {
                let prefix_len = self.reader.remaining().min(11) as usize;
                let prefix = self.reader.read_bytes(prefix_len)?;
                let block = Rar4BlockParser::parse(&prefix)?;
                self.reader.seek(start)?;
                let bytes = self.reader.read_bytes(usize::from(block.head_size))?;
                (bytes, start + u64::from(block.head_size))
            }
            HeaderCrypt::Rar4 => {
                let salt: [u8; 8] = self.read_array()?;
                let key = self.keys.rar4(Some(salt))?;
                let cipher = CipherKey::Aes128(key.key);

                let mut first: [u8; CRYPT_BLOCK_SIZE] = self.read_array()?;
                cipher.decrypt(&key.iv, &mut first)?;
                let head_size = Rar4BlockParser::parse(&first)
                    .map_err(|_| self.header_password_error())?
                    .head_size;
                let total = align_to_block(u64::from(head_size));
                // A wrong key decrypts to a random size
                if start + 8 + total > self.reader.end() {
                    return Err(self.header_password_error());
                }

                self.reader.seek(start + 8)?;
                let mut bytes = self.reader.read_bytes(total as usize)?;
                cipher.decrypt(&key.iv, &mut bytes)?;
                bytes.truncate(usize::from(head_size));
                (bytes, start + 8 + total)
            }
            HeaderCrypt::Rar5 { .. } => {
                return Err(RarError::corrupt("mismatched header encryption"));
            }
        };

        let block = Rar4BlockParser::parse(&bytes)?;
        if !Rar4BlockParser::verify(&block, &bytes) {
            return Err(match self.header_crypt {
                HeaderCrypt::Rar4 => self.header_password_error(),
                _ => RarError::corrupt(format!(
                    "header CRC mismatch at offset {start} (block type {:#04x})",
                    block.header_type
                )),
            });
        }
        Ok(Some((block, RawHeader { bytes, data_offset })))
    }

    fn read_rar5_header(&mut self) -> Result<Option<RawHeader>> {
        let start = self.reader.position();
        if self.reader.remaining() == 0 {
            return Ok(None);
        }

        match &self.header_crypt {
            HeaderCrypt::Plain => {
                let prefix_len = self
                    .reader
                    .remaining()
                    .min(Rar5BlockParser::PREFIX_SIZE as u64) as usize;
                let prefix = self.reader.read_bytes(prefix_len)?;
                let len = Rar5BlockParser::header_len(&prefix)?;
                self.reader.seek(start)?;
                let bytes = self.reader.read_bytes(len)?;
                Ok(Some(RawHeader {
                    bytes,
                    data_offset: start + len as u64,
                }))
            }
            HeaderCrypt::Rar5 { key, verified } => {
                let cipher = CipherKey::Aes256(key.key);
                let verified = *verified;
                let iv: [u8; 16] = self.read_array()?;
                let mut first: [u8; CRYPT_BLOCK_SIZE] = self.read_array()?;
                cipher.decrypt(&iv, &mut first)?;
                let len = Rar5BlockParser::header_len(&first).map_err(|e| {
                    if verified {
                        e
                    } else {
                        self.header_password_error()
                    }
                })?;
                let total = align_to_block(len as u64);

                self.reader.seek(start + 16)?;
                let mut bytes = self.reader.read_bytes(total as usize)?;
                cipher.decrypt(&iv, &mut bytes)?;
                bytes.truncate(len);
                Ok(Some(RawHeader {
                    bytes,
                    data_offset: start + 16 + total,
                }))
            }
            HeaderCrypt::Rar4 => Err(RarError::corrupt("mismatched header encryption")),
        }
    }

    fn parse_rar5_block<'a>(&self, bytes: &'a [u8]) -> Result<Rar5Block<'a>> {
        Rar5BlockParser::parse(bytes).map_err(|e| match self.header_crypt {
            HeaderCrypt::Rar5 {
                verified: false, ..
            } if e.kind() == ErrorKind::CorruptHeader => self.header_password_error(),
            _ => e,
        })
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        self.reader.read_into(&mut out)?;
        Ok(out)
    }
}

impl Iterator for Scanner {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_media::MemoryMedia;
    use crate::formats::Signature;
    use crate::parsing::rar5::build_header;
    use crate::test_support::{ArchiveBuilder, Format, TestEntry};

    fn scan(bytes: Vec<u8>, password: Option<&str>) -> Result<Scanner> {
        let media: Arc<dyn FileMedia> = Arc::new(MemoryMedia::new("t.rar", bytes));
        Scanner::open(media, Arc::new(KeyCache::new(password)))
    }

    #[test]
    fn test_walks_entries_in_order() {
        for format in [Format::Rar4, Format::Rar5] {
            let bytes = ArchiveBuilder::new(format)
                .entry(TestEntry::stored("a.txt", b"first"))
                .entry(TestEntry::directory("dir"))
                .entry(TestEntry::compressed("dir/b.txt", b"second"))
                .build();
            let entries: Vec<Entry> = scan(bytes.clone(), None)
                .unwrap()
                .collect::<Result<_>>()
                .unwrap();

            let paths: Vec<_> = entries.iter().map(Entry::path).collect();
            assert_eq!(paths, ["a.txt", "dir", "dir/b.txt"]);
            assert!(entries.iter().enumerate().all(|(i, e)| e.index == i));
            assert!(entries[1].flags.is_directory);

            let first = &entries[0];
            let start = first.data_offset as usize;
            assert_eq!(&bytes[start..start + first.packed_size as usize], b"first");
        }
    }

    #[test]
    fn test_service_headers_are_not_entries() {
        let mut bytes = Signature::RAR50.to_vec();
        bytes.extend(build_header(1, 0, &[0x00], &[], None));
        // flags, unpacked size, attributes, compression, host OS, name
        bytes.extend(build_header(3, 0, &[0, 3, 0, 0, 0, 3, b'C', b'M', b'T'], &[], Some(3)));
        bytes.extend_from_slice(b"hey");
        bytes.extend(build_header(2, 0, &[0, 2, 0x20, 0, 1, 5, b'a', b'.', b't', b'x', b't'], &[], Some(2)));
        bytes.extend_from_slice(b"hi");
        bytes.extend(build_header(5, 0, &[0x00], &[], None));

        let mut scanner = scan(bytes, None).unwrap();
        let entries: Vec<Entry> = scanner.by_ref().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path(), "a.txt");
        assert!(scanner.info().has_comment);
    }

    #[test]
    fn test_truncated_data_stops_iteration() {
        let bytes = ArchiveBuilder::new(Format::Rar4)
            .entry(TestEntry::stored("one.txt", b"complete"))
            .entry(TestEntry::stored("two.txt", b"cut short here"))
            .build();
        let second = scan(bytes.clone(), None).unwrap().nth(1).unwrap().unwrap();

        let cut = bytes[..second.data_offset as usize + 3].to_vec();
        let mut scanner = scan(cut, None).unwrap();
        assert_eq!(scanner.next().unwrap().unwrap().path(), "one.txt");
        assert_eq!(scanner.next().unwrap().unwrap_err().kind(), ErrorKind::Truncated);
        assert!(scanner.next().is_none());
    }

    #[test]
    fn test_header_crc_mismatch() {
        let mut bytes = ArchiveBuilder::new(Format::Rar5)
            .entry(TestEntry::stored("name.txt", b"data"))
            .build();
        let at = bytes.windows(8).position(|w| w == b"name.txt").unwrap();
        bytes[at] = b'N';

        let mut scanner = scan(bytes, None).unwrap();
        assert_eq!(scanner.next().unwrap().unwrap_err().kind(), ErrorKind::CorruptHeader);
        assert!(scanner.next().is_none());
    }

    #[test]
    fn test_encrypted_headers() {
        let bytes = ArchiveBuilder::new(Format::Rar5)
            .password("secret")
            .encrypt_headers()
            .entry(TestEntry::stored("hidden.txt", b"data"))
            .build();

        let Err(err) = scan(bytes.clone(), None) else {
            panic!("opened without a password");
        };
        assert_eq!(err.kind(), ErrorKind::PasswordRequired);
        let Err(err) = scan(bytes.clone(), Some("nope")) else {
            panic!("opened with a wrong password");
        };
        assert_eq!(err.kind(), ErrorKind::BadPassword);

        let scanner = scan(bytes, Some("secret")).unwrap();
        assert!(scanner.info().headers_encrypted);
        let names: Vec<_> = scanner.map(|e| e.unwrap().path()).collect();
        assert_eq!(names, ["hidden.txt"]);
    }

    #[test]
    fn test_rar4_encrypted_headers() {
        let bytes = ArchiveBuilder::new(Format::Rar4)
            .password("secret")
            .encrypt_headers()
            .entry(TestEntry::stored("first.txt", b"one"))
            .entry(TestEntry::stored("second.txt", b"two two"))
            .build();

        let Err(err) = scan(bytes.clone(), None) else {
            panic!("opened without a password");
        };
        assert_eq!(err.kind(), ErrorKind::PasswordRequired);

        // The main header is plain; the first salted header fails
        let mut scanner = scan(bytes.clone(), Some("nope")).unwrap();
        assert!(scanner.info().headers_encrypted);
        assert_eq!(scanner.next().unwrap().unwrap_err().kind(), ErrorKind::BadPassword);
        assert!(scanner.next().is_none());

        let entries: Vec<Entry> = scan(bytes, Some("secret"))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        let names: Vec<_> = entries.iter().map(Entry::path).collect();
        assert_eq!(names, ["first.txt", "second.txt"]);
        assert!(entries.iter().all(Entry::is_encrypted));
    }
}
