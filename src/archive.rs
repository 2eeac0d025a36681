//! An opened archive and readers for its entries.
//!
//! [`Archive::open`] scans every header up front, so the entry table is
//! complete and immutable afterwards. Each [`EntryReader`] owns its own
//! media cursor, cipher and decoder; readers of one archive can run on
//! different threads.
//!
//! ```text
//! MediaReader ─► [DecryptingReader] ─► Store | Unpacker ─► VerifyingReader
//! ```
//!
//! An entry split across volumes is read as the chain of its parts, each
//! part with its own cipher.

use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::crypto::{DecryptingReader, EncryptionParams, KeyCache};
use crate::decompress::{CompressionMethod, LzState, UnpackParams, Unpacker};
use crate::error::{ErrorKind, RarError, Result};
use crate::file_media::{FileMedia, LocalFileMedia, MediaReader};
use crate::parsing::{ArchiveInfo, ArchiveVersion, Entry, Scanner};
use crate::session::CancellationToken;
use crate::verify::{Verifier, VerifyingReader};
use crate::volumes::next_volume_path;

type PackedStream = Box<dyn Read + Send>;

/// The packed bytes of an entry inside one volume.
#[derive(Debug, Clone)]
struct DataPart {
    volume: usize,
    offset: u64,
    size: u64,
    encryption: Option<EncryptionParams>,
}

impl DataPart {
    fn of(volume: usize, entry: &Entry) -> Self {
        Self {
            volume,
            offset: entry.data_offset,
            size: entry.packed_size,
            encryption: entry.encryption.clone().filter(|_| entry.is_encrypted()),
        }
    }
}

/// An archive whose headers have been read.
#[derive(Debug)]
pub struct Archive {
    volumes: Vec<Arc<dyn FileMedia>>,
    keys: Arc<KeyCache>,
    info: ArchiveInfo,
    entries: Vec<Entry>,
    /// Data parts of each entry, in volume order
    parts: Vec<Vec<DataPart>>,
}

impl Archive {
    /// Read all headers of `media`. Any header error aborts the open.
    ///
    /// Entries that continue in a further volume stay split and fail to
    /// extract with [`ErrorKind::VolumeContinuationRequired`].
    pub fn open(media: Arc<dyn FileMedia>, password: Option<&str>) -> Result<Self> {
        Self::open_with_resolver(media, password, |_| Ok(None))
    }

    /// Open a multi-volume archive from its volumes in order.
    pub fn open_volumes(volumes: Vec<Arc<dyn FileMedia>>, password: Option<&str>) -> Result<Self> {
        let mut volumes = volumes.into_iter();
        let first = volumes
            .next()
            .ok_or_else(|| RarError::new(ErrorKind::SourceNotFound, "no volumes given"))?;
        let archive = Self::open_with_resolver(first, password, |_| Ok(volumes.next()))?;
        let unused = volumes.count();
        if unused > 0 {
            warn!(unused, "volumes after the last one of the set were ignored");
        }
        Ok(archive)
    }

    /// Open an archive and ask `next_volume` for volume `n` (counting from
    /// 0) whenever volume `n - 1` continues. Returning `None` ends the set.
    pub fn open_with_resolver<F>(
        first: Arc<dyn FileMedia>,
        password: Option<&str>,
        mut next_volume: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> Result<Option<Arc<dyn FileMedia>>>,
    {
        let keys = Arc::new(KeyCache::new(password));
        let mut volumes = vec![first];
        let mut info: Option<ArchiveInfo> = None;
        let mut entries: Vec<Entry> = Vec::new();
        let mut parts: Vec<Vec<DataPart>> = Vec::new();

        loop {
            let volume = volumes.len() - 1;
            let media = Arc::clone(&volumes[volume]);
            let mut scanner = Scanner::open(Arc::clone(&media), Arc::clone(&keys))?;
            if volume > 0 && !scanner.info().is_volume {
                return Err(RarError::corrupt(format!(
                    "{} is not a volume of a multi-volume archive",
                    media.name()
                )));
            }

            for part in scanner.by_ref() {
                let part = part?;
                let data = DataPart::of(volume, &part);
                match (entries.last_mut(), parts.last_mut()) {
                    (Some(entry), Some(entry_parts)) if continues(entry, &part) => {
                        append_part(entry, part);
                        entry_parts.push(data);
                    }
                    _ => {
                        let mut entry = part;
                        entry.index = entries.len();
                        entries.push(entry);
                        parts.push(vec![data]);
                    }
                }
            }

            let volume_info = scanner.info().clone();
            let more = volume_info.continues_in_next_volume
                || entries.last().is_some_and(|e| e.flags.continues_in_next_volume);
            match info.as_mut() {
                Some(info) => info.continues_in_next_volume = volume_info.continues_in_next_volume,
                None => info = Some(volume_info),
            }
            if !more {
                break;
            }
            match next_volume(volumes.len())? {
                Some(media) => {
                    debug!(volume = volumes.len(), source = media.name(), "next volume");
                    volumes.push(media);
                }
                None => {
                    debug!(
                        volumes = volumes.len(),
                        "archive continues in a volume that was not supplied"
                    );
                    break;
                }
            }
        }

        let info = info.ok_or_else(|| RarError::truncated("no archive volume was read"))?;
        info!(
            source = volumes[0].name(),
            version = ?info.version,
            volumes = volumes.len(),
            entries = entries.len(),
            solid = info.is_solid,
            "archive opened"
        );
        Ok(Self {
            volumes,
            keys,
            info,
            entries,
            parts,
        })
    }

    /// Open an archive file from disk. Further volumes are looked up next
    /// to it by name.
    pub fn open_path(path: impl AsRef<Path>, password: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let media: Arc<dyn FileMedia> = Arc::new(LocalFileMedia::open(path)?);
        let mut current = path.to_path_buf();
        Self::open_with_resolver(media, password, move |_| {
            let Some(next) = next_volume_path(&current).filter(|p| p.is_file()) else {
                return Ok(None);
            };
            let media: Arc<dyn FileMedia> = Arc::new(LocalFileMedia::open(&next)?);
            current = next;
            Ok(Some(media))
        })
    }

    pub fn version(&self) -> ArchiveVersion {
        self.info.version
    }

    pub fn info(&self) -> &ArchiveInfo {
        &self.info
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    /// The first volume.
    pub fn media(&self) -> &Arc<dyn FileMedia> {
        &self.volumes[0]
    }

    pub fn volumes(&self) -> &[Arc<dyn FileMedia>] {
        &self.volumes
    }

    /// Whether extracting `index` depends on the decoder state left by an
    /// earlier entry.
    pub fn is_solid_continuation(&self, index: usize) -> bool {
        self.entries
            .get(index)
            .is_some_and(|e| e.flags.is_solid && e.method.needs_decompression())
    }

    /// Open a reader over the unpacked data of entry `index`.
    ///
    /// Entries that continue a solid stream need the decoder state of
    /// their predecessor. Pass the state from the previous entry's reader
    /// as `carry` when reading a solid archive in order; otherwise the
    /// predecessors are decoded again first.
    pub fn open_entry(&self, index: usize, carry: Option<LzState>) -> Result<EntryReader> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| RarError::new(ErrorKind::Unknown, format!("no entry {index}")))?;
        let path = entry.path();
        self.check_extractable(entry)
            .map_err(|e| e.with_entry(path.clone()))?;

        if entry.is_directory() {
            return Ok(EntryReader {
                path,
                index,
                body: Body::Empty,
                encrypted: false,
                cancel: None,
            });
        }

        let carry = if self.is_solid_continuation(index) {
            match carry {
                Some(state) if Some(state.entry_index()) == self.solid_predecessor(index) => {
                    Some(state)
                }
                _ => self.replay_solid_group(index).map_err(|e| e.with_entry(path.clone()))?,
            }
        } else {
            None
        };

        let body = self
            .open_body(entry, carry)
            .map_err(|e| e.with_entry(path.clone()))?;
        let key = self.entry_key(entry).map_err(|e| e.with_entry(path.clone()))?;
        let verifier = Verifier::new(entry.checksum, key.and_then(|k| k.hash_key));
        debug!(index, path = %path, method = ?entry.method, "opened entry");
        Ok(EntryReader {
            path,
            index,
            body: Body::Verified(VerifyingReader::new(body, verifier)),
            encrypted: entry.is_encrypted(),
            cancel: None,
        })
    }

    fn check_extractable(&self, entry: &Entry) -> Result<()> {
        if entry.is_directory() {
            return Ok(());
        }
        if entry.is_split() {
            return Err(RarError::from_kind(ErrorKind::VolumeContinuationRequired));
        }
        if let Some(reason) = entry.unsupported {
            return Err(RarError::new(ErrorKind::UnsupportedMethod, reason));
        }
        if !entry.method.is_supported() {
            return Err(RarError::new(
                ErrorKind::UnsupportedMethod,
                format!("compression method {:?} is not supported", entry.method),
            ));
        }
        if entry.is_encrypted() && !self.keys.has_password() {
            return Err(RarError::from_kind(ErrorKind::PasswordRequired));
        }
        Ok(())
    }

    fn entry_key(&self, entry: &Entry) -> Result<Option<crate::crypto::EntryKey>> {
        match &entry.encryption {
            Some(params) if entry.is_encrypted() => Ok(Some(self.keys.entry_key(params)?)),
            _ => Ok(None),
        }
    }

    /// The packed stream of an entry, decrypted when needed. Parts in
    /// later volumes follow on.
    fn packed_stream(&self, entry: &Entry) -> Result<PackedStream> {
        let parts = self.parts.get(entry.index).map_or(&[][..], Vec::as_slice);
        let mut stream: Option<PackedStream> = None;
        for part in parts {
            let end = part.offset.saturating_add(part.size);
            let raw = MediaReader::bounded(Arc::clone(&self.volumes[part.volume]), part.offset, end);
            let next: PackedStream = match &part.encryption {
                Some(params) => Box::new(DecryptingReader::new(raw, &self.keys.entry_key(params)?)),
                None => Box::new(raw),
            };
            stream = Some(match stream {
                Some(prev) => Box::new(prev.chain(next)),
                None => next,
            });
        }
        Ok(stream.unwrap_or_else(|| Box::new(io::empty())))
    }

    fn open_body(&self, entry: &Entry, carry: Option<LzState>) -> Result<DataBody> {
        let packed = self.packed_stream(entry)?;
        if entry.method == CompressionMethod::Store {
            let limit = if entry.unpacked_size_known {
                entry.unpacked_size
            } else {
                entry.packed_size
            };
            return Ok(DataBody::Stored(packed.take(limit)));
        }
        let params = UnpackParams {
            method: entry.method,
            dict_size: entry.dict_size,
            unpacked_size: entry.unpacked_size_known.then_some(entry.unpacked_size),
            solid_archive: self.info.is_solid,
        };
        Ok(DataBody::Packed(Box::new(Unpacker::new(packed, params, carry)?)))
    }

    /// The closest earlier entry whose decoder state `index` continues.
    fn solid_predecessor(&self, index: usize) -> Option<usize> {
        self.entries[..index]
            .iter()
            .rposition(|e| !e.is_directory() && e.method.needs_decompression())
    }

    /// Decode the entries of the solid group before `index`, discarding
    /// their output, and return the decoder state they leave behind.
    fn replay_solid_group(&self, index: usize) -> Result<Option<LzState>> {
        let mut chain = Vec::new();
        let mut cursor = index;
        while let Some(prev) = self.solid_predecessor(cursor) {
            chain.push(prev);
            if !self.entries[prev].flags.is_solid {
                break;
            }
            cursor = prev;
        }
        chain.reverse();
        debug!(index, replayed = chain.len(), "replaying solid group");

        let mut state = None;
        for prev in chain {
            let entry = &self.entries[prev];
            self.check_extractable(entry)?;
            let mut unpacker = match self.open_body(entry, state.take())? {
                DataBody::Packed(unpacker) => unpacker,
                DataBody::Stored(_) => continue,
            };
            io::copy(&mut unpacker, &mut io::sink()).map_err(RarError::from)?;
            state = Some(unpacker.into_state(prev));
        }
        Ok(state)
    }
}

/// `part` is the next piece of `entry`, found at the start of the
/// following volume.
fn continues(entry: &Entry, part: &Entry) -> bool {
    entry.flags.continues_in_next_volume
        && part.flags.continues_from_previous_volume
        && entry.raw_name == part.raw_name
}

/// Merge the header of a continuation part. The last part carries the
/// checksum of the whole file.
fn append_part(entry: &mut Entry, part: Entry) {
    entry.packed_size = entry.packed_size.saturating_add(part.packed_size);
    entry.flags.continues_in_next_volume = part.flags.continues_in_next_volume;
    entry.checksum = part.checksum;
    if part.encryption.is_some() {
        entry.encryption = part.encryption;
    }
}

enum DataBody {
    Stored(io::Take<PackedStream>),
    Packed(Box<Unpacker<PackedStream>>),
}

impl Read for DataBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            DataBody::Stored(r) => r.read(buf),
            DataBody::Packed(r) => r.read(buf),
        }
    }
}

enum Body {
    Empty,
    Verified(VerifyingReader<DataBody>),
}

/// Unpacked, verified data of one entry.
///
/// A checksum mismatch is reported by the final `read` instead of end of
/// file. Errors carry the entry path; for encrypted entries, faults that
/// a wrong password produces are reported as [`ErrorKind::BadPassword`].
pub struct EntryReader {
    path: String,
    index: usize,
    body: Body,
    encrypted: bool,
    cancel: Option<CancellationToken>,
}

impl EntryReader {
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Fail reads with [`ErrorKind::Cancelled`] once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Decoder state for the next entry of a solid group. Only available
    /// once a compressed entry has been read to the end.
    pub fn into_lz_state(self) -> Option<LzState> {
        match self.body {
            Body::Verified(reader) => match reader.into_inner() {
                DataBody::Packed(unpacker)
                    if unpacker.status() == crate::decompress::DecodeStatus::Done =>
                {
                    Some(unpacker.into_state(self.index))
                }
                _ => None,
            },
            Body::Empty => None,
        }
    }

    fn classify(&self, err: io::Error) -> io::Error {
        let mut err = RarError::from(err);
        if self.encrypted
            && matches!(
                err.kind(),
                ErrorKind::ChecksumMismatch | ErrorKind::DecompressionFault
            )
        {
            err = err.with_kind(ErrorKind::BadPassword);
        }
        err.with_entry(self.path.clone()).into()
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(RarError::from_kind(ErrorKind::Cancelled)
                .with_entry(self.path.clone())
                .into());
        }
        let result = match &mut self.body {
            Body::Empty => Ok(0),
            Body::Verified(reader) => reader.read(buf),
        };
        result.map_err(|e| self.classify(e))
    }
}

impl std::fmt::Debug for EntryReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryReader")
            .field("path", &self.path)
            .field("index", &self.index)
            .field("encrypted", &self.encrypted)
            .finish_non_exhaustive()
    }
}
