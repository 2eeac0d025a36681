//! Listing and extraction of whole archives.
//!
//! [`list`] and [`extract`] work on any [`FileMedia`] and hand their
//! results to caller-supplied sinks. [`list_archive`] and
//! [`extract_archive`] are the file-system conveniences built on them; they
//! find further volumes of a split archive by file name.
//!
//! Extraction has partial-failure semantics: a failing entry is recorded in
//! the [`ExtractSummary`] and the run moves on to the next entry, unless
//! [`ExtractOptions::abort_on_first_failure`] is set.

use std::fs;
use std::io::{self, Read, Write};
use std::ops::ControlFlow;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::archive::Archive;
use crate::crypto::KeyCache;
use crate::decompress::LzState;
use crate::error::{ErrorKind, RarError, Result};
use crate::file_media::{FileMedia, LocalFileMedia, CHUNK_SIZE};
use crate::parsing::{Entry, HostOs, Scanner};
use crate::volumes::next_volume_path;

/// Cooperative cancellation flag, shared by clones.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// What [`FsSink`] does when the output file already exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Overwrite {
    #[default]
    Replace,
    /// Leave the existing file and report the entry as skipped.
    Skip,
    /// Fail the entry with [`ErrorKind::OutputFailure`].
    Error,
}

/// Extraction settings.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub password: Option<String>,
    pub abort_on_first_failure: bool,
    pub preserve_mtime: bool,
    /// Apply Unix permission bits of entries archived on Unix.
    pub preserve_permissions: bool,
    pub overwrite: Overwrite,
    pub cancel: Option<CancellationToken>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            password: None,
            abort_on_first_failure: false,
            preserve_mtime: true,
            preserve_permissions: true,
            overwrite: Overwrite::Replace,
            cancel: None,
        }
    }
}

impl ExtractOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn abort_on_first_failure(mut self, abort: bool) -> Self {
        self.abort_on_first_failure = abort;
        self
    }

    pub fn preserve_mtime(mut self, preserve: bool) -> Self {
        self.preserve_mtime = preserve;
        self
    }

    pub fn preserve_permissions(mut self, preserve: bool) -> Self {
        self.preserve_permissions = preserve;
        self
    }

    pub fn overwrite(mut self, overwrite: Overwrite) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// An entry that could not be extracted.
#[derive(Debug)]
pub struct EntryFailure {
    pub path: String,
    pub kind: ErrorKind,
    pub error: RarError,
}

/// Outcome of an extraction run.
#[derive(Debug, Default)]
pub struct ExtractSummary {
    /// Output paths of extracted files and created directories.
    pub succeeded: Vec<PathBuf>,
    pub failed: Vec<EntryFailure>,
    /// Entries left alone because their output already existed.
    pub skipped: Vec<PathBuf>,
}

impl ExtractSummary {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Extraction progress, reported in archive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Started { total_entries: usize },
    EntryStarted { index: usize, path: String },
    EntryFinished { index: usize, path: String, bytes: u64 },
    EntrySkipped { index: usize, path: String },
    EntryFailed { index: usize, path: String, kind: ErrorKind },
    Finished { succeeded: usize, failed: usize },
}

/// Result of handing one entry to a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { bytes: u64 },
    Skipped,
}

/// Receives extracted entries. Paths are already resolved inside the
/// destination root.
pub trait EntrySink {
    fn create_dir(&mut self, path: &Path) -> Result<()>;

    /// Consume `reader` to its end. The final read fails when the entry's
    /// checksum does not match; such output must not be kept.
    fn write_file(&mut self, path: &Path, entry: &Entry, reader: &mut dyn Read)
        -> Result<WriteOutcome>;
}

/// Writes entries to the local file system.
///
/// Files are written to a temporary file next to their destination and
/// renamed into place only once all data has been read and verified.
#[derive(Debug, Clone)]
pub struct FsSink {
    overwrite: Overwrite,
    preserve_mtime: bool,
    preserve_permissions: bool,
}

impl FsSink {
    pub fn new(options: &ExtractOptions) -> Self {
        Self {
            overwrite: options.overwrite,
            preserve_mtime: options.preserve_mtime,
            preserve_permissions: options.preserve_permissions,
        }
    }

    fn apply_metadata(&self, file: &fs::File, entry: &Entry) -> io::Result<()> {
        if self.preserve_mtime {
            if let Some(mtime) = entry.mtime {
                file.set_modified(mtime.to_system_time())?;
            }
        }
        let mode = if self.preserve_permissions && entry.host_os == HostOs::Unix {
            (entry.attributes & 0o777) as u32
        } else {
            0o644
        };
        set_mode(file, mode)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(file: &fs::File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_file: &fs::File, _mode: u32) -> io::Result<()> {
    Ok(())
}

impl EntrySink for FsSink {
    fn create_dir(&mut self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| RarError::io(ErrorKind::OutputFailure, e))
    }

    fn write_file(
        &mut self,
        path: &Path,
        entry: &Entry,
        reader: &mut dyn Read,
    ) -> Result<WriteOutcome> {
        let output = |e| RarError::io(ErrorKind::OutputFailure, e);
        if path.exists() {
            match self.overwrite {
                Overwrite::Replace => {}
                Overwrite::Skip => return Ok(WriteOutcome::Skipped),
                Overwrite::Error => {
                    return Err(RarError::new(
                        ErrorKind::OutputFailure,
                        format!("{} already exists", path.display()),
                    ))
                }
            }
        }
        let parent = path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent).map_err(output)?;
        let mut temp = NamedTempFile::new_in(parent).map_err(output)?;

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut bytes = 0u64;
        loop {
            let n = match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(RarError::from(e)),
            };
            temp.write_all(&buf[..n]).map_err(output)?;
            bytes += n as u64;
        }
        temp.flush().map_err(output)?;
        self.apply_metadata(temp.as_file(), entry).map_err(output)?;
        temp.persist(path).map_err(|e| output(e.error))?;
        Ok(WriteOutcome::Written { bytes })
    }
}

/// Map an archived path below `root`.
///
/// Both separators are accepted. Absolute paths, drive prefixes, `..`
/// components and paths without any name are rejected with
/// [`ErrorKind::PathEscapesDestination`].
pub fn resolve_path(root: &Path, entry_path: &str) -> Result<PathBuf> {
    let escape = |why: &str| {
        RarError::new(
            ErrorKind::PathEscapesDestination,
            format!("{why}: {entry_path:?}"),
        )
        .with_entry(entry_path)
    };
    let normalized = entry_path.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(escape("absolute path"));
    }
    let bytes = normalized.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(escape("drive prefix"));
    }

    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return Err(escape("parent directory component")),
            name => {
                if !matches!(Path::new(name).components().next(), Some(Component::Normal(_))) {
                    return Err(escape("invalid path component"));
                }
                out.push(name);
                depth += 1;
            }
        }
    }
    if depth == 0 {
        return Err(escape("empty path"));
    }
    Ok(out)
}

/// Emit entries in archive order until `sink` breaks.
///
/// Entries are produced while the headers are read; a header error ends
/// the listing after the entries that came before it.
pub fn list<F>(media: Arc<dyn FileMedia>, password: Option<&str>, mut sink: F) -> Result<()>
where
    F: FnMut(&Entry) -> ControlFlow<()>,
{
    let keys = Arc::new(KeyCache::new(password));
    for entry in Scanner::open(media, keys)? {
        if sink(&entry?).is_break() {
            break;
        }
    }
    Ok(())
}

/// Extract every entry of `media` below `destination_root` through `sink`.
pub fn extract(
    media: Arc<dyn FileMedia>,
    destination_root: &Path,
    options: &ExtractOptions,
    sink: &mut dyn EntrySink,
    on_progress: Option<&mut dyn FnMut(Progress)>,
) -> Result<ExtractSummary> {
    extract_volumes(vec![media], destination_root, options, sink, on_progress)
}

/// Like [`extract`], for an archive split into `volumes` (in order).
pub fn extract_volumes(
    volumes: Vec<Arc<dyn FileMedia>>,
    destination_root: &Path,
    options: &ExtractOptions,
    sink: &mut dyn EntrySink,
    on_progress: Option<&mut dyn FnMut(Progress)>,
) -> Result<ExtractSummary> {
    let archive = Archive::open_volumes(volumes, options.password.as_deref())?;
    extract_opened(&archive, destination_root, options, sink, on_progress)
}

fn extract_opened(
    archive: &Archive,
    destination_root: &Path,
    options: &ExtractOptions,
    sink: &mut dyn EntrySink,
    mut on_progress: Option<&mut dyn FnMut(Progress)>,
) -> Result<ExtractSummary> {
    let mut report = |event: Progress| {
        if let Some(callback) = on_progress.as_mut() {
            callback(event);
        }
    };

    sink.create_dir(destination_root)?;
    report(Progress::Started {
        total_entries: archive.entries().len(),
    });

    let mut summary = ExtractSummary::default();
    let mut carry = None;
    for (index, entry) in archive.entries().iter().enumerate() {
        if options.is_cancelled() {
            info!(index, "extraction cancelled");
            break;
        }
        let path = entry.path();
        report(Progress::EntryStarted {
            index,
            path: path.clone(),
        });

        match extract_entry(archive, index, destination_root, options, sink, &mut carry) {
            Ok((target, WriteOutcome::Written { bytes })) => {
                debug!(index, path = %path, bytes, "extracted");
                summary.succeeded.push(target);
                report(Progress::EntryFinished { index, path, bytes });
            }
            Ok((target, WriteOutcome::Skipped)) => {
                debug!(index, path = %path, "output exists, skipped");
                summary.skipped.push(target);
                report(Progress::EntrySkipped { index, path });
            }
            Err(error) => {
                let kind = error.kind();
                warn!(index, path = %path, ?kind, %error, "entry failed");
                report(Progress::EntryFailed {
                    index,
                    path: path.clone(),
                    kind,
                });
                if options.abort_on_first_failure {
                    return Err(error);
                }
                summary.failed.push(EntryFailure { path, kind, error });
                if kind == ErrorKind::Cancelled {
                    break;
                }
            }
        }
    }

    info!(
        succeeded = summary.succeeded.len(),
        failed = summary.failed.len(),
        skipped = summary.skipped.len(),
        "extraction finished"
    );
    report(Progress::Finished {
        succeeded: summary.succeeded.len(),
        failed: summary.failed.len(),
    });
    Ok(summary)
}

pub(crate) fn extract_entry(
    archive: &Archive,
    index: usize,
    destination_root: &Path,
    options: &ExtractOptions,
    sink: &mut dyn EntrySink,
    carry: &mut Option<LzState>,
) -> Result<(PathBuf, WriteOutcome)> {
    let entry = &archive.entries()[index];
    let path = entry.path();
    let target = resolve_path(destination_root, &path)?;
    if entry.is_directory() {
        sink.create_dir(&target).map_err(|e| e.with_entry(path))?;
        return Ok((target, WriteOutcome::Written { bytes: 0 }));
    }

    let state = if archive.is_solid_continuation(index) {
        carry.take()
    } else {
        None
    };
    let mut reader = archive.open_entry(index, state)?;
    if let Some(token) = &options.cancel {
        reader = reader.with_cancellation(token.clone());
    }
    let outcome = sink
        .write_file(&target, entry, &mut reader)
        .map_err(|e| e.with_entry(path))?;
    if outcome != WriteOutcome::Skipped {
        // A sink may stop early; the checksum is only known at the end.
        io::copy(&mut reader, &mut io::sink()).map_err(RarError::from)?;
    }
    if let Some(state) = reader.into_lz_state() {
        *carry = Some(state);
    }
    Ok((target, outcome))
}

/// Listing record of [`list_archive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub path: String,
    pub size: u64,
    pub is_directory: bool,
    pub is_encrypted: bool,
}

impl From<&Entry> for EntryInfo {
    fn from(entry: &Entry) -> Self {
        Self {
            path: entry.path(),
            size: entry.unpacked_size,
            is_directory: entry.is_directory(),
            is_encrypted: entry.is_encrypted(),
        }
    }
}

/// Lazy listing of an archive file, see [`list_archive`].
///
/// Further volumes are opened as the listing reaches them; an entry split
/// across volumes is listed once.
pub struct ListIter {
    scanner: Scanner,
    keys: Arc<KeyCache>,
    /// Volume the scanner reads
    path: PathBuf,
    /// Name of the last entry when it continues in the next volume
    split_name: Option<Vec<u8>>,
    finished: bool,
}

impl ListIter {
    fn open_next_volume(&mut self) -> Option<Result<()>> {
        let continues = self.scanner.info().continues_in_next_volume || self.split_name.is_some();
        if !continues {
            return None;
        }
        let next = next_volume_path(&self.path).filter(|p| p.is_file())?;
        debug!(volume = %next.display(), "listing next volume");
        let opened = LocalFileMedia::open(&next).and_then(|media| {
            let media: Arc<dyn FileMedia> = Arc::new(media);
            Scanner::open(media, Arc::clone(&self.keys))
        });
        Some(opened.map(|scanner| {
            self.scanner = scanner;
            self.path = next;
        }))
    }
}

impl Iterator for ListIter {
    type Item = Result<EntryInfo>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            match self.scanner.next() {
                Some(Ok(entry)) => {
                    let continuation = entry.flags.continues_from_previous_volume
                        && self.split_name.as_deref() == Some(entry.raw_name.as_slice());
                    self.split_name = entry
                        .flags
                        .continues_in_next_volume
                        .then(|| entry.raw_name.clone());
                    if !continuation {
                        return Some(Ok(EntryInfo::from(&entry)));
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => match self.open_next_volume() {
                    Some(Ok(())) => {}
                    Some(Err(e)) => {
                        self.finished = true;
                        return Some(Err(e));
                    }
                    None => self.finished = true,
                },
            }
        }
        None
    }
}

/// List an archive file. Headers are read as the iterator advances.
pub fn list_archive(path: impl AsRef<Path>, password: Option<&str>) -> Result<ListIter> {
    let path = path.as_ref();
    let media: Arc<dyn FileMedia> = Arc::new(LocalFileMedia::open(path)?);
    let keys = Arc::new(KeyCache::new(password));
    let scanner = Scanner::open(media, Arc::clone(&keys))?;
    Ok(ListIter {
        scanner,
        keys,
        path: path.to_path_buf(),
        split_name: None,
        finished: false,
    })
}

/// Extract an archive file below `destination` with default options.
/// Further volumes are looked up next to `path`.
pub fn extract_archive(
    path: impl AsRef<Path>,
    destination: impl AsRef<Path>,
    password: Option<&str>,
    on_progress: Option<&mut dyn FnMut(Progress)>,
) -> Result<ExtractSummary> {
    let archive = Archive::open_path(path, password)?;
    let mut options = ExtractOptions::new();
    if let Some(password) = password {
        options = options.password(password);
    }
    let mut sink = FsSink::new(&options);
    extract_opened(&archive, destination.as_ref(), &options, &mut sink, on_progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_media::MemoryMedia;
    use crate::test_support::{ArchiveBuilder, Format, TestEntry, FIXTURE_UNIX_TIME};
    use std::time::{Duration, UNIX_EPOCH};

    fn media(bytes: Vec<u8>) -> Arc<dyn FileMedia> {
        Arc::new(MemoryMedia::new("test.rar", bytes))
    }

    fn sample(format: Format) -> Vec<u8> {
        ArchiveBuilder::new(format)
            .entry(TestEntry::directory("docs"))
            .entry(TestEntry::stored("docs/readme.txt", b"read me"))
            .entry(TestEntry::compressed("docs/notes.txt", b"notes notes notes"))
            .build()
    }

    /// Collects entries in memory.
    #[derive(Default)]
    struct MemorySink {
        dirs: Vec<PathBuf>,
        files: Vec<(PathBuf, Vec<u8>)>,
    }

    impl EntrySink for MemorySink {
        fn create_dir(&mut self, path: &Path) -> Result<()> {
            self.dirs.push(path.to_path_buf());
            Ok(())
        }

        fn write_file(
            &mut self,
            path: &Path,
            _entry: &Entry,
            reader: &mut dyn Read,
        ) -> Result<WriteOutcome> {
            let mut data = Vec::new();
            reader.read_to_end(&mut data)?;
            let bytes = data.len() as u64;
            self.files.push((path.to_path_buf(), data));
            Ok(WriteOutcome::Written { bytes })
        }
    }

    #[test]
    fn test_resolve_path() {
        let root = Path::new("/out");
        assert_eq!(resolve_path(root, "a/b.txt").unwrap(), Path::new("/out/a/b.txt"));
        assert_eq!(resolve_path(root, "a\\b.txt").unwrap(), Path::new("/out/a/b.txt"));
        assert_eq!(resolve_path(root, "./a//b").unwrap(), Path::new("/out/a/b"));
        for bad in ["../../etc/passwd", "a/../../x", "/etc/passwd", "\\\\server\\share", "C:\\win", "c:x", "", "./"] {
            let err = resolve_path(root, bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PathEscapesDestination, "{bad:?}");
        }
    }

    #[test]
    fn test_list_in_order_and_break() {
        for format in [Format::Rar4, Format::Rar5] {
            let mut names = Vec::new();
            list(media(sample(format)), None, |e| {
                names.push(e.path());
                ControlFlow::Continue(())
            })
            .unwrap();
            assert_eq!(names, ["docs", "docs/readme.txt", "docs/notes.txt"]);

            let mut seen = 0;
            list(media(sample(format)), None, |_| {
                seen += 1;
                ControlFlow::Break(())
            })
            .unwrap();
            assert_eq!(seen, 1);
        }
    }

    #[test]
    fn test_list_stops_at_truncation() {
        let mut bytes = sample(Format::Rar5);
        // Cut into the data of the last entry
        bytes.truncate(bytes.len() - 12);
        let mut names = Vec::new();
        let err = list(media(bytes), None, |e| {
            names.push(e.path());
            ControlFlow::Continue(())
        })
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Truncated | ErrorKind::CorruptHeader));
        assert_eq!(names, ["docs", "docs/readme.txt"]);
    }

    #[test]
    fn test_extract_to_memory_sink_with_progress() {
        let mut sink = MemorySink::default();
        let mut events = Vec::new();
        let mut on_progress = |p: Progress| events.push(p);
        let summary = extract(
            media(sample(Format::Rar4)),
            Path::new("root"),
            &ExtractOptions::default(),
            &mut sink,
            Some(&mut on_progress),
        )
        .unwrap();

        assert!(summary.is_complete());
        assert_eq!(summary.succeeded.len(), 3);
        assert_eq!(sink.dirs, [PathBuf::from("root"), PathBuf::from("root/docs")]);
        assert_eq!(sink.files[0], (PathBuf::from("root/docs/readme.txt"), b"read me".to_vec()));
        assert_eq!(sink.files[1].1, b"notes notes notes");
        assert_eq!(events.first(), Some(&Progress::Started { total_entries: 3 }));
        assert_eq!(
            events.last(),
            Some(&Progress::Finished {
                succeeded: 3,
                failed: 0
            })
        );
    }

    #[test]
    fn test_partial_failure_continues() {
        let bytes = ArchiveBuilder::new(Format::Rar5)
            .entry(TestEntry::stored("ok1.txt", b"one"))
            .entry(TestEntry::stored("../../etc/passwd", b"root::0:0"))
            .entry(TestEntry::stored("bad.txt", b"two").with_crc(7))
            .entry(TestEntry::stored("ok2.txt", b"three"))
            .build();
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out");
        let options = ExtractOptions::default();
        let summary = extract(media(bytes), &dest, &options, &mut FsSink::new(&options), None).unwrap();

        assert_eq!(summary.succeeded, [dest.join("ok1.txt"), dest.join("ok2.txt")]);
        let kinds: Vec<_> = summary.failed.iter().map(|f| (f.path.as_str(), f.kind)).collect();
        assert_eq!(
            kinds,
            [
                ("../../etc/passwd", ErrorKind::PathEscapesDestination),
                ("bad.txt", ErrorKind::ChecksumMismatch),
            ]
        );
        // Nothing outside the root, no output under the final name for bad data
        assert!(!dir.path().join("etc").exists());
        assert!(!dest.join("bad.txt").exists());
        let leftovers = fs::read_dir(&dest).unwrap().count();
        assert_eq!(leftovers, 2);
        assert_eq!(fs::read(dest.join("ok2.txt")).unwrap(), b"three");
    }

    #[test]
    fn test_abort_on_first_failure() {
        let bytes = ArchiveBuilder::new(Format::Rar4)
            .entry(TestEntry::stored("bad.txt", b"x").with_crc(1))
            .entry(TestEntry::stored("never.txt", b"y"))
            .build();
        let options = ExtractOptions::new().abort_on_first_failure(true);
        let mut sink = MemorySink::default();
        let err = extract(media(bytes), Path::new("r"), &options, &mut sink, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
        assert!(sink.files.iter().all(|(p, _)| !p.ends_with("never.txt")));
    }

    #[test]
    fn test_password_errors_are_per_entry() {
        let bytes = ArchiveBuilder::new(Format::Rar5)
            .password("pw")
            .entry(TestEntry::stored("a.txt", b"aaa"))
            .build();
        let options = ExtractOptions::default();
        let summary =
            extract(media(bytes.clone()), Path::new("r"), &options, &mut MemorySink::default(), None)
                .unwrap();
        assert_eq!(summary.failed[0].kind, ErrorKind::PasswordRequired);

        let options = ExtractOptions::new().password("nope");
        let summary =
            extract(media(bytes.clone()), Path::new("r"), &options, &mut MemorySink::default(), None)
                .unwrap();
        assert_eq!(summary.failed[0].kind, ErrorKind::BadPassword);

        let options = ExtractOptions::new().password("pw");
        let mut sink = MemorySink::default();
        extract(media(bytes), Path::new("r"), &options, &mut sink, None).unwrap();
        assert_eq!(sink.files[0].1, b"aaa");
    }

    #[test]
    fn test_encrypted_headers_need_password_to_open() {
        let bytes = ArchiveBuilder::new(Format::Rar5)
            .password("pw")
            .encrypt_headers()
            .entry(TestEntry::stored("hidden.txt", b"hidden"))
            .build();
        let err = list(media(bytes.clone()), None, |_| ControlFlow::Continue(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PasswordRequired);
        let err = list(media(bytes.clone()), Some("bad"), |_| ControlFlow::Continue(())).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadPassword);

        let options = ExtractOptions::new().password("pw");
        let mut sink = MemorySink::default();
        extract(media(bytes), Path::new("r"), &options, &mut sink, None).unwrap();
        assert_eq!(sink.files[0].1, b"hidden");
    }

    #[test]
    fn test_cancel_between_entries() {
        let token = CancellationToken::new();
        let options = ExtractOptions::new().cancellation(token.clone());
        let mut sink = MemorySink::default();
        let mut on_progress = |p: Progress| {
            if matches!(p, Progress::EntryFinished { index: 1, .. }) {
                token.cancel();
            }
        };
        let summary = extract(
            media(sample(Format::Rar5)),
            Path::new("r"),
            &options,
            &mut sink,
            Some(&mut on_progress),
        )
        .unwrap();
        assert_eq!(summary.succeeded.len(), 2);
        assert!(summary.failed.is_empty());
        assert_eq!(sink.files.len(), 1);
    }

    #[test]
    fn test_cancel_during_entry() {
        /// Cancels the run after the first chunk of data.
        struct CancellingSink(CancellationToken);

        impl EntrySink for CancellingSink {
            fn create_dir(&mut self, _path: &Path) -> Result<()> {
                Ok(())
            }

            fn write_file(
                &mut self,
                _path: &Path,
                _entry: &Entry,
                reader: &mut dyn Read,
            ) -> Result<WriteOutcome> {
                let mut byte = [0u8; 1];
                reader.read_exact(&mut byte)?;
                self.0.cancel();
                io::copy(reader, &mut io::sink())?;
                Ok(WriteOutcome::Written { bytes: 1 })
            }
        }

        let token = CancellationToken::new();
        let options = ExtractOptions::new().cancellation(token.clone());
        let summary = extract(
            media(sample(Format::Rar4)),
            Path::new("r"),
            &options,
            &mut CancellingSink(token),
            None,
        )
        .unwrap();
        assert_eq!(summary.succeeded.len(), 1);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].kind, ErrorKind::Cancelled);
        assert_eq!(summary.failed[0].path, "docs/readme.txt");
    }

    #[test]
    fn test_fs_sink_metadata_and_overwrite() {
        let bytes = ArchiveBuilder::new(Format::Rar5)
            .entry(TestEntry::stored("f.txt", b"new"))
            .build();
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("f.txt");
        fs::write(&existing, b"old").unwrap();

        let options = ExtractOptions::new().overwrite(Overwrite::Skip);
        let summary =
            extract(media(bytes.clone()), dir.path(), &options, &mut FsSink::new(&options), None)
                .unwrap();
        assert_eq!(summary.skipped, [existing.clone()]);
        assert_eq!(fs::read(&existing).unwrap(), b"old");

        let options = ExtractOptions::new().overwrite(Overwrite::Error);
        let summary =
            extract(media(bytes.clone()), dir.path(), &options, &mut FsSink::new(&options), None)
                .unwrap();
        assert_eq!(summary.failed[0].kind, ErrorKind::OutputFailure);

        let options = ExtractOptions::default();
        extract(media(bytes), dir.path(), &options, &mut FsSink::new(&options), None).unwrap();
        assert_eq!(fs::read(&existing).unwrap(), b"new");
        let modified = fs::metadata(&existing).unwrap().modified().unwrap();
        assert_eq!(
            modified,
            UNIX_EPOCH + Duration::from_secs(u64::from(FIXTURE_UNIX_TIME))
        );
    }

    #[test]
    fn test_file_conveniences() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("sample.rar");
        fs::write(&archive, sample(Format::Rar5)).unwrap();

        let infos: Vec<_> = list_archive(&archive, None)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(infos.len(), 3);
        assert!(infos[0].is_directory);
        assert_eq!(infos[1].size, 7);

        let out = dir.path().join("out");
        let summary = extract_archive(&archive, &out, None, None).unwrap();
        assert!(summary.is_complete());
        assert_eq!(fs::read(out.join("docs/notes.txt")).unwrap(), b"notes notes notes");

        let err = list_archive(dir.path().join("missing.rar"), None).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::SourceNotFound);
    }

    fn volume_set(format: Format) -> Vec<Vec<u8>> {
        ArchiveBuilder::new(format)
            .entry(TestEntry::stored("first.txt", b"one"))
            .entry(TestEntry::stored("split.bin", &[7u8; 40]).split_at(16))
            .entry(TestEntry::compressed("last.txt", b"last last last"))
            .build_volumes()
    }

    #[test]
    fn test_extract_volumes() {
        for format in [Format::Rar4, Format::Rar5] {
            let volumes: Vec<_> = volume_set(format).into_iter().map(media).collect();
            assert_eq!(volumes.len(), 3);
            let mut sink = MemorySink::default();
            let options = ExtractOptions::default();
            let summary = extract_volumes(volumes, Path::new("r"), &options, &mut sink, None).unwrap();
            assert!(summary.is_complete());
            assert_eq!(sink.files.len(), 3);
            assert_eq!(sink.files[1], (PathBuf::from("r/split.bin"), vec![7u8; 40]));
            assert_eq!(sink.files[2].1, b"last last last");
        }
    }

    #[test]
    fn test_file_conveniences_follow_volumes() {
        let dir = tempfile::tempdir().unwrap();
        for (n, bytes) in volume_set(Format::Rar5).iter().enumerate() {
            let name = if n == 0 { "old.rar".to_string() } else { format!("old.r{:02}", n - 1) };
            fs::write(dir.path().join(name), bytes).unwrap();
        }
        let first = dir.path().join("old.rar");

        let names: Vec<_> = list_archive(&first, None)
            .unwrap()
            .map(|info| info.map(|info| info.path))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(names, ["first.txt", "split.bin", "last.txt"]);

        let out = dir.path().join("out");
        let summary = extract_archive(&first, &out, None, None).unwrap();
        assert!(summary.is_complete());
        assert_eq!(fs::read(out.join("split.bin")).unwrap(), [7u8; 40]);

        // The listing of a lone first volume ends with the split entry
        fs::remove_file(dir.path().join("old.r00")).unwrap();
        let names: Vec<_> = list_archive(&first, None)
            .unwrap()
            .map(|info| info.map(|info| info.path))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(names, ["first.txt", "split.bin"]);
    }
}
