//! Byte sources for archive reading.
//!
//! [`FileMedia`] abstracts random access to the archive bytes. All
//! implementations are `Send + Sync`; the ones backed by a single OS handle
//! serialize seek+read pairs behind a mutex so several entry readers can share
//! one source.
//!
//! [`MediaReader`] is the buffered byte cursor the header parser and entry
//! readers use. It is bounded to a byte range and never reads past it.

use std::fmt;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{ErrorKind, RarError, Result};

/// Buffer chunk size for [`MediaReader`].
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Random-access byte source.
pub trait FileMedia: Send + Sync {
    /// Total length in bytes.
    fn length(&self) -> u64;

    /// Display name (file name for local files).
    fn name(&self) -> &str;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read; fewer than requested only at the end of the media.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl fmt::Debug for dyn FileMedia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileMedia")
            .field("name", &self.name())
            .field("length", &self.length())
            .finish()
    }
}

/// Local file implementation.
pub struct LocalFileMedia {
    path: PathBuf,
    name: String,
    length: u64,
    file: Mutex<File>,
}

impl LocalFileMedia {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            let kind = if e.kind() == io::ErrorKind::NotFound {
                ErrorKind::SourceNotFound
            } else {
                ErrorKind::IoFailure
            };
            RarError::io(kind, e)
        })?;
        let length = file.metadata()?.len();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            path: path.to_path_buf(),
            name,
            length,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FileMedia for LocalFileMedia {
    fn length(&self) -> u64 {
        self.length
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        read_fully(&mut *file, buf)
    }
}

/// In-memory archive bytes.
#[derive(Clone)]
pub struct MemoryMedia {
    name: String,
    data: Arc<[u8]>,
}

impl MemoryMedia {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

impl FileMedia for MemoryMedia {
    fn length(&self) -> u64 {
        self.data.len() as u64
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Ok(start) = usize::try_from(offset) else {
            return Ok(0);
        };
        if start >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Adapter for any seekable reader, guarded by a mutex.
pub struct ReaderMedia<R> {
    name: String,
    length: u64,
    inner: Mutex<R>,
}

impl<R: Read + Seek + Send> ReaderMedia<R> {
    pub fn new(name: impl Into<String>, mut inner: R) -> Result<Self> {
        let length = inner.seek(SeekFrom::End(0))?;
        Ok(Self {
            name: name.into(),
            length,
            inner: Mutex::new(inner),
        })
    }
}

impl<R: Read + Seek + Send> FileMedia for ReaderMedia<R> {
    fn length(&self) -> u64 {
        self.length
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.seek(SeekFrom::Start(offset))?;
        read_fully(&mut *inner, buf)
    }
}

fn read_fully(src: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match src.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Buffered cursor over `[start, end)` of a [`FileMedia`].
pub struct MediaReader {
    media: Arc<dyn FileMedia>,
    start: u64,
    end: u64,
    pos: u64,
    buf: Vec<u8>,
    buf_start: u64,
}

impl MediaReader {
    /// Cursor over the whole media.
    pub fn new(media: Arc<dyn FileMedia>) -> Self {
        let end = media.length();
        Self::bounded(media, 0, end)
    }

    /// Cursor over `[start, end)`, clamped to the media length.
    pub fn bounded(media: Arc<dyn FileMedia>, start: u64, end: u64) -> Self {
        let end = end.min(media.length());
        let start = start.min(end);
        Self {
            media,
            start,
            end,
            pos: start,
            buf: Vec::new(),
            buf_start: start,
        }
    }

    /// Absolute position of the next byte.
    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Bytes left before the bound.
    pub fn remaining(&self) -> u64 {
        self.end - self.pos
    }

    /// Move to an absolute offset inside the bound.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        if offset < self.start || offset > self.end {
            return Err(RarError::truncated("seek beyond end of archive data"));
        }
        self.pos = offset;
        Ok(())
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        let target = self
            .pos
            .checked_add(n)
            .ok_or_else(|| RarError::truncated("seek beyond end of archive data"))?;
        self.seek(target)
    }

    /// Read exactly `n` bytes or fail with end-of-stream.
    pub fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; n];
        self.read_into(&mut out)?;
        Ok(out)
    }

    pub fn read_into(&mut self, out: &mut [u8]) -> Result<()> {
        if (out.len() as u64) > self.remaining() {
            return Err(RarError::truncated("unexpected end of archive data"));
        }
        let mut filled = 0;
        while filled < out.len() {
            let n = self.read_buffered(&mut out[filled..])?;
            if n == 0 {
                return Err(RarError::truncated("unexpected end of archive data"));
            }
            filled += n;
        }
        Ok(())
    }

    fn read_buffered(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.end || out.is_empty() {
            return Ok(0);
        }
        let buf_end = self.buf_start + self.buf.len() as u64;
        if self.pos < self.buf_start || self.pos >= buf_end {
            self.fill()?;
        }
        let offset = (self.pos - self.buf_start) as usize;
        let available = &self.buf[offset..];
        let n = out.len().min(available.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn fill(&mut self) -> io::Result<()> {
        let want = (self.end - self.pos).min(CHUNK_SIZE as u64) as usize;
        self.buf.resize(want, 0);
        let got = self.media.read_at(self.pos, &mut self.buf)?;
        self.buf.truncate(got);
        self.buf_start = self.pos;
        if got == 0 {
            return Err(io::Error::from(RarError::truncated(
                "archive source shorter than its reported length",
            )));
        }
        Ok(())
    }
}

impl Read for MediaReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        self.read_buffered(out)
    }
}
