//! Self-contained reader for RAR archives.
//!
//! Reads RAR 1.5-4.x (RAR4) and RAR 5.0+ (RAR5) archives, single or split
//! into volumes: header parsing with checksum validation, RAR 2.9 (LZ and
//! PPMd) and RAR5 decompression, AES decryption of password-protected
//! entries, and CRC32/BLAKE2sp integrity checks. Nothing here writes
//! archives.
//!
//! ```no_run
//! # fn main() -> rar_extract::Result<()> {
//! for entry in rar_extract::list_archive("photos.rar", None)? {
//!     let entry = entry?;
//!     println!("{} ({} bytes)", entry.path, entry.size);
//! }
//! let summary = rar_extract::extract_archive("photos.rar", "out", None, None)?;
//! for failure in &summary.failed {
//!     eprintln!("{}: {}", failure.path, rar_extract::describe_error(failure.kind));
//! }
//! # Ok(())
//! # }
//! ```
//!
//! For finer control open an [`Archive`] and read entries through
//! [`Archive::open_entry`], or drive [`extract`] with a custom
//! [`EntrySink`].
//!
//! ## Features
//! - `async` - tokio facade in [`async_api`]
//! - `parallel` - multi-threaded extraction in [`parallel`]

mod archive;
mod crc32;
pub mod crypto;
pub mod decompress;
pub mod error;
pub mod file_media;
pub mod formats;
pub mod parsing;
mod session;
pub mod verify;
pub mod volumes;

#[cfg(feature = "async")]
pub mod async_api;
#[cfg(feature = "parallel")]
pub mod parallel;

#[cfg(test)]
mod test_support;

pub use archive::{Archive, EntryReader};
pub use error::{describe_error, ErrorKind, RarError, Result};
pub use file_media::{FileMedia, LocalFileMedia, MemoryMedia, ReaderMedia};
pub use parsing::{ArchiveInfo, ArchiveVersion, Checksum, Entry, EntryFlags, HostOs, NameEncoding};
pub use session::{
    extract, extract_archive, extract_volumes, list, list_archive, resolve_path,
    CancellationToken, EntryFailure, EntryInfo, EntrySink, ExtractOptions, ExtractSummary, FsSink,
    ListIter, Overwrite, Progress, WriteOutcome,
};

pub use decompress::{CompressionMethod, DecompressError, LzState};
