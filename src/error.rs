//! Error types for archive parsing, decryption, decompression and extraction.
//!
//! Every failure carries an [`ErrorKind`] so callers can branch on the
//! category without inspecting message text, plus the offending entry path
//! when the failure belongs to a single entry.
//!
//! ## Error Categories
//!
//! | Category | Kinds | Raised by |
//! |----------|-------|-----------|
//! | Open | [`NotAnArchive`], [`Truncated`], [`UnsupportedVersion`] | [`Archive::open`] |
//! | Headers | [`CorruptHeader`] | header scan |
//! | Encryption | [`PasswordRequired`], [`BadPassword`] | key setup, verification |
//! | Data | [`UnsupportedMethod`], [`DecompressionFault`], [`ChecksumMismatch`] | entry readers |
//! | Extraction | [`VolumeContinuationRequired`], [`PathEscapesDestination`], [`OutputFailure`], [`Cancelled`] | session |
//! | I/O | [`IoFailure`], [`SourceNotFound`] | media access |
//!
//! [`NotAnArchive`]: ErrorKind::NotAnArchive
//! [`Truncated`]: ErrorKind::Truncated
//! [`UnsupportedVersion`]: ErrorKind::UnsupportedVersion
//! [`CorruptHeader`]: ErrorKind::CorruptHeader
//! [`PasswordRequired`]: ErrorKind::PasswordRequired
//! [`BadPassword`]: ErrorKind::BadPassword
//! [`UnsupportedMethod`]: ErrorKind::UnsupportedMethod
//! [`DecompressionFault`]: ErrorKind::DecompressionFault
//! [`ChecksumMismatch`]: ErrorKind::ChecksumMismatch
//! [`VolumeContinuationRequired`]: ErrorKind::VolumeContinuationRequired
//! [`PathEscapesDestination`]: ErrorKind::PathEscapesDestination
//! [`OutputFailure`]: ErrorKind::OutputFailure
//! [`Cancelled`]: ErrorKind::Cancelled
//! [`IoFailure`]: ErrorKind::IoFailure
//! [`SourceNotFound`]: ErrorKind::SourceNotFound
//! [`Archive::open`]: crate::Archive::open

use std::borrow::Cow;
use std::io;

use thiserror::Error;

/// Category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No RAR signature was found.
    NotAnArchive,
    /// The data ends before a structure is complete.
    Truncated,
    /// The signature belongs to a RAR generation this crate cannot read.
    UnsupportedVersion,
    /// A header failed its checksum or is structurally invalid.
    CorruptHeader,
    /// Produced bytes do not match the stored checksum.
    ChecksumMismatch,
    /// Encrypted data or headers and no password supplied.
    PasswordRequired,
    /// A password was supplied but it does not decrypt the data.
    BadPassword,
    /// Compression method, algorithm version or entry type is not supported.
    UnsupportedMethod,
    /// The compressed stream is structurally invalid.
    DecompressionFault,
    /// The entry continues in another volume that was not supplied.
    VolumeContinuationRequired,
    /// The entry path would resolve outside the destination root.
    PathEscapesDestination,
    /// An underlying filesystem or device error.
    IoFailure,
    /// The archive file does not exist.
    SourceNotFound,
    /// The destination could not be written.
    OutputFailure,
    /// The operation was cancelled through a cancellation token.
    Cancelled,
    /// A failure that fits no other category.
    Unknown,
}

impl ErrorKind {
    /// All kinds, in stable code order.
    pub const ALL: [ErrorKind; 16] = [
        ErrorKind::NotAnArchive,
        ErrorKind::Truncated,
        ErrorKind::UnsupportedVersion,
        ErrorKind::CorruptHeader,
        ErrorKind::ChecksumMismatch,
        ErrorKind::PasswordRequired,
        ErrorKind::BadPassword,
        ErrorKind::UnsupportedMethod,
        ErrorKind::DecompressionFault,
        ErrorKind::VolumeContinuationRequired,
        ErrorKind::PathEscapesDestination,
        ErrorKind::IoFailure,
        ErrorKind::SourceNotFound,
        ErrorKind::OutputFailure,
        ErrorKind::Cancelled,
        ErrorKind::Unknown,
    ];

    /// Stable numeric code for callers that marshal errors across an FFI
    /// boundary. Codes start at 1; 0 is reserved for success.
    pub fn code(self) -> i32 {
        Self::ALL
            .iter()
            .position(|&k| k == self)
            .map_or(0, |i| i as i32 + 1)
    }

    /// Inverse of [`code`](Self::code). Unrecognized codes map to
    /// [`ErrorKind::Unknown`].
    pub fn from_code(code: i32) -> Self {
        usize::try_from(code)
            .ok()
            .and_then(|c| c.checked_sub(1))
            .and_then(|i| Self::ALL.get(i).copied())
            .unwrap_or(ErrorKind::Unknown)
    }
}

/// Human-readable description of an error kind.
///
/// The mapping is static and total: every kind has a message.
pub const fn describe_error(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::NotAnArchive => "Unknown archive format (not a valid RAR file)",
        ErrorKind::Truncated => "Archive is truncated",
        ErrorKind::UnsupportedVersion => "Unsupported RAR format version",
        ErrorKind::CorruptHeader => "Corrupt or invalid RAR archive",
        ErrorKind::ChecksumMismatch => "Data error in archive (CRC check failed)",
        ErrorKind::PasswordRequired => "Password required",
        ErrorKind::BadPassword => "Incorrect password",
        ErrorKind::UnsupportedMethod => "Unsupported compression method",
        ErrorKind::DecompressionFault => "Compressed data is corrupt",
        ErrorKind::VolumeContinuationRequired => "Entry continues in the next volume",
        ErrorKind::PathEscapesDestination => "Entry path escapes the destination directory",
        ErrorKind::IoFailure => "I/O error",
        ErrorKind::SourceNotFound => "RAR file not found",
        ErrorKind::OutputFailure => "Failed to create output file",
        ErrorKind::Cancelled => "Operation cancelled",
        ErrorKind::Unknown => "Unknown error",
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(describe_error(*self))
    }
}

/// Error type for all archive operations.
#[derive(Debug, Error)]
#[error("{message}{}", entry_suffix(.entry))]
pub struct RarError {
    kind: ErrorKind,
    message: Cow<'static, str>,
    entry: Option<String>,
    #[source]
    source: Option<io::Error>,
}

fn entry_suffix(entry: &Option<String>) -> String {
    entry
        .as_ref()
        .map(|e| format!(" (entry: {e})"))
        .unwrap_or_default()
}

impl RarError {
    pub fn new(kind: ErrorKind, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            entry: None,
            source: None,
        }
    }

    /// Error of `kind` with its standard description as message.
    pub fn from_kind(kind: ErrorKind) -> Self {
        Self::new(kind, describe_error(kind))
    }

    /// Wrap an I/O error under a specific kind.
    pub fn io(kind: ErrorKind, err: io::Error) -> Self {
        Self {
            kind,
            message: Cow::Owned(err.to_string()),
            entry: None,
            source: Some(err),
        }
    }

    /// Attach the entry path this error belongs to. An existing path is kept.
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        if self.entry.is_none() {
            self.entry = Some(entry.into());
        }
        self
    }

    /// Re-categorize the error, keeping message and context.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn entry(&self) -> Option<&str> {
        self.entry.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub(crate) fn truncated(what: &'static str) -> Self {
        Self::new(ErrorKind::Truncated, what)
    }

    pub(crate) fn corrupt(what: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorKind::CorruptHeader, what)
    }
}

/// Errors that travel through `std::io::Read` are unwrapped back into the
/// original [`RarError`]; anything else becomes [`ErrorKind::IoFailure`].
impl From<io::Error> for RarError {
    fn from(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<RarError>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(rar) = inner.downcast::<RarError>() {
                    return *rar;
                }
            }
            return Self::from_kind(ErrorKind::Unknown);
        }
        Self::io(ErrorKind::IoFailure, err)
    }
}

impl From<RarError> for io::Error {
    fn from(err: RarError) -> Self {
        io::Error::other(err)
    }
}

pub type Result<T> = std::result::Result<T, RarError>;
