//! RAR format detection, signatures and timestamp encodings.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// RAR file signature generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    /// RAR 1.5 to 4.x
    Rar15,
    /// RAR 5.0+
    Rar50,
}

/// Result of searching for a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMatch {
    /// A readable signature at `offset`.
    Found { signature: Signature, offset: u64 },
    /// A RAR signature of a generation this crate cannot read.
    Unsupported { offset: u64 },
    /// Too few bytes to decide.
    Incomplete,
    /// No signature.
    Missing,
}

/// Self-extracting stubs are searched this far for the archive signature.
pub const MAX_SFX_SIZE: usize = 0x200000;

impl Signature {
    pub const RAR15: &[u8; 7] = b"Rar!\x1a\x07\x00";
    pub const RAR50: &[u8; 8] = b"Rar!\x1a\x07\x01\x00";
    /// Common prefix of every RAR 1.5+ signature.
    const PREFIX: &[u8; 6] = b"Rar!\x1a\x07";
    /// RAR 1.4 marker.
    const RAR14: &[u8; 4] = b"RE~^";

    pub fn size(&self) -> u64 {
        match self {
            Self::Rar15 => 7,
            Self::Rar50 => 8,
        }
    }

    /// Classify the signature at the very start of `data`.
    pub fn from_bytes(data: &[u8]) -> SignatureMatch {
        if data.starts_with(Self::RAR14) {
            return SignatureMatch::Unsupported { offset: 0 };
        }
        Self::classify_at(data, 0)
    }

    /// Search `data` for a signature, allowing an executable stub in front.
    pub fn find(data: &[u8]) -> SignatureMatch {
        match Self::from_bytes(data) {
            SignatureMatch::Missing => {}
            other => return other,
        }
        let window = &data[..data.len().min(MAX_SFX_SIZE)];
        let mut from = 1;
        while let Some(rel) = window
            .get(from..)
            .and_then(|w| w.windows(Self::PREFIX.len()).position(|c| c == Self::PREFIX))
        {
            let at = from + rel;
            match Self::classify_at(data, at) {
                SignatureMatch::Missing => from = at + 1,
                found => return found,
            }
        }
        SignatureMatch::Missing
    }

    fn classify_at(data: &[u8], at: usize) -> SignatureMatch {
        let tail = &data[at..];
        if tail.len() < Self::PREFIX.len() {
            return if Self::PREFIX.starts_with(tail) {
                SignatureMatch::Incomplete
            } else {
                SignatureMatch::Missing
            };
        }
        if !tail.starts_with(Self::PREFIX) {
            return SignatureMatch::Missing;
        }
        let offset = at as u64;
        match tail.get(6) {
            None => SignatureMatch::Incomplete,
            Some(0x00) => SignatureMatch::Found {
                signature: Self::Rar15,
                offset,
            },
            Some(0x01) => match tail.get(7) {
                None => SignatureMatch::Incomplete,
                Some(0x00) => SignatureMatch::Found {
                    signature: Self::Rar50,
                    offset,
                },
                Some(_) => SignatureMatch::Unsupported { offset },
            },
            Some(_) => SignatureMatch::Unsupported { offset },
        }
    }
}

/// Point in time as nanoseconds relative to the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct Timestamp {
    pub nanos: i64,
}

impl Timestamp {
    pub fn from_unix_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    pub fn from_unix_secs(secs: i64) -> Self {
        Self {
            nanos: secs.saturating_mul(1_000_000_000),
        }
    }

    /// MS-DOS packed date/time (local time, two-second resolution).
    pub fn from_dos(dos_time: u32) -> Self {
        let second = ((dos_time & 0x1f) * 2) as i64;
        let minute = ((dos_time >> 5) & 0x3f) as i64;
        let hour = ((dos_time >> 11) & 0x1f) as i64;
        let day = ((dos_time >> 16) & 0x1f).max(1) as i64;
        let month = ((dos_time >> 21) & 0x0f).clamp(1, 12) as i64;
        let year = ((dos_time >> 25) + 1980) as i64;

        let days = days_from_civil(year, month, day);
        Self::from_unix_secs(days * 86400 + hour * 3600 + minute * 60 + second)
    }

    /// Windows FILETIME: 100 ns ticks since 1601-01-01.
    pub fn from_windows_filetime(filetime: u64) -> Self {
        const EPOCH_DIFF_TICKS: i128 = 116_444_736_000_000_000;
        let unix_ticks = filetime as i128 - EPOCH_DIFF_TICKS;
        Self {
            nanos: (unix_ticks * 100).clamp(i64::MIN as i128, i64::MAX as i128) as i64,
        }
    }

    pub fn saturating_add(self, add_nanos: i64) -> Self {
        Self {
            nanos: self.nanos.saturating_add(add_nanos),
        }
    }

    pub fn to_system_time(self) -> SystemTime {
        if self.nanos >= 0 {
            UNIX_EPOCH + Duration::from_nanos(self.nanos as u64)
        } else {
            UNIX_EPOCH - Duration::from_nanos(self.nanos.unsigned_abs())
        }
    }
}

/// Days since 1970-01-01 for a proleptic Gregorian date.
fn days_from_civil(year: i64, month: i64, day: i64) -> i64 {
    let y = if month <= 2 { year - 1 } else { year };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = (month + 9) % 12;
    let doy = (153 * mp + 2) / 5 + day - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}
