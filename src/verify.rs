//! Integrity checks of unpacked entry data.
//!
//! RAR4 entries store a CRC32 of their contents. RAR5 entries store either
//! a CRC32 or a BLAKE2sp digest; encrypted RAR5 entries may store both in
//! MAC form, keyed with the hash key derived from the password.

use std::io::{self, Read};

use blake2s_simd::blake2sp;

use crate::crypto::{blake2_to_mac, crc32_to_mac};
use crate::error::{ErrorKind, RarError, Result};
use crate::parsing::Checksum;

enum Hasher {
    Crc32(crc32fast::Hasher),
    Blake2sp(Box<blake2sp::State>),
    Nothing,
}

/// Incremental checksum over an entry's unpacked bytes.
pub struct Verifier {
    hasher: Hasher,
    expected: Option<Checksum>,
    mac_key: Option<[u8; 32]>,
}

impl Verifier {
    pub fn new(expected: Option<Checksum>, mac_key: Option<[u8; 32]>) -> Self {
        let hasher = match expected {
            Some(Checksum::Crc32(_)) => Hasher::Crc32(crc32fast::Hasher::new()),
            Some(Checksum::Blake2sp(_)) => Hasher::Blake2sp(Box::new(blake2sp::State::new())),
            None => Hasher::Nothing,
        };
        Self {
            hasher,
            expected,
            mac_key,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.hasher {
            Hasher::Crc32(h) => h.update(data),
            Hasher::Blake2sp(h) => {
                h.update(data);
            }
            Hasher::Nothing => {}
        }
    }

    /// Compare against the stored value. Entries without a stored
    /// checksum always pass.
    pub fn finish(self) -> Result<()> {
        let matches = match (self.hasher, self.expected) {
            (Hasher::Crc32(h), Some(Checksum::Crc32(stored))) => {
                let mut crc = h.finalize();
                if let Some(key) = &self.mac_key {
                    crc = crc32_to_mac(key, crc);
                }
                crc == stored
            }
            (Hasher::Blake2sp(h), Some(Checksum::Blake2sp(stored))) => {
                let mut digest = [0u8; 32];
                digest.copy_from_slice(h.finalize().as_bytes());
                if let Some(key) = &self.mac_key {
                    digest = blake2_to_mac(key, &digest);
                }
                digest == stored
            }
            _ => true,
        };
        if matches {
            Ok(())
        } else {
            Err(RarError::from_kind(ErrorKind::ChecksumMismatch))
        }
    }
}

/// Reader that checks the data passing through it once the inner reader
/// reaches its end. A mismatch is returned by the final `read` instead of
/// end of file.
pub struct VerifyingReader<R> {
    inner: R,
    verifier: Option<Verifier>,
}

impl<R: Read> VerifyingReader<R> {
    pub fn new(inner: R, verifier: Verifier) -> Self {
        Self {
            inner,
            verifier: Some(verifier),
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for VerifyingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n > 0 {
            if let Some(verifier) = &mut self.verifier {
                verifier.update(&buf[..n]);
            }
        } else if !buf.is_empty() {
            if let Some(verifier) = self.verifier.take() {
                verifier.finish()?;
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(data: &[u8], checksum: Option<Checksum>, key: Option<[u8; 32]>) -> Result<Vec<u8>> {
        let mut reader = VerifyingReader::new(data, Verifier::new(checksum, key));
        let mut out = Vec::new();
        reader.read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_crc32_match_and_mismatch() {
        let crc = crate::crc32::crc32(b"123456789");
        assert_eq!(crc, 0xCBF43926);
        assert!(read_all(b"123456789", Some(Checksum::Crc32(crc)), None).is_ok());

        let err = read_all(b"123456780", Some(Checksum::Crc32(crc)), None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ChecksumMismatch);
    }

    #[test]
    fn test_blake2sp_incremental() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let mut digest = [0u8; 32];
        digest.copy_from_slice(blake2sp::blake2sp(&data).as_bytes());

        let mut verifier = Verifier::new(Some(Checksum::Blake2sp(digest)), None);
        for chunk in data.chunks(333) {
            verifier.update(chunk);
        }
        assert!(verifier.finish().is_ok());

        let mut bad = digest;
        bad[31] ^= 1;
        assert!(read_all(&data, Some(Checksum::Blake2sp(bad)), None).is_err());
    }

    #[test]
    fn test_mac_conversion() {
        let key = [7u8; 32];
        let crc = crate::crc32::crc32(b"secret");
        let stored = crc32_to_mac(&key, crc);
        assert!(read_all(b"secret", Some(Checksum::Crc32(stored)), Some(key)).is_ok());
        // The plain CRC no longer matches once a hash key is in play
        assert!(read_all(b"secret", Some(Checksum::Crc32(crc)), Some(key)).is_err());
    }

    #[test]
    fn test_missing_checksum_passes() {
        assert_eq!(read_all(b"anything", None, None).unwrap(), b"anything");
    }
}
