//! RAR5 encryption.
//!
//! RAR5 uses:
//! - AES-256-CBC for encryption
//! - PBKDF2-HMAC-SHA256 for key derivation
//! - 16-byte salt
//! - Configurable iteration count (2^lg2_count)
//! - 8-byte password check value for fast verification
//!
//! One PBKDF2 chain yields three values: the AES key after `count`
//! iterations, the checksum MAC key after `count + 16` and the password
//! check after `count + 32`.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use super::CryptoError;
use crate::parsing::rar5::VintReader;

type HmacSha256 = Hmac<Sha256>;

pub const SIZE_SALT50: usize = 16;
pub const SIZE_INITV: usize = 16;
pub const SIZE_PSWCHECK: usize = 8;
pub const SIZE_PSWCHECK_CSUM: usize = 4;

/// Maximum accepted PBKDF2 iteration count (log2).
pub const CRYPT5_KDF_LG2_COUNT_MAX: u32 = 24;

const FLAG_PSWCHECK: u64 = 0x01;
const FLAG_HASHMAC: u64 = 0x02;

/// Encryption parameters from a file crypt record or the archive
/// encryption header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rar5EncryptionInfo {
    pub version: u64,
    pub lg2_count: u8,
    pub salt: [u8; SIZE_SALT50],
    /// Zero for the archive encryption header, which carries IVs per header.
    pub iv: [u8; SIZE_INITV],
    /// Present only when the stored check value passed its own checksum.
    pub psw_check: Option<[u8; SIZE_PSWCHECK]>,
    pub use_mac: bool,
}

impl Rar5EncryptionInfo {
    /// Parse a file header crypt extra record.
    pub fn parse_file_record(data: &[u8]) -> Result<Self, CryptoError> {
        Self::parse(data, true)
    }

    /// Parse the body of an archive encryption header.
    pub fn parse_archive_header(data: &[u8]) -> Result<Self, CryptoError> {
        Self::parse(data, false)
    }

    fn parse(data: &[u8], has_iv: bool) -> Result<Self, CryptoError> {
        let mut reader = VintReader::new(data);
        let version = reader.read().ok_or(CryptoError::InvalidRecord)?;
        if version != 0 {
            if !has_iv {
                return Err(CryptoError::UnsupportedVersion(version));
            }
            // Unknown layout; the entry is listed and fails when opened.
            return Ok(Self {
                version,
                lg2_count: 0,
                salt: [0u8; SIZE_SALT50],
                iv: [0u8; SIZE_INITV],
                psw_check: None,
                use_mac: false,
            });
        }
        let flags = reader.read().ok_or(CryptoError::InvalidRecord)?;
        let lg2_count = reader.read_u8().ok_or(CryptoError::InvalidRecord)?;
        let salt = reader.read_array().ok_or(CryptoError::InvalidRecord)?;
        let iv = if has_iv {
            reader.read_array().ok_or(CryptoError::InvalidRecord)?
        } else {
            [0u8; SIZE_INITV]
        };

        let mut psw_check = None;
        if flags & FLAG_PSWCHECK != 0 {
            let check: [u8; SIZE_PSWCHECK] =
                reader.read_array().ok_or(CryptoError::InvalidRecord)?;
            let sum: [u8; SIZE_PSWCHECK_CSUM] =
                reader.read_array().ok_or(CryptoError::InvalidRecord)?;
            // A damaged check value is ignored rather than trusted.
            if Sha256::digest(check)[..SIZE_PSWCHECK_CSUM] == sum {
                psw_check = Some(check);
            }
        }

        Ok(Self {
            version,
            lg2_count,
            salt,
            iv,
            psw_check,
            use_mac: flags & FLAG_HASHMAC != 0,
        })
    }
}

/// Values derived from one password and salt.
#[derive(Clone)]
pub struct Rar5Key {
    pub key: [u8; 32],
    pub hash_key: [u8; 32],
    psw_check_value: [u8; 32],
}

impl Rar5Key {
    pub fn derive(password: &str, salt: &[u8; SIZE_SALT50], lg2_count: u8) -> Self {
        let count = 1u32 << lg2_count;
        let prf = HmacSha256::new_from_slice(password.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));

        let mut mac = prf.clone();
        mac.update(salt);
        mac.update(&1u32.to_be_bytes());
        let mut u: [u8; 32] = mac.finalize().into_bytes().into();
        let mut acc = u;

        let mut outputs = [[0u8; 32]; 3];
        let rounds = [count - 1, 16, 16];
        for (out, &n) in outputs.iter_mut().zip(rounds.iter()) {
            for _ in 0..n {
                let mut mac = prf.clone();
                mac.update(&u);
                u = mac.finalize().into_bytes().into();
                for (a, b) in acc.iter_mut().zip(u.iter()) {
                    *a ^= b;
                }
            }
            *out = acc;
        }

        Self {
            key: outputs[0],
            hash_key: outputs[1],
            psw_check_value: outputs[2],
        }
    }

    /// Check value folded to the 8 bytes stored in headers.
    pub fn check_value(&self) -> [u8; SIZE_PSWCHECK] {
        let mut check = [0u8; SIZE_PSWCHECK];
        for (i, &byte) in self.psw_check_value.iter().enumerate() {
            check[i % SIZE_PSWCHECK] ^= byte;
        }
        check
    }

    pub fn verify_password(&self, expected: &[u8; SIZE_PSWCHECK]) -> bool {
        self.check_value() == *expected
    }
}

/// Convert a CRC32 into the MAC form stored for encrypted entries.
pub fn crc32_to_mac(hash_key: &[u8; 32], crc: u32) -> u32 {
    let digest = hmac_sha256(hash_key, &crc.to_le_bytes());
    digest
        .iter()
        .enumerate()
        .fold(0u32, |acc, (i, &b)| acc ^ (u32::from(b) << ((i & 3) * 8)))
}

/// Convert a BLAKE2sp digest into the MAC form stored for encrypted entries.
pub fn blake2_to_mac(hash_key: &[u8; 32], digest: &[u8; 32]) -> [u8; 32] {
    hmac_sha256(hash_key, digest)
}

fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pbkdf2::pbkdf2_hmac;

    #[test]
    fn single_chain_matches_three_pbkdf2_runs() {
        let salt = [0x5au8; SIZE_SALT50];
        let key = Rar5Key::derive("password", &salt, 6);
        let mut expected = [0u8; 32];
        pbkdf2_hmac::<Sha256>(b"password", &salt, 64, &mut expected);
        assert_eq!(key.key, expected);
        pbkdf2_hmac::<Sha256>(b"password", &salt, 64 + 16, &mut expected);
        assert_eq!(key.hash_key, expected);
        pbkdf2_hmac::<Sha256>(b"password", &salt, 64 + 32, &mut expected);
        assert_eq!(key.psw_check_value, expected);
    }

    fn record(flags: u8, check: Option<[u8; 8]>, sum_ok: bool) -> Vec<u8> {
        let mut data = vec![0u8, flags, 15];
        data.extend_from_slice(&[1u8; 16]);
        data.extend_from_slice(&[2u8; 16]);
        if let Some(check) = check {
            data.extend_from_slice(&check);
            let mut sum: [u8; 4] = Sha256::digest(check)[..4].try_into().unwrap();
            if !sum_ok {
                sum[0] ^= 0xff;
            }
            data.extend_from_slice(&sum);
        }
        data
    }

    #[test]
    fn parse_record_without_check() {
        let info = Rar5EncryptionInfo::parse_file_record(&record(0, None, true)).unwrap();
        assert_eq!(info.lg2_count, 15);
        assert_eq!(info.salt, [1u8; 16]);
        assert_eq!(info.iv, [2u8; 16]);
        assert!(info.psw_check.is_none());
        assert!(!info.use_mac);
    }

    #[test]
    fn parse_record_with_check_and_mac() {
        let check = [9u8, 8, 7, 6, 5, 4, 3, 2];
        let info =
            Rar5EncryptionInfo::parse_file_record(&record(0x03, Some(check), true)).unwrap();
        assert_eq!(info.psw_check, Some(check));
        assert!(info.use_mac);
    }

    #[test]
    fn damaged_check_value_is_ignored() {
        let info =
            Rar5EncryptionInfo::parse_file_record(&record(0x01, Some([1; 8]), false)).unwrap();
        assert!(info.psw_check.is_none());
    }

    #[test]
    fn unknown_version_rejected() {
        let mut data = record(0, None, true);
        data[0] = 1;
        assert_eq!(
            Rar5EncryptionInfo::parse_archive_header(&data),
            Err(CryptoError::UnsupportedVersion(1))
        );
        let info = Rar5EncryptionInfo::parse_file_record(&data).unwrap();
        assert_eq!(info.version, 1);
    }

    #[test]
    fn mac_conversion_depends_on_key() {
        let a = crc32_to_mac(&[1u8; 32], 0xdeadbeef);
        let b = crc32_to_mac(&[2u8; 32], 0xdeadbeef);
        assert_ne!(a, b);
        assert_ne!(blake2_to_mac(&[1u8; 32], &[0u8; 32]), [0u8; 32]);
    }
}
