//! Cryptographic support for encrypted RAR archives.
//!
//! RAR5 uses AES-256-CBC with PBKDF2-HMAC-SHA256 key derivation.
//! RAR 2.9 to 4.x use AES-128-CBC with an iterated SHA-1 KDF.
//!
//! Key derivation is deliberately slow, so derived keys are cached per
//! archive in a [`KeyCache`] keyed by the salt and cost parameters.

mod rar4;
mod rar5;

use std::collections::HashMap;
use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use aes::{Aes128, Aes256};
use thiserror::Error;

use crate::error::{ErrorKind, RarError};

pub use rar4::Rar4Key;
pub use rar5::{
    blake2_to_mac, crc32_to_mac, Rar5EncryptionInfo, Rar5Key, CRYPT5_KDF_LG2_COUNT_MAX,
};

type Aes128CbcDec = cbc::Decryptor<Aes128>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// AES block size shared by both generations.
pub const CRYPT_BLOCK_SIZE: usize = 16;

/// Error type for cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("password required")]
    PasswordRequired,
    #[error("incorrect password")]
    WrongPassword,
    #[error("unsupported encryption version {0}")]
    UnsupportedVersion(u64),
    #[error("key derivation count 2^{0} exceeds the supported maximum")]
    KdfCountTooLarge(u8),
    #[error("legacy RAR encryption (unpack version {0}) is not supported")]
    LegacyCipher(u8),
    #[error("invalid encryption record")]
    InvalidRecord,
    #[error("encrypted data is not a multiple of the cipher block size")]
    Misaligned,
}

impl From<CryptoError> for RarError {
    fn from(err: CryptoError) -> Self {
        let kind = match err {
            CryptoError::PasswordRequired => ErrorKind::PasswordRequired,
            CryptoError::WrongPassword => ErrorKind::BadPassword,
            CryptoError::UnsupportedVersion(_)
            | CryptoError::KdfCountTooLarge(_)
            | CryptoError::LegacyCipher(_) => ErrorKind::UnsupportedMethod,
            CryptoError::InvalidRecord | CryptoError::Misaligned => ErrorKind::CorruptHeader,
        };
        RarError::new(kind, err.to_string())
    }
}

/// Per-entry encryption parameters as stored in the headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncryptionParams {
    /// RAR 2.9+ AES-128; the salt is optional in very old archives.
    Rar4 { salt: Option<[u8; 8]> },
    /// RAR5 AES-256.
    Rar5(Rar5EncryptionInfo),
    /// RAR 1.5/2.0 proprietary ciphers.
    Legacy { version: u8 },
}

/// AES key of either width.
#[derive(Clone)]
pub enum CipherKey {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

impl CipherKey {
    pub fn decryptor(&self, iv: &[u8; 16]) -> BlockDecryptor {
        match self {
            CipherKey::Aes128(key) => BlockDecryptor::Aes128(Aes128CbcDec::new(key.into(), iv.into())),
            CipherKey::Aes256(key) => BlockDecryptor::Aes256(Aes256CbcDec::new(key.into(), iv.into())),
        }
    }

    /// One-shot CBC decryption of a whole buffer.
    pub fn decrypt(&self, iv: &[u8; 16], data: &mut [u8]) -> Result<(), CryptoError> {
        self.decryptor(iv).decrypt_blocks(data)
    }
}

/// CBC decryptor state carried across successive block runs.
pub enum BlockDecryptor {
    Aes128(Aes128CbcDec),
    Aes256(Aes256CbcDec),
}

impl BlockDecryptor {
    /// Decrypt `data` in place; its length must be a whole number of blocks.
    pub fn decrypt_blocks(&mut self, data: &mut [u8]) -> Result<(), CryptoError> {
        if data.len() % CRYPT_BLOCK_SIZE != 0 {
            return Err(CryptoError::Misaligned);
        }
        for chunk in data.chunks_exact_mut(CRYPT_BLOCK_SIZE) {
            let block = GenericArray::from_mut_slice(chunk);
            match self {
                BlockDecryptor::Aes128(d) => d.decrypt_block_mut(block),
                BlockDecryptor::Aes256(d) => d.decrypt_block_mut(block),
            }
        }
        Ok(())
    }
}

/// Key material ready to decrypt one entry's data.
#[derive(Clone)]
pub struct EntryKey {
    pub cipher: CipherKey,
    pub iv: [u8; 16],
    /// Present when stored checksums are HMAC-converted (RAR5 only).
    pub hash_key: Option<[u8; 32]>,
}

/// Derived keys for one password, shared by every reader of an archive.
pub struct KeyCache {
    password: Option<String>,
    rar4: Mutex<HashMap<Option<[u8; 8]>, Arc<Rar4Key>>>,
    rar5: Mutex<HashMap<([u8; 16], u8), Arc<Rar5Key>>>,
}

impl std::fmt::Debug for KeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyCache")
            .field("has_password", &self.password.is_some())
            .finish()
    }
}

impl KeyCache {
    /// An empty password is treated as no password.
    pub fn new(password: Option<&str>) -> Self {
        Self {
            password: password.filter(|p| !p.is_empty()).map(str::to_owned),
            rar4: Mutex::new(HashMap::new()),
            rar5: Mutex::new(HashMap::new()),
        }
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    fn password(&self) -> Result<&str, CryptoError> {
        self.password.as_deref().ok_or(CryptoError::PasswordRequired)
    }

    pub fn rar4(&self, salt: Option<[u8; 8]>) -> Result<Arc<Rar4Key>, CryptoError> {
        let password = self.password()?;
        let mut cache = self.rar4.lock().unwrap_or_else(PoisonError::into_inner);
        let key = cache
            .entry(salt)
            .or_insert_with(|| Arc::new(Rar4Key::derive(password, salt.as_ref())));
        Ok(Arc::clone(key))
    }

    pub fn rar5(&self, salt: &[u8; 16], lg2_count: u8) -> Result<Arc<Rar5Key>, CryptoError> {
        let password = self.password()?;
        if u32::from(lg2_count) > CRYPT5_KDF_LG2_COUNT_MAX {
            return Err(CryptoError::KdfCountTooLarge(lg2_count));
        }
        let mut cache = self.rar5.lock().unwrap_or_else(PoisonError::into_inner);
        let key = cache
            .entry((*salt, lg2_count))
            .or_insert_with(|| Arc::new(Rar5Key::derive(password, salt, lg2_count)));
        Ok(Arc::clone(key))
    }

    /// Resolve the key for an entry, verifying the password check value
    /// when the archive stores one.
    pub fn entry_key(&self, params: &EncryptionParams) -> Result<EntryKey, CryptoError> {
        match params {
            EncryptionParams::Rar4 { salt } => {
                let key = self.rar4(*salt)?;
                Ok(EntryKey {
                    cipher: CipherKey::Aes128(key.key),
                    iv: key.iv,
                    hash_key: None,
                })
            }
            EncryptionParams::Rar5(info) => {
                if info.version != 0 {
                    return Err(CryptoError::UnsupportedVersion(info.version));
                }
                let key = self.rar5(&info.salt, info.lg2_count)?;
                if let Some(check) = &info.psw_check {
                    if !key.verify_password(check) {
                        return Err(CryptoError::WrongPassword);
                    }
                }
                Ok(EntryKey {
                    cipher: CipherKey::Aes256(key.key),
                    iv: info.iv,
                    hash_key: info.use_mac.then_some(key.hash_key),
                })
            }
            EncryptionParams::Legacy { version } => Err(CryptoError::LegacyCipher(*version)),
        }
    }
}

/// Round up to the cipher block size.
pub fn align_to_block(n: u64) -> u64 {
    n.div_ceil(CRYPT_BLOCK_SIZE as u64) * CRYPT_BLOCK_SIZE as u64
}

/// Streaming CBC decryption over a ciphertext reader.
///
/// A trailing partial block is dropped.
pub struct DecryptingReader<R> {
    inner: R,
    decryptor: BlockDecryptor,
    buf: Vec<u8>,
    pos: usize,
    eof: bool,
}

impl<R: Read> DecryptingReader<R> {
    const BUF_SIZE: usize = 64 * 1024;

    pub fn new(inner: R, key: &EntryKey) -> Self {
        Self {
            inner,
            decryptor: key.cipher.decryptor(&key.iv),
            buf: Vec::with_capacity(Self::BUF_SIZE),
            pos: 0,
            eof: false,
        }
    }

    fn fill(&mut self) -> io::Result<()> {
        self.buf.resize(Self::BUF_SIZE, 0);
        let mut filled = 0;
        while filled < Self::BUF_SIZE {
            match self.inner.read(&mut self.buf[filled..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        let whole = filled - filled % CRYPT_BLOCK_SIZE;
        self.buf.truncate(whole);
        self.pos = 0;
        self.decryptor
            .decrypt_blocks(&mut self.buf)
            .map_err(|e| io::Error::from(RarError::from(e)))
    }
}

impl<R: Read> Read for DecryptingReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.buf.len() {
            if self.eof {
                return Ok(0);
            }
            self.fill()?;
            if self.buf.is_empty() {
                return Ok(0);
            }
        }
        let n = out.len().min(self.buf.len() - self.pos);
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
pub(crate) fn encrypt_cbc(key: &CipherKey, iv: &[u8; 16], data: &mut [u8]) {
    use aes::cipher::BlockEncryptMut;
    match key {
        CipherKey::Aes128(k) => {
            let mut enc = cbc::Encryptor::<Aes128>::new(k.into(), iv.into());
            for chunk in data.chunks_exact_mut(CRYPT_BLOCK_SIZE) {
                enc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
            }
        }
        CipherKey::Aes256(k) => {
            let mut enc = cbc::Encryptor::<Aes256>::new(k.into(), iv.into());
            for chunk in data.chunks_exact_mut(CRYPT_BLOCK_SIZE) {
                enc.encrypt_block_mut(GenericArray::from_mut_slice(chunk));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_one_shot() {
        let key = CipherKey::Aes256([7u8; 32]);
        let iv = [3u8; 16];
        let plain: Vec<u8> = (0..200_000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut padded = plain.clone();
        padded.resize(align_to_block(plain.len() as u64) as usize, 0);
        let mut cipher = padded.clone();
        encrypt_cbc(&key, &iv, &mut cipher);

        let entry_key = EntryKey {
            cipher: key,
            iv,
            hash_key: None,
        };
        let mut reader = DecryptingReader::new(io::Cursor::new(cipher), &entry_key);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, padded);
    }

    #[test]
    fn empty_password_is_no_password() {
        let cache = KeyCache::new(Some(""));
        assert!(!cache.has_password());
        let err = cache
            .entry_key(&EncryptionParams::Rar4 { salt: None })
            .err()
            .unwrap();
        assert_eq!(err, CryptoError::PasswordRequired);
        assert_eq!(RarError::from(err).kind(), ErrorKind::PasswordRequired);
    }

    #[test]
    fn misaligned_ciphertext_rejected() {
        let key = CipherKey::Aes128([1u8; 16]);
        let mut data = [0u8; 17];
        assert_eq!(key.decrypt(&[0u8; 16], &mut data), Err(CryptoError::Misaligned));
    }

    #[test]
    fn legacy_cipher_is_unsupported() {
        let cache = KeyCache::new(Some("pw"));
        let err = cache
            .entry_key(&EncryptionParams::Legacy { version: 20 })
            .err()
            .unwrap();
        assert_eq!(RarError::from(err).kind(), ErrorKind::UnsupportedMethod);
    }

    #[test]
    fn rar5_check_value_detects_wrong_password() {
        let salt = [9u8; 16];
        let right = Rar5Key::derive("right", &salt, 4);
        let info = Rar5EncryptionInfo {
            version: 0,
            lg2_count: 4,
            salt,
            iv: [0u8; 16],
            psw_check: Some(right.check_value()),
            use_mac: false,
        };
        assert!(KeyCache::new(Some("right"))
            .entry_key(&EncryptionParams::Rar5(info.clone()))
            .is_ok());
        let err = KeyCache::new(Some("wrong"))
            .entry_key(&EncryptionParams::Rar5(info))
            .err()
            .unwrap();
        assert_eq!(err, CryptoError::WrongPassword);
    }
}
