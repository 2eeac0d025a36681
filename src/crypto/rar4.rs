//! RAR 2.9 to 4.x key derivation.
//!
//! The password is encoded as UTF-16LE and concatenated with the optional
//! 8-byte salt. That buffer, followed by a 3-byte little-endian round counter,
//! is fed through one running SHA-1 context 2^18 times. Every 2^14 rounds the
//! last byte of an intermediate digest becomes the next IV byte. The final
//! digest, read as big-endian words with each word's bytes reversed, gives
//! the AES-128 key.
//!
//! Archivers of that era processed long inputs with a SHA-1 routine that
//! wrote its message schedule back into the input. Passwords of 28 or more
//! UTF-16 units hit that path and will not derive the same key here.

use sha1::{Digest, Sha1};

const ROUNDS: u32 = 0x40000;

/// Derived AES-128 key and IV.
#[derive(Clone, PartialEq, Eq)]
pub struct Rar4Key {
    pub key: [u8; 16],
    pub iv: [u8; 16],
}

impl Rar4Key {
    pub fn derive(password: &str, salt: Option<&[u8; 8]>) -> Self {
        let mut raw: Vec<u8> = password.encode_utf16().flat_map(u16::to_le_bytes).collect();
        if let Some(salt) = salt {
            raw.extend_from_slice(salt);
        }

        let mut hasher = Sha1::new();
        let mut iv = [0u8; 16];
        for i in 0..ROUNDS {
            hasher.update(&raw);
            hasher.update([i as u8, (i >> 8) as u8, (i >> 16) as u8]);
            if i % (ROUNDS / 16) == 0 {
                let digest = hasher.clone().finalize();
                iv[(i / (ROUNDS / 16)) as usize] = digest[19];
            }
        }
        let digest = hasher.finalize();

        let mut key = [0u8; 16];
        for word in 0..4 {
            for byte in 0..4 {
                key[word * 4 + byte] = digest[word * 4 + 3 - byte];
            }
        }

        Self { key, iv }
    }
}
