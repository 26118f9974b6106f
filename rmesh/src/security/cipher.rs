use aes::Aes128;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ctr::cipher::{KeyIvInit, StreamCipher};

use super::key::{Key, KEY_LEN};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is not valid base64url")]
    Encoding,
    #[error("key must be {KEY_LEN} bytes, got {0}")]
    Length(usize),
}

/// Encrypts and decrypts channel keys with the license's encryption key.
///
/// Bytes `2..24` of a key are XORed with an AES-128 counter-mode keystream
/// whose initial counter block is derived from the unencrypted 2-byte salt,
/// so equal keys with different salts encode differently.
#[derive(Clone)]
pub struct Cipher {
    encryption_key: [u8; 16],
}

impl Cipher {
    pub fn new(encryption_key: &[u8; 16]) -> Self {
        Cipher { encryption_key: *encryption_key }
    }

    pub fn decrypt_key(&self, text: &str) -> Result<Key, KeyError> {
        let raw = URL_SAFE_NO_PAD.decode(text.as_bytes()).map_err(|_| KeyError::Encoding)?;
        let mut key = Key::from_slice(&raw).ok_or(KeyError::Length(raw.len()))?;
        let salt = [key.0[0], key.0[1]];
        self.apply_keystream(salt, &mut key.0[2..]);
        Ok(key)
    }

    pub fn encrypt_key(&self, key: &Key) -> String {
        let mut out = key.0;
        self.apply_keystream([out[0], out[1]], &mut out[2..]);
        URL_SAFE_NO_PAD.encode(out)
    }

    #[inline]
    fn apply_keystream(&self, salt: [u8; 2], data: &mut [u8]) {
        let mut ctr = Aes128Ctr::new(&self.encryption_key.into(), &initial_counter(salt).into());
        ctr.apply_keystream(data);
    }
}

/// The salt repeated over the nonce bytes, the block counter starts at 0.
#[inline]
fn initial_counter(salt: [u8; 2]) -> [u8; 16] {
    let mut block = [0u8; 16];
    for pair in block[..12].chunks_mut(2) {
        pair.copy_from_slice(&salt);
    }
    block
}
