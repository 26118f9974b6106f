use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::Rng;

use super::cipher::Cipher;
use super::key::{Key, Permissions};
use crate::utils::Timestamp;
use crate::{Error, Result};

const LICENSE_LEN: usize = 30;

/// The broker license: the key encryption secret plus the single contract
/// it grants.
///
/// Text form is base64url (no padding) of the big-endian record
/// `encryption_key(16) contract(4) signature(4) master(2) expires(4)`.
#[derive(Clone, PartialEq, Eq)]
pub struct License {
    pub encryption_key: [u8; 16],
    pub contract: u32,
    pub signature: u32,
    pub master: u16,
    /// Unix seconds, 0 never expires.
    pub expires: u32,
}

impl License {
    /// A fresh random license with one master id and no expiry.
    pub fn generate() -> License {
        let mut rng = rand::rng();
        let mut encryption_key = [0u8; 16];
        rng.fill(&mut encryption_key);
        License {
            encryption_key,
            contract: rng.random_range(1..=u32::MAX),
            signature: rng.random(),
            master: 1,
            expires: 0,
        }
    }

    pub fn parse(text: &str) -> Result<License> {
        let raw = URL_SAFE_NO_PAD.decode(text.trim().as_bytes()).map_err(|e| anyhow!("invalid license, {}", e))?;
        if raw.len() != LICENSE_LEN {
            return Err(anyhow!("invalid license, expected {} bytes, got {}", LICENSE_LEN, raw.len()));
        }
        let u32_at = |at: usize| u32::from_be_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let mut encryption_key = [0u8; 16];
        encryption_key.copy_from_slice(&raw[..16]);
        Ok(License {
            encryption_key,
            contract: u32_at(16),
            signature: u32_at(20),
            master: u16::from_be_bytes([raw[24], raw[25]]),
            expires: u32_at(26),
        })
    }

    pub fn encode(&self) -> String {
        let mut raw = Vec::with_capacity(LICENSE_LEN);
        raw.extend_from_slice(&self.encryption_key);
        raw.extend_from_slice(&self.contract.to_be_bytes());
        raw.extend_from_slice(&self.signature.to_be_bytes());
        raw.extend_from_slice(&self.master.to_be_bytes());
        raw.extend_from_slice(&self.expires.to_be_bytes());
        URL_SAFE_NO_PAD.encode(raw)
    }

    #[inline]
    pub fn cipher(&self) -> Cipher {
        Cipher::new(&self.encryption_key)
    }

    #[inline]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires != 0 && (self.expires as Timestamp) <= now
    }

    /// Builds and encrypts a master key for this license's contract.
    pub fn new_master_key(&self) -> String {
        let mut key = Key::default();
        key.set_salt(rand::rng().random());
        key.set_master(self.master);
        key.set_contract(self.contract);
        key.set_signature(self.signature);
        key.set_permissions(Permissions::MASTER);
        key.set_target(0);
        key.set_expires(None);
        self.cipher().encrypt_key(&key)
    }
}

impl FromStr for License {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self> {
        License::parse(s)
    }
}

impl fmt::Display for License {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

impl fmt::Debug for License {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "License {{ contract: {}, master: {}, expires: {} }}",
            self.contract, self.master, self.expires
        )
    }
}
