//! Key generation requests, published by clients on `emitter/keygen/`.

use serde::{Deserialize, Serialize};

use crate::security::Permissions;
use crate::utils::Timestamp;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct KeyGenRequest {
    /// A master key of the contract the new key is made for.
    pub key: String,
    /// The channel the new key grants, e.g. `"a/b/"`.
    pub channel: String,
    /// Permission letters out of `rwslp`.
    #[serde(rename = "type", default)]
    pub access: String,
    /// Seconds until the new key expires, 0 never.
    #[serde(default)]
    pub ttl: i64,
}

impl KeyGenRequest {
    #[inline]
    pub fn permissions(&self) -> Option<Permissions> {
        Permissions::from_letters(&self.access)
    }

    #[inline]
    pub fn expires(&self, now: Timestamp) -> Option<Timestamp> {
        (self.ttl > 0).then(|| now + self.ttl)
    }

    /// The requested channel with its trailing slash.
    pub fn channel_path(&self) -> String {
        let channel = self.channel.trim_start_matches('/');
        if channel.ends_with('/') {
            channel.to_owned()
        } else {
            format!("{}/", channel)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct KeyGenResponse {
    pub status: u16,
    pub key: String,
    pub channel: String,
}
