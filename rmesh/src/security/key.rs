use std::fmt;

use bitflags::bitflags;

use super::channel::Channel;
use crate::utils::Timestamp;

/// Key expiry times count seconds from 2010-01-01T00:00:00Z.
pub const EXPIRY_EPOCH: Timestamp = 1_262_304_000;

pub const KEY_LEN: usize = 24;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u32 {
        const MASTER = 1;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const STORE = 1 << 3;
        const LOAD = 1 << 4;
        const PRESENCE = 1 << 5;
    }
}

impl Permissions {
    /// Parses the `type` letters of a key generation request, e.g. `"rwsl"`.
    pub fn from_letters(letters: &str) -> Option<Permissions> {
        let mut p = Permissions::empty();
        for c in letters.chars() {
            p |= match c.to_ascii_lowercase() {
                'r' => Permissions::READ,
                'w' => Permissions::WRITE,
                's' => Permissions::STORE,
                'l' => Permissions::LOAD,
                'p' => Permissions::PRESENCE,
                _ => return None,
            };
        }
        Some(p)
    }
}

/// The 24-byte binary channel key, all fields big-endian:
///
/// ```text
/// [0..2] salt  [2..4] master  [4..8] contract  [8..12] signature
/// [12..16] permissions  [16..20] target  [20..24] expiry
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Key(pub [u8; KEY_LEN]);

impl Key {
    #[inline]
    pub fn from_slice(b: &[u8]) -> Option<Key> {
        <[u8; KEY_LEN]>::try_from(b).ok().map(Key)
    }

    #[inline]
    fn u16_at(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.0[at], self.0[at + 1]])
    }

    #[inline]
    fn u32_at(&self, at: usize) -> u32 {
        u32::from_be_bytes([self.0[at], self.0[at + 1], self.0[at + 2], self.0[at + 3]])
    }

    #[inline]
    fn set_u16_at(&mut self, at: usize, v: u16) {
        self.0[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    #[inline]
    fn set_u32_at(&mut self, at: usize, v: u32) {
        self.0[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    #[inline]
    pub fn salt(&self) -> u16 {
        self.u16_at(0)
    }

    #[inline]
    pub fn set_salt(&mut self, v: u16) {
        self.set_u16_at(0, v)
    }

    #[inline]
    pub fn master(&self) -> u16 {
        self.u16_at(2)
    }

    #[inline]
    pub fn set_master(&mut self, v: u16) {
        self.set_u16_at(2, v)
    }

    #[inline]
    pub fn contract(&self) -> u32 {
        self.u32_at(4)
    }

    #[inline]
    pub fn set_contract(&mut self, v: u32) {
        self.set_u32_at(4, v)
    }

    #[inline]
    pub fn signature(&self) -> u32 {
        self.u32_at(8)
    }

    #[inline]
    pub fn set_signature(&mut self, v: u32) {
        self.set_u32_at(8, v)
    }

    #[inline]
    pub fn permissions(&self) -> Permissions {
        Permissions::from_bits_truncate(self.u32_at(12))
    }

    #[inline]
    pub fn set_permissions(&mut self, p: Permissions) {
        self.set_u32_at(12, p.bits())
    }

    #[inline]
    pub fn target(&self) -> u32 {
        self.u32_at(16)
    }

    #[inline]
    pub fn set_target(&mut self, v: u32) {
        self.set_u32_at(16, v)
    }

    /// Expiry in Unix seconds, `None` for a key that never expires.
    #[inline]
    pub fn expires(&self) -> Option<Timestamp> {
        match self.u32_at(20) {
            0 => None,
            v => Some(EXPIRY_EPOCH + v as Timestamp),
        }
    }

    /// Sets the expiry from Unix seconds, `None` never expires. Times before
    /// the key epoch are clamped to one second past it.
    #[inline]
    pub fn set_expires(&mut self, at: Option<Timestamp>) {
        let v = match at {
            None => 0,
            Some(at) => (at - EXPIRY_EPOCH).clamp(1, u32::MAX as Timestamp) as u32,
        };
        self.set_u32_at(20, v)
    }

    #[inline]
    pub fn is_expired(&self, now: Timestamp) -> bool {
        matches!(self.expires(), Some(at) if at <= now)
    }

    #[inline]
    pub fn has_permission(&self, p: Permissions) -> bool {
        self.permissions().contains(p)
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        self.has_permission(Permissions::MASTER)
    }

    /// A zero target grants every channel, otherwise it must equal the
    /// hash of the channel's first part.
    #[inline]
    pub fn validate_channel(&self, channel: &Channel) -> bool {
        let target = self.target();
        target == 0 || target == channel.target()
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Key")
            .field("master", &self.master())
            .field("contract", &self.contract())
            .field("permissions", &self.permissions())
            .field("target", &self.target())
            .field("expires", &self.expires())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::channel::{hash_part, parse_channel};

    #[test]
    fn field_layout() {
        let mut k = Key::default();
        k.set_salt(0x0102);
        k.set_master(0x0304);
        k.set_contract(0x05060708);
        k.set_signature(0x090a0b0c);
        k.set_permissions(Permissions::READ | Permissions::WRITE);
        k.set_target(0x11121314);
        k.set_expires(Some(EXPIRY_EPOCH + 0x15161718));
        assert_eq!(
            k.0,
            [
                0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0, 0, 0, 6, 0x11, 0x12,
                0x13, 0x14, 0x15, 0x16, 0x17, 0x18
            ]
        );
        assert_eq!(k.salt(), 0x0102);
        assert_eq!(k.master(), 0x0304);
        assert_eq!(k.contract(), 0x05060708);
        assert_eq!(k.signature(), 0x090a0b0c);
        assert_eq!(k.target(), 0x11121314);
        assert!(k.has_permission(Permissions::READ));
        assert!(!k.has_permission(Permissions::STORE));
        assert!(!k.is_master());
        assert_eq!(Key::from_slice(&k.0), Some(k));
        assert_eq!(Key::from_slice(&k.0[..23]), None);
    }

    #[test]
    fn expiry() {
        let mut k = Key::default();
        assert_eq!(k.expires(), None);
        assert!(!k.is_expired(i64::MAX));

        let now = 1_700_000_000;
        k.set_expires(Some(now + 60));
        assert_eq!(k.expires(), Some(now + 60));
        assert!(!k.is_expired(now));
        assert!(k.is_expired(now + 60));

        k.set_expires(Some(0));
        assert_eq!(k.expires(), Some(EXPIRY_EPOCH + 1));
        assert!(k.is_expired(now));
    }

    #[test]
    fn channel_target() {
        let mut k = Key::default();
        let c = parse_channel(b"key/a/b/");
        assert!(k.validate_channel(&c));
        k.set_target(hash_part(b"a"));
        assert!(k.validate_channel(&c));
        k.set_target(hash_part(b"b"));
        assert!(!k.validate_channel(&c));
    }

    #[test]
    fn permission_letters() {
        assert_eq!(
            Permissions::from_letters("rwslp"),
            Some(
                Permissions::READ
                    | Permissions::WRITE
                    | Permissions::STORE
                    | Permissions::LOAD
                    | Permissions::PRESENCE
            )
        );
        assert_eq!(Permissions::from_letters("R"), Some(Permissions::READ));
        assert_eq!(Permissions::from_letters(""), Some(Permissions::empty()));
        assert_eq!(Permissions::from_letters("rx"), None);
    }
}
