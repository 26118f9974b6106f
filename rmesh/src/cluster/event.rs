use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

use crate::message::Ssid;
use crate::utils::{format_hardware_addr, parse_hardware_addr};

const NAME_MASK: u64 = 0xffff_ffff_ffff;

/// A cluster member name: 6 bytes, written like a hardware address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerName(pub u64);

impl PeerName {
    /// Name from `cluster.name`: a hardware address is taken as is, any
    /// other text is hashed; without a name the host's first hardware
    /// address is used, or a random one.
    pub fn from_config(name: &str) -> PeerName {
        let name = name.trim();
        if name.is_empty() {
            return Self::from_host().unwrap_or_else(Self::random);
        }
        if let Some(n) = parse_hardware_addr(name) {
            return PeerName(n);
        }
        let hash = murmur3::murmur3_x64_128(&mut Cursor::new(name.as_bytes()), 0).unwrap_or_default();
        match (hash as u64) & NAME_MASK {
            0 => Self::random(),
            n => PeerName(n),
        }
    }

    fn from_host() -> Option<PeerName> {
        let mut entries = std::fs::read_dir("/sys/class/net")
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() != "lo")
            .map(|e| e.path())
            .collect::<Vec<_>>();
        entries.sort();
        entries
            .into_iter()
            .filter_map(|p| std::fs::read_to_string(p.join("address")).ok())
            .filter_map(|addr| parse_hardware_addr(&addr))
            .find(|n| *n != 0)
            .map(PeerName)
    }

    fn random() -> PeerName {
        PeerName((rand::random::<u64>() & NAME_MASK).max(1))
    }
}

impl fmt::Display for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&format_hardware_addr(self.0))
    }
}

impl fmt::Debug for PeerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerName({})", self)
    }
}

/// One subscription of one connection on one node, the element of the
/// replicated LWW set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub peer: PeerName,
    pub conn: u64,
    pub ssid: Ssid,
}
