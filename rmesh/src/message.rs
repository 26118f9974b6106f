use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{Read, Write};
use std::ops::Deref;

use anyhow::anyhow;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::utils::{timestamp_nanos, TimestampNanos};
use crate::Result;

/// Reserved part hash standing for "any one part".
pub const WILDCARD: u32 = 1815237614;

/// Subscription identifier: the contract followed by one hash per channel part.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ssid(pub Vec<u32>);

impl Ssid {
    #[inline]
    pub fn new(contract: u32, query: &[u32]) -> Self {
        let mut v = Vec::with_capacity(query.len() + 1);
        v.push(contract);
        v.extend_from_slice(query);
        Ssid(v)
    }

    #[inline]
    pub fn contract(&self) -> u32 {
        self.0.first().copied().unwrap_or_default()
    }

    /// The channel part hashes, without the contract.
    #[inline]
    pub fn query(&self) -> &[u32] {
        self.0.get(1..).unwrap_or_default()
    }

    /// XOR of every element.
    #[inline]
    pub fn hash_code(&self) -> u32 {
        self.0.iter().fold(0, |acc, v| acc ^ v)
    }
}

impl Hash for Ssid {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.hash_code())
    }
}

impl Deref for Ssid {
    type Target = [u32];
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<Vec<u32>> for Ssid {
    fn from(v: Vec<u32>) -> Self {
        Ssid(v)
    }
}

impl fmt::Debug for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ssid{:?}", self.0)
    }
}

/// A published message as routed, stored and forwarded between peers.
///
/// On the wire a message is the record `(time, ssid, channel, payload)`,
/// the ttl stays with the node that stores it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Nanoseconds since the Unix epoch, 0 for messages in flight to a peer.
    pub time: TimestampNanos,
    pub ssid: Ssid,
    pub channel: Bytes,
    pub payload: Bytes,
    /// Seconds to keep the message in storage, 0 when it is not stored.
    #[serde(skip)]
    pub ttl: u32,
}

impl Message {
    #[inline]
    pub fn new(ssid: Ssid, channel: Bytes, payload: Bytes) -> Self {
        Self { time: timestamp_nanos(), ssid, channel, payload, ttl: 0 }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.channel.len() + self.payload.len()
    }

    /// Wall-clock nanoseconds after which a stored copy is dropped.
    #[inline]
    pub fn expires(&self) -> TimestampNanos {
        self.time + self.ttl as i64 * 1_000_000_000
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "Message {{ time: {}, ssid: {:?}, channel: {:?}, payload: {} bytes, ttl: {} }}",
            self.time,
            self.ssid,
            String::from_utf8_lossy(&self.channel),
            self.payload.len(),
            self.ttl
        )
    }
}

/// A batch of messages exchanged between peers.
pub type Frame = Vec<Message>;

/// Serializes a frame and compresses it with snappy.
pub fn encode_frame(frame: &[Message]) -> Result<Vec<u8>> {
    let raw = bincode::serialize(frame)?;
    let mut wtr = snap::write::FrameEncoder::new(Vec::with_capacity(raw.len() / 2 + 16));
    wtr.write_all(&raw)?;
    wtr.into_inner().map_err(|e| anyhow!("snappy encode error, {}", e))
}

pub fn decode_frame(data: &[u8]) -> Result<Frame> {
    let mut raw = Vec::new();
    snap::read::FrameDecoder::new(data).read_to_end(&mut raw)?;
    Ok(bincode::deserialize(&raw)?)
}
