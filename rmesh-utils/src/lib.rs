//! Small helpers shared by the rmesh crates.
//!
//! - [`Bytesize`]: "1G512M"-style sizes used by the storage configuration
//! - duration strings such as "1h30m" or "500ms" ([`to_duration`])
//! - listen address parsing that accepts the short `":8080"` form
//! - wall-clock timestamps in seconds and nanoseconds
//! - hardware address parsing for cluster peer names
//!
//! ```rust
//! use rmesh_utils::{to_bytesize, to_duration};
//!
//! assert_eq!(to_bytesize("1G"), 1_073_741_824);
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::net::SocketAddr;
use std::ops::Deref;
use std::time::Duration;

use anyhow::anyhow;
use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};

/// Timestamp in seconds since the Unix epoch
pub type Timestamp = i64;

/// Timestamp in nanoseconds since the Unix epoch
pub type TimestampNanos = i64;

const BYTESIZE_K: usize = 1024;
const BYTESIZE_M: usize = 1048576;
const BYTESIZE_G: usize = 1073741824;

/// Human-readable byte size, e.g. `"1G"`, `"512M"` or `"2G512M"`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Formats the size with the largest units first, `3145728` becomes `"3M"`.
    pub fn string(&self) -> String {
        let mut v = self.0;
        let mut res = String::new();
        for (unit, size) in [('G', BYTESIZE_G), ('M', BYTESIZE_M), ('K', BYTESIZE_K)] {
            let n = v / size;
            if n > 0 {
                res.push_str(&format!("{}{}", n, unit));
                v %= size;
            }
        }
        if v > 0 || res.is_empty() {
            res.push_str(&format!("{}B", v));
        }
        res
    }
}

impl Deref for Bytesize {
    type Target = usize;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl fmt::Display for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.string())
    }
}

impl Serialize for Bytesize {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    #[inline]
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(usize),
            Text(String),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Bytesize(n),
            Raw::Text(s) => Bytesize(to_bytesize(&s)),
        })
    }
}

/// Parses a size such as `"2G512K"`. Unknown units count as zero and a bare
/// number is taken as bytes.
#[inline]
pub fn to_bytesize(text: &str) -> usize {
    let text = text.trim().to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    if let Ok(v) = text.parse::<usize>() {
        return v;
    }
    sum_units(&text, |unit| match unit {
        'B' => Some(1),
        'K' => Some(BYTESIZE_K),
        'M' => Some(BYTESIZE_M),
        'G' => Some(BYTESIZE_G),
        _ => None,
    })
}

/// Sums `<number><unit>` segments, a segment with an unknown unit or a bad
/// number contributes nothing.
fn sum_units<N>(text: &str, scale: impl Fn(char) -> Option<N>) -> N
where
    N: std::str::FromStr + std::ops::Mul<Output = N> + std::iter::Sum + Default,
{
    let mut segments = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if !c.is_ascii_digit() {
            segments.push((&text[start..i], c));
            start = i + c.len_utf8();
        }
    }
    segments
        .into_iter()
        .map(|(num, unit)| match (num.parse::<N>(), scale(unit)) {
            (Ok(n), Some(factor)) => n * factor,
            _ => N::default(),
        })
        .sum()
}

/// Converts a duration string to a [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. A bare number is seconds.
///
/// ```rust
/// assert_eq!(rmesh_utils::to_duration("1h30m15s").as_secs(), 5415);
/// assert_eq!(rmesh_utils::to_duration("250ms").as_millis(), 250);
/// ```
#[inline]
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase();
    if let Ok(secs) = text.parse::<u64>() {
        return Duration::from_secs(secs);
    }
    let text = text.replace("ms", "Y");
    let ms = sum_units::<u64>(&text, |unit| match unit {
        'Y' => Some(1),
        's' => Some(1000),
        'm' => Some(60_000),
        'h' => Some(3_600_000),
        'd' => Some(86_400_000),
        'w' => Some(604_800_000),
        _ => None,
    });
    Duration::from_millis(ms)
}

#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(to_duration(&String::deserialize(deserializer)?))
}

/// Parses a listen address. `":8080"` binds every interface.
#[inline]
pub fn to_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    let addr = addr.trim();
    let addr = if addr.starts_with(':') { format!("0.0.0.0{}", addr) } else { addr.to_owned() };
    addr.parse::<SocketAddr>().map_err(|e| anyhow!("invalid address {:?}, {}", addr, e))
}

#[inline]
pub fn deserialize_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    to_addr(&String::deserialize(deserializer)?).map_err(serde::de::Error::custom)
}

/// An empty string deserializes to `None`.
#[inline]
pub fn deserialize_addr_option<'de, D>(deserializer: D) -> std::result::Result<Option<SocketAddr>, D::Error>
where
    D: Deserializer<'de>,
{
    let addr = String::deserialize(deserializer)?;
    if addr.trim().is_empty() {
        return Ok(None);
    }
    to_addr(&addr).map(Some).map_err(serde::de::Error::custom)
}

/// Parses a 6-byte hardware address such as `"02:42:ac:11:00:02"` into
/// the low 48 bits of a `u64`.
pub fn parse_hardware_addr(text: &str) -> Option<u64> {
    let parts = text.trim().split([':', '-']).collect::<Vec<_>>();
    if parts.len() != 6 {
        return None;
    }
    let mut name = 0u64;
    for p in parts {
        if p.len() != 2 {
            return None;
        }
        name = (name << 8) | u8::from_str_radix(p, 16).ok()? as u64;
    }
    Some(name)
}

/// Formats the low 48 bits of `name` as a colon separated hardware address.
pub fn format_hardware_addr(name: u64) -> String {
    (0..6).rev().map(|i| format!("{:02x}", (name >> (i * 8)) as u8)).collect::<Vec<_>>().join(":")
}

#[inline]
pub fn timestamp() -> Duration {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_else(|_| {
        let now = chrono::Local::now();
        Duration::new(now.timestamp() as u64, now.timestamp_subsec_nanos())
    })
}

#[inline]
pub fn timestamp_secs() -> Timestamp {
    timestamp().as_secs() as i64
}

#[inline]
pub fn timestamp_nanos() -> TimestampNanos {
    timestamp().as_nanos() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytesize() {
        assert_eq!(to_bytesize("1G"), BYTESIZE_G);
        assert_eq!(to_bytesize("2G512M"), 2 * BYTESIZE_G + 512 * BYTESIZE_M);
        assert_eq!(to_bytesize("10kb"), 10 * BYTESIZE_K);
        assert_eq!(to_bytesize("4096"), 4096);
        assert_eq!(Bytesize(3145728).string(), "3M");
        assert_eq!(Bytesize(0).string(), "0B");

        let s: Bytesize = serde_json::from_str("\"1G\"").unwrap();
        assert_eq!(s.as_usize(), BYTESIZE_G);
        let s: Bytesize = serde_json::from_str("1024").unwrap();
        assert_eq!(s.as_usize(), 1024);
    }

    #[test]
    fn duration() {
        assert_eq!(to_duration("1h30m15s"), Duration::from_secs(5415));
        assert_eq!(to_duration("5ms"), Duration::from_millis(5));
        assert_eq!(to_duration("30"), Duration::from_secs(30));
        assert_eq!(to_duration("2d"), Duration::from_secs(172800));
    }

    #[test]
    fn addr() {
        assert_eq!(to_addr(":8080").unwrap(), "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(to_addr("127.0.0.1:4000").unwrap().port(), 4000);
        assert!(to_addr("localhost").is_err());
    }

    #[test]
    fn hardware_addr() {
        let name = parse_hardware_addr("02:42:ac:11:00:02").unwrap();
        assert_eq!(name, 0x0242_ac11_0002);
        assert_eq!(format_hardware_addr(name), "02:42:ac:11:00:02");
        assert_eq!(parse_hardware_addr("02:42:ac:11:00"), None);
        assert_eq!(parse_hardware_addr("zz:42:ac:11:00:02"), None);
    }

    #[test]
    fn timestamps() {
        let n = timestamp_nanos();
        assert!(n > 1_262_304_000 * 1_000_000_000);
        assert!(timestamp_secs() <= n / 1_000_000_000 + 1);
    }
}
