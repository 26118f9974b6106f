use std::io::Cursor;

use bytes::Bytes;

use crate::message::{Ssid, WILDCARD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Invalid,
    Static,
    Wildcard,
}

/// A parsed `KEY/part/part/.../?k=v&k=v` channel string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub key: Bytes,
    /// The channel path after the key, with its trailing `/` and without options.
    pub channel: Bytes,
    /// One hash per part, `WILDCARD` for `+`.
    pub query: Vec<u32>,
    pub options: Vec<(String, String)>,
    pub kind: ChannelKind,
}

impl Channel {
    fn invalid() -> Self {
        Channel {
            key: Bytes::new(),
            channel: Bytes::new(),
            query: Vec::new(),
            options: Vec::new(),
            kind: ChannelKind::Invalid,
        }
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.kind != ChannelKind::Invalid
    }

    /// Hash of the first part, the value a key's target is compared with.
    #[inline]
    pub fn target(&self) -> u32 {
        self.query.first().copied().unwrap_or_default()
    }

    #[inline]
    pub fn ssid(&self, contract: u32) -> Ssid {
        Ssid::new(contract, &self.query)
    }

    #[inline]
    pub fn option(&self, name: &str) -> Option<&str> {
        self.options.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    /// `ttl=<seconds>`, storage time requested by a publisher.
    #[inline]
    pub fn ttl(&self) -> Option<u32> {
        self.option("ttl").and_then(|v| v.parse().ok()).filter(|ttl| *ttl > 0)
    }

    /// `last=<n>`, number of stored messages requested by a subscriber.
    #[inline]
    pub fn last(&self) -> Option<usize> {
        self.option("last").and_then(|v| v.parse().ok()).filter(|n| *n > 0)
    }

    /// `me=0` asks not to receive one's own publications.
    #[inline]
    pub fn exclude_me(&self) -> bool {
        self.option("me") == Some("0")
    }
}

#[inline]
fn is_part_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'-' | b'.' | b':' | b';')
}

/// Hash of one channel part, stable across runs and nodes.
#[inline]
pub fn hash_part(part: &[u8]) -> u32 {
    if part == b"+" {
        return WILDCARD;
    }
    murmur3::murmur3_32(&mut Cursor::new(part), 0).unwrap_or(0)
}

/// Parses a channel string. Malformed input yields a channel of kind
/// [`ChannelKind::Invalid`].
pub fn parse_channel(text: &[u8]) -> Channel {
    let key_end = match text.iter().position(|c| *c == b'/') {
        Some(0) | None => return Channel::invalid(),
        Some(i) => i,
    };

    let path_start = key_end + 1;
    let mut kind = ChannelKind::Static;
    let mut query = Vec::new();
    let mut part_start = path_start;
    let mut wildcard = false;
    let mut options_start = None;

    for (i, c) in text.iter().enumerate().skip(path_start) {
        match *c {
            b'/' => {
                if i == part_start {
                    return Channel::invalid();
                }
                query.push(hash_part(&text[part_start..i]));
                part_start = i + 1;
                wildcard = false;
            }
            b'?' => {
                if i != part_start || query.is_empty() {
                    return Channel::invalid();
                }
                options_start = Some(i + 1);
                break;
            }
            b'+' => {
                if i != part_start {
                    return Channel::invalid();
                }
                wildcard = true;
                kind = ChannelKind::Wildcard;
            }
            c if is_part_byte(c) => {
                if wildcard {
                    return Channel::invalid();
                }
            }
            _ => return Channel::invalid(),
        }
    }

    //a segment that was never closed by '/'
    if options_start.is_none() && part_start != text.len() {
        return Channel::invalid();
    }
    if query.is_empty() {
        return Channel::invalid();
    }

    let options = match options_start {
        Some(start) => match parse_options(&text[start..]) {
            Some(options) => options,
            None => return Channel::invalid(),
        },
        None => Vec::new(),
    };

    Channel {
        key: Bytes::copy_from_slice(&text[..key_end]),
        channel: Bytes::copy_from_slice(&text[path_start..part_start]),
        query,
        options,
        kind,
    }
}

fn parse_options(text: &[u8]) -> Option<Vec<(String, String)>> {
    let text = std::str::from_utf8(text).ok()?;
    text.split('&')
        .map(|pair| {
            let (k, v) = pair.split_once('=')?;
            let valid = |s: &str| !s.is_empty() && s.bytes().all(|c| c.is_ascii_alphanumeric());
            if valid(k) && valid(v) {
                Some((k.to_owned(), v.to_owned()))
            } else {
                None
            }
        })
        .collect()
}
