use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::event::PeerName;
use crate::Result;

/// Everything exchanged over a cluster link, one per length-delimited frame.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum ClusterMessage {
    /// First message on a new link, both directions.
    Hello { name: PeerName, advertise: String, nonce: [u8; 32] },
    /// HMAC-SHA256 of the other side's nonce keyed by the cluster passphrase.
    Auth { mac: Vec<u8> },
    /// Known members and the addresses they can be dialed on.
    Members(Vec<(PeerName, String)>),
    /// Full subscription state.
    Gossip(Vec<u8>),
    /// Subscription changes only.
    GossipBroadcast(Vec<u8>),
    /// Snappy-compressed message frame.
    Unicast(Vec<u8>),
    Survey { id: u64, kind: String, payload: Vec<u8> },
    SurveyReply { id: u64, payload: Vec<u8> },
    Ping,
}

impl ClusterMessage {
    #[inline]
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self).map_err(anyhow::Error::new)?))
    }

    #[inline]
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize::<Self>(data).map_err(anyhow::Error::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec() {
        let msgs = [
            ClusterMessage::Hello { name: PeerName(7), advertise: "10.0.0.1:4000".into(), nonce: [3; 32] },
            ClusterMessage::Members(vec![(PeerName(1), "a:1".into())]),
            ClusterMessage::Survey { id: 9, kind: "memstore".into(), payload: vec![1, 2] },
            ClusterMessage::Ping,
        ];
        for m in msgs {
            assert_eq!(ClusterMessage::decode(&m.encode().unwrap()).unwrap(), m);
        }
        assert!(ClusterMessage::decode(&[0xff, 0xff, 0xff, 0xff]).is_err());
    }
}
