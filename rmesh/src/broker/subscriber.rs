use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cluster::Peer;
use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("subscriber is closed")]
    Closed,
    #[error("subscriber queue is full")]
    Full,
    #[error("peer is inactive")]
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriberKind {
    Local,
    Remote,
}

/// The delivery side of a client connection.
#[derive(Debug)]
pub struct ConnHandle {
    pub id: u64,
    tx: mpsc::Sender<Message>,
}

impl ConnHandle {
    pub fn new(id: u64, tx: mpsc::Sender<Message>) -> Self {
        Self { id, tx }
    }

    #[inline]
    fn send(&self, msg: &Message) -> Result<(), TransportError> {
        self.tx.try_send(msg.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TransportError::Full,
            mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

/// Anything a published message can be delivered to: a client connected
/// to this node or a remote peer with subscribers of its own.
#[derive(Clone)]
pub enum Subscriber {
    Local(Arc<ConnHandle>),
    Remote(Arc<Peer>),
}

impl Subscriber {
    #[inline]
    pub fn kind(&self) -> SubscriberKind {
        match self {
            Subscriber::Local(_) => SubscriberKind::Local,
            Subscriber::Remote(_) => SubscriberKind::Remote,
        }
    }

    #[inline]
    pub fn is_local(&self) -> bool {
        matches!(self, Subscriber::Local(_))
    }

    #[inline]
    fn raw_id(&self) -> u64 {
        match self {
            Subscriber::Local(c) => c.id,
            Subscriber::Remote(p) => p.name().0,
        }
    }

    pub fn id(&self) -> String {
        match self {
            Subscriber::Local(c) => c.id.to_string(),
            Subscriber::Remote(p) => p.name().to_string(),
        }
    }

    /// Hands `msg` over without waiting, a full or closed subscriber drops it.
    #[inline]
    pub fn deliver(&self, msg: &Message) -> Result<(), TransportError> {
        match self {
            Subscriber::Local(c) => c.send(msg),
            Subscriber::Remote(p) => p.send(msg),
        }
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.raw_id() == other.raw_id()
    }
}

impl Eq for Subscriber {}

impl Hash for Subscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind().hash(state);
        self.raw_id().hash(state);
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self.kind(), self.id())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::cluster::PeerName;
    use crate::message::Ssid;

    fn message() -> Message {
        Message::new(Ssid::new(1, &[2]), Bytes::from_static(b"a/"), Bytes::from_static(b"hi"))
    }

    #[tokio::test]
    async fn local_delivery() {
        let (tx, mut rx) = mpsc::channel(1);
        let s = Subscriber::Local(Arc::new(ConnHandle::new(7, tx)));
        assert_eq!(s.id(), "7");
        assert!(s.is_local());

        s.deliver(&message()).unwrap();
        assert_eq!(s.deliver(&message()), Err(TransportError::Full));
        assert_eq!(rx.recv().await.unwrap().payload, "hi");
        drop(rx);
        assert_eq!(s.deliver(&message()), Err(TransportError::Closed));
    }

    #[test]
    fn identity() {
        let (tx, _rx) = mpsc::channel(1);
        let a = Subscriber::Local(Arc::new(ConnHandle::new(1, tx.clone())));
        let b = Subscriber::Local(Arc::new(ConnHandle::new(1, tx.clone())));
        let c = Subscriber::Local(Arc::new(ConnHandle::new(2, tx)));
        assert_eq!(a, b);
        assert_ne!(a, c);

        let token = CancellationToken::new();
        let p = Subscriber::Remote(Arc::new(Peer::new(PeerName(1), token.clone())));
        assert_ne!(a, p);
        assert_eq!(p, Subscriber::Remote(Arc::new(Peer::new(PeerName(1), token))));
        assert_eq!(p.id(), "00:00:00:00:00:01");
        assert_eq!(format!("{:?}", a), "Local(1)");
    }
}
