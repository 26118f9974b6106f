use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::counters::SubscriptionCounters;
use super::event::PeerName;
use super::message::ClusterMessage;
use super::Swarm;
use crate::broker::TransportError;
use crate::message::{encode_frame, Message};
use crate::task::spawn_periodic;
use crate::utils::{timestamp_secs, Timestamp};

/// A peer that said nothing for this long is dropped.
pub const PEER_TIMEOUT: Timestamp = 30;

const FLUSH_INTERVAL: Duration = Duration::from_millis(5);
const MAX_FRAME_LEN: usize = 65536;

/// A remote broker as seen by this node, the subscriber standing in for
/// every client connected there.
pub struct Peer {
    name: PeerName,
    frame: Mutex<Vec<Message>>,
    pub(crate) subs: SubscriptionCounters,
    activity: AtomicI64,
    token: CancellationToken,
}

impl Peer {
    pub fn new(name: PeerName, token: CancellationToken) -> Self {
        Self {
            name,
            frame: Mutex::new(Vec::new()),
            subs: SubscriptionCounters::default(),
            activity: AtomicI64::new(timestamp_secs()),
            token,
        }
    }

    #[inline]
    pub fn name(&self) -> PeerName {
        self.name
    }

    #[inline]
    pub fn touch(&self) {
        self.activity.store(timestamp_secs(), Ordering::SeqCst);
    }

    #[inline]
    pub(crate) fn set_activity(&self, at: Timestamp) {
        self.activity.store(at, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && timestamp_secs() - self.activity.load(Ordering::SeqCst) <= PEER_TIMEOUT
    }

    #[inline]
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Queues `msg` for the next frame to this peer.
    pub fn send(&self, msg: &Message) -> Result<(), TransportError> {
        if !self.is_active() {
            return Err(TransportError::Inactive);
        }
        let mut frame = self.frame.lock();
        if frame.len() >= MAX_FRAME_LEN {
            return Err(TransportError::Full);
        }
        let mut msg = msg.clone();
        msg.time = 0;
        msg.ttl = 0;
        frame.push(msg);
        Ok(())
    }

    #[inline]
    fn take_frame(&self) -> Vec<Message> {
        std::mem::take(&mut *self.frame.lock())
    }

    /// Starts the task sending queued messages every few milliseconds, it
    /// stops when the peer is closed.
    pub(crate) fn start(self: &Arc<Self>, swarm: Swarm) {
        let peer = self.clone();
        spawn_periodic("peer flush", FLUSH_INTERVAL, self.token.clone(), move || {
            let peer = peer.clone();
            let swarm = swarm.clone();
            async move { peer.flush(&swarm) }
        });
    }

    fn flush(&self, swarm: &Swarm) {
        let frame = self.take_frame();
        if frame.is_empty() {
            return;
        }
        let data = match encode_frame(&frame) {
            Ok(data) => data,
            Err(e) => {
                log::warn!("frame to {} dropped, {:?}", self.name, e);
                return;
            }
        };
        if let Err(e) = swarm.unicast(self.name, &ClusterMessage::Unicast(data)) {
            log::debug!("{} messages to {} dropped, {:?}", frame.len(), self.name, e);
        }
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("name", &self.name)
            .field("activity", &self.activity.load(Ordering::SeqCst))
            .field("subs", &self.subs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::message::Ssid;

    fn message() -> Message {
        let mut m = Message::new(Ssid::new(1, &[2]), Bytes::from_static(b"a/"), Bytes::from_static(b"hi"));
        m.ttl = 30;
        m
    }

    #[test]
    fn batches_until_taken() {
        let peer = Peer::new(PeerName(1), CancellationToken::new());
        peer.send(&message()).unwrap();
        peer.send(&message()).unwrap();
        let frame = peer.take_frame();
        assert_eq!(frame.len(), 2);
        assert_eq!(frame[0].time, 0);
        assert_eq!(frame[0].ttl, 0);
        assert_eq!(frame[0].payload, "hi");
        assert!(peer.take_frame().is_empty());
    }

    #[test]
    fn inactive_and_full() {
        let peer = Peer::new(PeerName(1), CancellationToken::new());
        peer.set_activity(timestamp_secs() - PEER_TIMEOUT - 1);
        assert!(!peer.is_active());
        assert_eq!(peer.send(&message()), Err(TransportError::Inactive));

        peer.touch();
        for _ in 0..MAX_FRAME_LEN {
            peer.send(&message()).unwrap();
        }
        assert_eq!(peer.send(&message()), Err(TransportError::Full));

        peer.close();
        assert_eq!(peer.send(&message()), Err(TransportError::Inactive));
    }
}
