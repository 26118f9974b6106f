//! Peer-to-peer cluster.
//!
//! Members keep one authenticated TCP link to each other. Subscriptions are
//! replicated as an LWW set of [`SubscriptionEvent`]s: single changes are
//! broadcast as they happen and the full state is exchanged periodically
//! and on every new link. A remote member is represented in the local trie
//! by its [`Peer`], which batches the messages it matches and forwards them
//! as one compressed frame.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::broker::Subscriber;
use crate::conf;
use crate::message::{decode_frame, Ssid};
use crate::task::spawn_periodic;
use crate::trie::{HashSet, Trie};
use crate::Result;

mod counters;
mod event;
pub mod lww;
mod message;
mod peer;
mod survey;
mod transport;

pub use counters::{Counter, SubscriptionCounters};
pub use event::{PeerName, SubscriptionEvent};
pub use lww::{LwwSet, LwwTime};
pub use message::ClusterMessage;
pub use peer::{Peer, PEER_TIMEOUT};
pub use survey::{Surveyee, Surveyor};

use survey::PendingSurveys;
use transport::Link;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(5);
const STATE_GC_INTERVAL: Duration = Duration::from_secs(60);
const STATE_GC_AGE: Duration = Duration::from_secs(3600);

#[derive(Clone)]
pub struct Swarm(Arc<SwarmInner>);

pub struct SwarmInner {
    name: PeerName,
    cfg: conf::Cluster,
    local_addr: OnceCell<SocketAddr>,
    state: Mutex<LwwSet<SubscriptionEvent>>,
    members: DashMap<PeerName, String>,
    links: DashMap<PeerName, Link>,
    dialing: DashMap<String, ()>,
    peers: DashMap<PeerName, Arc<Peer>>,
    trie: Arc<Trie<Subscriber>>,
    surveys: PendingSurveys,
    surveyees: RwLock<Vec<Arc<dyn Surveyee>>>,
    link_id: AtomicU64,
    token: CancellationToken,
}

impl Deref for Swarm {
    type Target = SwarmInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Swarm {
    pub fn new(cfg: conf::Cluster, trie: Arc<Trie<Subscriber>>, token: CancellationToken) -> Swarm {
        let name = PeerName::from_config(&cfg.name);
        Swarm(Arc::new(SwarmInner {
            name,
            cfg,
            local_addr: OnceCell::new(),
            state: Mutex::new(LwwSet::new()),
            members: DashMap::default(),
            links: DashMap::default(),
            dialing: DashMap::default(),
            peers: DashMap::default(),
            trie,
            surveys: PendingSurveys::default(),
            surveyees: RwLock::new(Vec::new()),
            link_id: AtomicU64::new(1),
            token: token.child_token(),
        }))
    }

    #[inline]
    pub fn name(&self) -> PeerName {
        self.name
    }

    /// Address other members dial to reach this node.
    pub fn advertise(&self) -> String {
        self.cfg.advertise.or_else(|| self.local_addr.get().copied()).map(|a| a.to_string()).unwrap_or_default()
    }

    /// Binds the cluster listener and starts the background tasks.
    pub async fn start(&self) -> Result<SocketAddr> {
        let laddr = self.cfg.listen.ok_or_else(|| anyhow!("cluster.listen is not configured"))?;
        let listener = TcpListener::bind(laddr).await?;
        let local_addr = listener.local_addr()?;
        let _ = self.local_addr.set(local_addr);

        let swarm = self.clone();
        tokio::spawn(async move { swarm.listen(listener).await });

        let swarm = self.clone();
        spawn_periodic("cluster maintenance", MAINTENANCE_INTERVAL, self.token.clone(), move || {
            let swarm = swarm.clone();
            async move { swarm.maintain() }
        });
        let swarm = self.clone();
        spawn_periodic("cluster gossip", self.cfg.gossip_interval, self.token.clone(), move || {
            let swarm = swarm.clone();
            async move { swarm.gossip() }
        });
        let swarm = self.clone();
        spawn_periodic("cluster state gc", STATE_GC_INTERVAL, self.token.clone(), move || {
            let swarm = swarm.clone();
            async move { swarm.gc_state() }
        });

        log::info!("cluster member {} listening on {}, advertised as {:?}", self.name, local_addr, self.advertise());
        Ok(local_addr)
    }

    pub fn close(&self) {
        self.token.cancel();
        for peer in self.peers.iter() {
            peer.close();
        }
        log::info!("cluster member {} closed", self.name);
    }

    pub fn add_surveyee(&self, surveyee: Arc<dyn Surveyee>) {
        self.surveyees.write().push(surveyee);
    }

    #[inline]
    pub fn links(&self) -> usize {
        self.links.len()
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.peers.iter().map(|p| p.value().clone()).collect()
    }

    /// Announces the first local subscriber of `ssid`.
    pub fn notify_subscribe(&self, conn: u64, ssid: &Ssid) {
        let ev = SubscriptionEvent { peer: self.name, conn, ssid: ssid.clone() };
        let t = self.state.lock().add(ev.clone());
        self.broadcast_change(ev, t);
    }

    /// Announces that the last local subscriber of `ssid` left.
    pub fn notify_unsubscribe(&self, conn: u64, ssid: &Ssid) {
        let ev = SubscriptionEvent { peer: self.name, conn, ssid: ssid.clone() };
        let t = self.state.lock().remove(ev.clone());
        self.broadcast_change(ev, t);
    }

    fn broadcast_change(&self, ev: SubscriptionEvent, t: LwwTime) {
        match bincode::serialize(&LwwSet::single(ev, t)) {
            Ok(data) => self.broadcast(&ClusterMessage::GossipBroadcast(data)),
            Err(e) => log::warn!("subscription change encode failed, {:?}", e),
        }
    }

    /// Sends `msg` on every link, dropping it for links that are backed up.
    pub fn broadcast(&self, msg: &ClusterMessage) {
        let data = match msg.encode() {
            Ok(data) => data,
            Err(e) => {
                log::warn!("cluster message encode failed, {:?}", e);
                return;
            }
        };
        for link in self.links.iter() {
            if link.tx.try_send(data.clone()).is_err() {
                log::debug!("cluster message to {} dropped", link.key());
            }
        }
    }

    pub fn unicast(&self, name: PeerName, msg: &ClusterMessage) -> Result<()> {
        let data = msg.encode()?;
        let link = self.links.get(&name).ok_or_else(|| anyhow!("no link to {}", name))?;
        link.tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => anyhow!("link to {} is full", name),
            TrySendError::Closed(_) => anyhow!("link to {} is closed", name),
        })
    }

    fn encode_state(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&*self.state.lock())?)
    }

    fn gossip(&self) {
        if self.links.is_empty() {
            return;
        }
        match self.encode_state() {
            Ok(data) => self.broadcast(&ClusterMessage::Gossip(data)),
            Err(e) => log::warn!("cluster state encode failed, {:?}", e),
        }
    }

    fn gc_state(&self) {
        let cutoff = lww::now() - STATE_GC_AGE.as_nanos() as i64;
        let removed = self.state.lock().gc(cutoff);
        if removed > 0 {
            log::debug!("{} removed subscriptions forgotten", removed);
        }
    }

    /// Finds or creates the peer for `name`.
    fn peer(&self, name: PeerName) -> Arc<Peer> {
        let state = self.state.lock();
        self.peer_locked(&state, name).0
    }

    /// A new peer gets every subscription the state holds for it; callers
    /// hold the state lock.
    fn peer_locked(&self, state: &LwwSet<SubscriptionEvent>, name: PeerName) -> (Arc<Peer>, bool) {
        if let Some(peer) = self.peers.get(&name) {
            return (peer.value().clone(), false);
        }
        let peer = Arc::new(Peer::new(name, self.token.child_token()));
        let mut replayed = 0;
        for (ev, t) in state.iter() {
            if ev.peer == name && t.is_added() && peer.subs.increment(&ev.ssid, Bytes::new(), ev.conn) {
                self.trie.subscribe(&ev.ssid, Subscriber::Remote(peer.clone()));
                replayed += 1;
            }
        }
        self.peers.insert(name, peer.clone());
        peer.start(self.clone());
        log::info!("peer {} joined with {} subscriptions", name, replayed);
        (peer, true)
    }

    fn on_gossip(&self, data: &[u8]) {
        let mut incoming: LwwSet<SubscriptionEvent> = match bincode::deserialize(data) {
            Ok(set) => set,
            Err(e) => {
                log::warn!("undecodable gossip, {:?}", e);
                return;
            }
        };

        let mut state = self.state.lock();
        let before: HashMap<SubscriptionEvent, bool> =
            incoming.iter().map(|(ev, _)| (ev.clone(), state.contains(ev))).collect();
        state.merge(&mut incoming);

        let mut created = HashSet::default();
        for (ev, t) in incoming.iter() {
            if ev.peer == self.name {
                continue;
            }
            let was = before.get(ev).copied().unwrap_or(false);
            let is = t.is_added();
            if was == is || created.contains(&ev.peer) {
                continue;
            }
            if is {
                let (peer, new) = self.peer_locked(&state, ev.peer);
                if new {
                    created.insert(ev.peer);
                } else if peer.subs.increment(&ev.ssid, Bytes::new(), ev.conn) {
                    self.trie.subscribe(&ev.ssid, Subscriber::Remote(peer));
                }
            } else if let Some(peer) = self.peers.get(&ev.peer).map(|p| p.value().clone()) {
                if peer.subs.decrement(&ev.ssid).is_some() {
                    self.trie.unsubscribe(&ev.ssid, &Subscriber::Remote(peer));
                }
            }
        }
    }

    /// Delivers a frame forwarded by another member to local subscribers.
    fn on_unicast(&self, data: &[u8]) {
        let frame = match decode_frame(data) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("undecodable message frame, {:?}", e);
                return;
            }
        };
        for msg in frame.iter() {
            for sub in self.trie.lookup(&msg.ssid) {
                if !sub.is_local() {
                    continue;
                }
                if let Err(e) = sub.deliver(msg) {
                    log::debug!("forwarded message to {} dropped, {:?}", sub.id(), e);
                }
            }
        }
    }

    fn answer_survey(&self, kind: &str, payload: &[u8]) -> Vec<u8> {
        let surveyees = self.surveyees.read().clone();
        surveyees.iter().find_map(|s| s.on_survey(kind, payload)).unwrap_or_default()
    }

    fn maintain(&self) {
        if self.links.is_empty() && !self.cfg.seed.is_empty() {
            self.dial(self.cfg.seed.clone());
        }
        let unlinked = self
            .members
            .iter()
            .filter(|m| *m.key() != self.name && !self.links.contains_key(m.key()))
            .map(|m| m.value().clone())
            .collect::<Vec<_>>();
        for addr in unlinked {
            self.dial(addr);
        }

        for link in self.links.iter() {
            if let Some(peer) = self.peers.get(link.key()) {
                peer.touch();
            }
        }

        let mut members = self.members.iter().map(|m| (*m.key(), m.value().clone())).collect::<Vec<_>>();
        let advertise = self.advertise();
        if !advertise.is_empty() {
            members.push((self.name, advertise));
        }
        self.broadcast(&ClusterMessage::Members(members));
        self.broadcast(&ClusterMessage::Ping);

        self.gc_peers();
    }

    /// Drops peers silent for longer than [`PEER_TIMEOUT`] together with
    /// every subscription they contributed. Their events are removed from
    /// the state and the removals gossiped.
    fn gc_peers(&self) {
        let mut removed = LwwSet::new();
        {
            let mut state = self.state.lock();
            let stale = self.peers.iter().filter(|p| !p.is_active()).map(|p| p.value().clone()).collect::<Vec<_>>();
            for peer in stale {
                self.peers.remove(&peer.name());
                self.members.remove(&peer.name());
                peer.close();
                let counters = peer.subs.all();
                let sub = Subscriber::Remote(peer.clone());
                for c in counters.iter() {
                    self.trie.unsubscribe(&c.ssid, &sub);
                }

                let events = state
                    .iter()
                    .filter(|(ev, t)| ev.peer == peer.name() && t.is_added())
                    .map(|(ev, _)| ev.clone())
                    .collect::<Vec<_>>();
                for ev in events {
                    let t = state.remove(ev.clone());
                    removed.merge(&mut LwwSet::single(ev, t));
                }
                log::info!("peer {} is gone, {} subscriptions dropped", peer.name(), counters.len());
            }
        }
        if removed.is_empty() {
            return;
        }
        match bincode::serialize(&removed) {
            Ok(data) => self.broadcast(&ClusterMessage::GossipBroadcast(data)),
            Err(e) => log::warn!("subscription removals encode failed, {:?}", e),
        }
    }
}

#[async_trait]
impl Surveyor for Swarm {
    async fn query(&self, kind: &str, payload: Vec<u8>, deadline: Duration) -> Vec<Vec<u8>> {
        let expected = self.links.len();
        if expected == 0 {
            return Vec::new();
        }
        let mut survey = self.surveys.begin(expected);
        self.broadcast(&ClusterMessage::Survey { id: survey.id, kind: kind.into(), payload });
        survey.gather(expected, deadline).await
    }
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("name", &self.name)
            .field("links", &self.links.len())
            .field("peers", &self.peers.len())
            .field("members", &self.members.len())
            .finish()
    }
}
