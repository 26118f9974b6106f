use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::Storage;
use crate::cluster::{Surveyee, Surveyor};
use crate::conf::StorageConfig;
use crate::message::{decode_frame, encode_frame, Message, Ssid, WILDCARD};
use crate::task::spawn_periodic;
use crate::utils::{timestamp_nanos, Bytesize, TimestampNanos};
use crate::Result;

/// Survey kind answered by the memory store.
pub const SURVEY_KIND: &str = "memstore";

const SURVEY_DEADLINE: Duration = Duration::from_secs(2);
const SWEEP_INTERVAL: Duration = Duration::from_secs(3);

/// A lookup as sent to the other members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupQuery {
    pub ssid: Ssid,
    pub from: TimestampNanos,
    pub until: TimestampNanos,
    pub limit: usize,
}

/// TTL cache of recent messages.
///
/// Messages are filed under their trunk, the contract and first channel
/// part, with a per-trunk counter; cache keys read `"<trunk>:<index>"`.
pub struct InMemoryStorage {
    counters: scc::HashMap<String, u64>,
    cache: scc::HashMap<String, Message>,
    //insertion order, oldest first, pruned when over size
    order: Mutex<VecDeque<(String, TimestampNanos)>>,
    size: AtomicIsize,
    maxsize: usize,
    prune: usize,
    surveyor: OnceCell<Arc<dyn Surveyor>>,
}

#[inline]
fn trunk(ssid: &[u32]) -> Option<String> {
    match ssid {
        [contract, first, ..] => Some(format!("{:08x}{:08x}", contract, first)),
        _ => None,
    }
}

/// A query matches a stored ssid word by word, either side's wildcard
/// matching anything; a query longer than the ssid never matches.
#[inline]
fn matches(query: &[u32], ssid: &[u32]) -> bool {
    query.len() <= ssid.len() && query.iter().zip(ssid).all(|(q, s)| q == s || *q == WILDCARD || *s == WILDCARD)
}

impl InMemoryStorage {
    pub fn new(cfg: &StorageConfig) -> Self {
        Self {
            counters: scc::HashMap::new(),
            cache: scc::HashMap::new(),
            order: Mutex::new(VecDeque::new()),
            size: AtomicIsize::new(0),
            maxsize: cfg.maxsize.as_usize(),
            prune: cfg.prune,
            surveyor: OnceCell::new(),
        }
    }

    /// Starts the expiry sweeper, it stops with `token`.
    pub fn start(self, token: CancellationToken) -> Arc<Self> {
        let this = Arc::new(self);
        let storage = this.clone();
        spawn_periodic("memstore sweeper", SWEEP_INTERVAL, token, move || {
            let storage = storage.clone();
            async move { storage.sweep() }
        });
        this
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Bytes held, channel plus payload of every cached message.
    #[inline]
    pub fn size(&self) -> Bytesize {
        Bytesize(self.size.load(Ordering::SeqCst).max(0) as usize)
    }

    /// Local matches, newest first.
    pub fn lookup(&self, query: &[u32], from: TimestampNanos, until: TimestampNanos, limit: usize) -> Vec<Message> {
        let mut out = Vec::new();
        let Some(trunk) = trunk(query) else {
            return out;
        };
        let Some(last) = self.counters.read(&trunk, |_, n| *n) else {
            return out;
        };

        let now = timestamp_nanos();
        for index in (1..=last).rev() {
            if out.len() >= limit {
                break;
            }
            let msg = self.cache.read(&format!("{trunk}:{index}"), |_, m| m.clone());
            if let Some(msg) = msg {
                if msg.expires() > now && msg.time >= from && msg.time <= until && matches(query, &msg.ssid) {
                    out.push(msg);
                }
            }
        }
        out
    }

    fn remove(&self, key: &str) {
        if let Some((_, msg)) = self.cache.remove(key) {
            self.size.fetch_sub(msg.size() as isize, Ordering::SeqCst);
        }
    }

    /// Evicts the oldest messages, `prune` at a time, until under `maxsize`.
    fn prune(&self) -> bool {
        let mut pruned = false;
        while self.size.load(Ordering::SeqCst) > self.maxsize as isize {
            let keys: Vec<String> = {
                let mut order = self.order.lock();
                let n = self.prune.min(order.len());
                order.drain(..n).map(|(key, _)| key).collect()
            };
            if keys.is_empty() {
                break;
            }
            log::debug!("memstore over {:?}, pruning {} messages", Bytesize(self.maxsize), keys.len());
            for key in keys {
                self.remove(&key);
            }
            pruned = true;
        }
        pruned
    }

    /// Drops the counters of trunks with no message left.
    fn release_counters(&self) {
        let order = self.order.lock();
        let live: HashSet<&str> =
            order.iter().filter_map(|(key, _)| key.rsplit_once(':').map(|(trunk, _)| trunk)).collect();
        self.counters.retain(|trunk, _| live.contains(trunk.as_str()));
    }

    fn sweep(&self) {
        let now = timestamp_nanos();
        let mut expired = 0;
        self.cache.retain(|_, msg| {
            if msg.expires() > now {
                true
            } else {
                self.size.fetch_sub(msg.size() as isize, Ordering::SeqCst);
                expired += 1;
                false
            }
        });
        self.order.lock().retain(|(_, expires)| *expires > now);
        if self.prune() || expired > 0 {
            self.release_counters();
        }
        if expired > 0 {
            log::debug!("memstore removed {} expired messages, {} left", expired, self.cache.len());
        }
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    fn name(&self) -> &'static str {
        "inmemory"
    }

    async fn store(&self, mut msg: Message) -> Result<()> {
        if msg.ttl == 0 {
            return Ok(());
        }
        let trunk = trunk(&msg.ssid).ok_or_else(|| anyhow!("ssid {:?} has no channel part", msg.ssid))?;
        if msg.time == 0 {
            msg.time = timestamp_nanos();
        }

        //counters are released under the same lock
        let key = {
            let mut order = self.order.lock();
            let mut counter = self.counters.entry(trunk.clone()).or_insert(0);
            *counter.get_mut() += 1;
            let key = format!("{trunk}:{}", counter.get());
            order.push_back((key.clone(), msg.expires()));
            key
        };
        self.size.fetch_add(msg.size() as isize, Ordering::SeqCst);
        if let Err((key, _)) = self.cache.insert(key, msg) {
            log::warn!("memstore key {} already taken", key);
        }

        if self.prune() {
            self.release_counters();
        }
        Ok(())
    }

    async fn query(
        &self,
        ssid: &Ssid,
        from: TimestampNanos,
        until: TimestampNanos,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let mut out = self.lookup(ssid, from, until, limit);

        if let Some(surveyor) = self.surveyor.get() {
            let q = LookupQuery { ssid: ssid.clone(), from, until, limit };
            for reply in surveyor.query(SURVEY_KIND, bincode::serialize(&q)?, SURVEY_DEADLINE).await {
                match decode_frame(&reply) {
                    Ok(frame) => out.extend(frame),
                    Err(e) => log::warn!("memstore survey reply dropped, {:?}", e),
                }
            }
        }

        out.sort_by_key(|m| m.time);
        if out.len() > limit {
            out.drain(..out.len() - limit);
        }
        Ok(out)
    }

    fn attach(&self, surveyor: Arc<dyn Surveyor>) {
        if self.surveyor.set(surveyor).is_err() {
            log::warn!("memstore surveyor is already attached");
        }
    }
}

impl Surveyee for InMemoryStorage {
    fn on_survey(&self, kind: &str, payload: &[u8]) -> Option<Vec<u8>> {
        if kind != SURVEY_KIND {
            return None;
        }
        let q: LookupQuery = match bincode::deserialize(payload) {
            Ok(q) => q,
            Err(e) => {
                log::warn!("memstore survey query undecodable, {:?}", e);
                return None;
            }
        };
        if q.ssid.len() < 2 {
            return None;
        }
        let frame = self.lookup(&q.ssid, q.from, q.until, q.limit);
        match encode_frame(&frame) {
            Ok(data) => Some(data),
            Err(e) => {
                log::warn!("memstore survey reply encode failed, {:?}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    const W: u32 = WILDCARD;

    fn storage() -> InMemoryStorage {
        InMemoryStorage::new(&StorageConfig::default())
    }

    fn msg(ssid: &[u32], payload: &str, ttl: u32) -> Message {
        let mut m = Message::new(Ssid(ssid.to_vec()), Bytes::from_static(b"a/"), Bytes::from(payload.to_owned()));
        m.ttl = ttl;
        m
    }

    #[tokio::test]
    async fn wildcard_lookup() {
        let s = storage();
        for ssid in [[0, 1, 1, 1], [0, 1, 1, 2], [0, 1, 2, 1], [0, 1, 2, 2], [0, 1, 3, 1], [0, 1, 3, 2]] {
            s.store(msg(&ssid, "m", 60)).await.unwrap();
        }
        assert_eq!(s.len(), 6);

        let count = |q: &[u32]| s.lookup(q, 0, i64::MAX, 10).len();
        assert_eq!(count(&[0, 1, 1, 1]), 1);
        assert_eq!(count(&[0, 1, 1, W]), 2);
        assert_eq!(count(&[0, 1]), 6);
        assert_eq!(count(&[0, 2]), 0);
        assert_eq!(count(&[0, 1, 2]), 2);
        assert_eq!(count(&[0, 1, 2, 2, 9]), 0);
        assert_eq!(count(&[0]), 0);
        assert_eq!(s.lookup(&[0, 1], 0, i64::MAX, 4).len(), 4);
    }

    #[tokio::test]
    async fn newest_first_and_time_window() {
        let s = storage();
        for (i, t) in [100, 200, 300].into_iter().enumerate() {
            let mut m = msg(&[5, 6], &format!("m{i}"), 3600);
            m.time = timestamp_nanos() - 1_000_000 + t;
            s.store(m).await.unwrap();
        }
        let found = s.lookup(&[5, 6], 0, i64::MAX, 2);
        assert_eq!(found.iter().map(|m| m.payload.clone()).collect::<Vec<_>>(), vec!["m2", "m1"]);

        let newest = s.query(&Ssid(vec![5, 6]), 0, i64::MAX, 2).await.unwrap();
        assert_eq!(newest.iter().map(|m| m.payload.clone()).collect::<Vec<_>>(), vec!["m1", "m2"]);

        let first = found[1].time;
        assert_eq!(s.lookup(&[5, 6], 0, first, 10).len(), 2);
        assert_eq!(s.lookup(&[5, 6], first + 1, i64::MAX, 10).len(), 1);
    }

    #[tokio::test]
    async fn expired_messages_are_hidden_and_swept() {
        let s = storage();
        let mut old = msg(&[1, 2], "old", 1);
        old.time = timestamp_nanos() - 2_000_000_000;
        s.store(old).await.unwrap();
        s.store(msg(&[1, 2], "new", 60)).await.unwrap();
        s.store(msg(&[1, 2], "not stored", 0)).await.unwrap();

        let found = s.lookup(&[1, 2], 0, i64::MAX, 10);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload, "new");

        assert_eq!(s.len(), 2);
        s.sweep();
        assert_eq!(s.len(), 1);
        assert_eq!(s.size().as_usize(), 5);
        assert_eq!(s.order.lock().len(), 1);
    }

    #[tokio::test]
    async fn prunes_oldest_over_maxsize() {
        let s = InMemoryStorage::new(&StorageConfig { maxsize: Bytesize(100), prune: 2 });
        for i in 1..=10 {
            //2 bytes of channel plus 18 of payload
            s.store(msg(&[1, 2], &format!("{i:018}"), 60)).await.unwrap();
        }
        assert_eq!(s.size().as_usize(), 80);
        let left: Vec<_> = s.lookup(&[1, 2], 0, i64::MAX, 100).into_iter().map(|m| m.payload).collect();
        let expected: Vec<Bytes> = (7..=10).rev().map(|i| Bytes::from(format!("{i:018}"))).collect();
        assert_eq!(left, expected);
    }

    #[tokio::test]
    async fn counters_follow_live_trunks() {
        let s = storage();
        let mut old = msg(&[1, 2], "old", 1);
        old.time = timestamp_nanos() - 2_000_000_000;
        s.store(old).await.unwrap();
        s.store(msg(&[1, 3], "new", 60)).await.unwrap();
        assert_eq!(s.counters.len(), 2);

        s.sweep();
        assert_eq!(s.counters.len(), 1);
        assert!(s.counters.contains(&trunk(&[1, 3]).unwrap()));

        //a released trunk starts over
        s.store(msg(&[1, 2], "again", 60)).await.unwrap();
        assert_eq!(s.counters.read(&trunk(&[1, 2]).unwrap(), |_, n| *n), Some(1));
        assert_eq!(s.lookup(&[1, 2], 0, i64::MAX, 10).len(), 1);

        let small = InMemoryStorage::new(&StorageConfig { maxsize: Bytesize(30), prune: 1 });
        small.store(msg(&[1, 2], &"x".repeat(20), 60)).await.unwrap();
        small.store(msg(&[1, 3], &"y".repeat(20), 60)).await.unwrap();
        assert_eq!(small.len(), 1);
        assert_eq!(small.counters.len(), 1);
    }

    #[tokio::test]
    async fn rejects_ssid_without_channel() {
        let s = storage();
        assert!(s.store(msg(&[1], "x", 60)).await.is_err());
    }

    struct Remote(InMemoryStorage);

    #[async_trait]
    impl Surveyor for Remote {
        async fn query(&self, kind: &str, payload: Vec<u8>, _deadline: Duration) -> Vec<Vec<u8>> {
            self.0.on_survey(kind, &payload).into_iter().collect()
        }
    }

    #[tokio::test]
    async fn query_merges_survey_replies() {
        let remote = storage();
        let mut m = msg(&[1, 2, 3], "remote", 60);
        m.time = timestamp_nanos() - 1_000;
        remote.store(m).await.unwrap();

        assert!(remote.on_survey("presence", b"").is_none());
        assert!(remote.on_survey(SURVEY_KIND, b"garbage").is_none());
        let short = bincode::serialize(&LookupQuery { ssid: Ssid(vec![1]), from: 0, until: i64::MAX, limit: 1 }).unwrap();
        assert!(remote.on_survey(SURVEY_KIND, &short).is_none());

        let local = storage();
        local.store(msg(&[1, 2, 4], "local", 60)).await.unwrap();
        local.attach(Arc::new(Remote(remote)));

        let found = local.query(&Ssid(vec![1, 2]), 0, i64::MAX, 10).await.unwrap();
        assert_eq!(found.iter().map(|m| m.payload.clone()).collect::<Vec<_>>(), vec!["remote", "local"]);

        let one = local.query(&Ssid(vec![1, 2]), 0, i64::MAX, 1).await.unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].payload, "local");
    }
}
