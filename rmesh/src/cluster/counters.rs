use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::message::Ssid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Counter {
    pub ssid: Ssid,
    pub channel: Bytes,
    pub count: usize,
    /// Connection of the first subscriber, names the replicated event.
    pub conn: u64,
}

/// Reference counts of subscribers per SSID, so the first subscriber of an
/// SSID and the last one leaving are the only ones seen by the cluster.
#[derive(Debug, Default)]
pub struct SubscriptionCounters {
    inner: Mutex<HashMap<Ssid, Counter>>,
}

impl SubscriptionCounters {
    /// true when `ssid` went from 0 to 1 subscriber.
    pub fn increment(&self, ssid: &Ssid, channel: Bytes, conn: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.get_mut(ssid) {
            Some(c) => {
                c.count += 1;
                false
            }
            None => {
                inner.insert(ssid.clone(), Counter { ssid: ssid.clone(), channel, count: 1, conn });
                true
            }
        }
    }

    /// The removed counter when `ssid` went from 1 to 0 subscribers.
    pub fn decrement(&self, ssid: &Ssid) -> Option<Counter> {
        let mut inner = self.inner.lock();
        let c = inner.get_mut(ssid)?;
        c.count -= 1;
        if c.count == 0 {
            inner.remove(ssid)
        } else {
            None
        }
    }

    pub fn all(&self) -> Vec<Counter> {
        self.inner.lock().values().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
