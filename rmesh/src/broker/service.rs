use std::sync::Arc;

use bytes::Bytes;
use bytestring::ByteString;

use super::error::EventError;
use super::keygen::{KeyGenRequest, KeyGenResponse};
use super::subscriber::{ConnHandle, Subscriber};
use super::SERVICE_KEY;
use crate::codec::Publish;
use crate::context::ServerContext;
use crate::message::{Message, Ssid, WILDCARD};
use crate::security::{parse_channel, Channel, ChannelKind, ContractState, Key, Permissions};
use crate::utils::{timestamp_nanos, timestamp_secs};

const KEYGEN_CHANNEL: &str = "emitter/keygen/";

impl ServerContext {
    /// Parses `topic` and checks that its key grants `required` on the channel.
    pub fn authorize(&self, topic: &[u8], required: Permissions, wildcard: bool) -> Result<(Channel, Key), EventError> {
        let channel = parse_channel(topic);
        match channel.kind {
            ChannelKind::Invalid => return Err(EventError::BadRequest),
            ChannelKind::Wildcard if !wildcard => return Err(EventError::Forbidden),
            _ => {}
        }
        let key = self.decrypt_key(&channel.key)?;
        self.check_contract(&key)?;
        if !key.has_permission(required) || !key.validate_channel(&channel) {
            return Err(EventError::Unauthorized);
        }
        Ok((channel, key))
    }

    fn decrypt_key(&self, text: &[u8]) -> Result<Key, EventError> {
        let text = std::str::from_utf8(text).map_err(|_| EventError::Unauthorized)?;
        let key = self.cipher.decrypt_key(text).map_err(|_| EventError::Unauthorized)?;
        if key.is_expired(timestamp_secs()) {
            return Err(EventError::Unauthorized);
        }
        Ok(key)
    }

    fn check_contract(&self, key: &Key) -> Result<(), EventError> {
        let contract = self.contracts.get(key.contract()).ok_or(EventError::NotFound)?;
        if contract.state == ContractState::Refused {
            return Err(EventError::PaymentRequired);
        }
        if !contract.validate(key) {
            return Err(EventError::Unauthorized);
        }
        Ok(())
    }

    /// Handles a PUBLISH of connection `publisher`. Requests to the broker
    /// itself return the reply for the publisher.
    pub async fn publish(&self, publisher: u64, topic: &[u8], payload: Bytes) -> Result<Option<Publish>, EventError> {
        if parse_channel(topic).key == SERVICE_KEY.as_bytes() {
            return self.on_request(topic, &payload).map(Some);
        }

        let (channel, key) = self.authorize(topic, Permissions::WRITE, false)?;
        let mut msg = Message::new(channel.ssid(key.contract()), channel.channel.clone(), payload);
        if let Some(ttl) = channel.ttl() {
            if key.has_permission(Permissions::STORE) {
                msg.ttl = ttl;
                if let Err(e) = self.storage.store(msg.clone()).await {
                    log::warn!("{} failed to store {:?}, {:?}", self.storage.name(), msg, e);
                }
            }
        }

        let exclude = channel.exclude_me().then_some(publisher);
        for sub in self.trie.lookup(&msg.ssid) {
            if matches!(&sub, Subscriber::Local(c) if Some(c.id) == exclude) {
                continue;
            }
            if let Err(e) = sub.deliver(&msg) {
                log::debug!("message to {:?} dropped, {}", sub, e);
            }
        }
        Ok(None)
    }

    fn on_request(&self, topic: &[u8], payload: &[u8]) -> Result<Publish, EventError> {
        let channel = parse_channel(topic);
        match channel.channel.as_ref() {
            b"keygen/" => {
                let req: KeyGenRequest = serde_json::from_slice(payload).map_err(|_| EventError::BadRequest)?;
                let resp = serde_json::to_vec(&self.keygen(&req)?).map_err(|_| EventError::ServerError)?;
                Ok(Publish::at_most_once(ByteString::from_static(KEYGEN_CHANNEL), Bytes::from(resp)))
            }
            _ => Err(EventError::NotImplemented),
        }
    }

    /// Creates a key for `req.channel`, signed by the master key of the request.
    pub fn keygen(&self, req: &KeyGenRequest) -> Result<KeyGenResponse, EventError> {
        let master = self.decrypt_key(req.key.as_bytes())?;
        if !master.is_master() {
            return Err(EventError::Unauthorized);
        }
        self.check_contract(&master)?;

        let path = req.channel_path();
        let channel = parse_channel(format!("{}/{}", SERVICE_KEY, path).as_bytes());
        if !channel.is_valid() {
            return Err(EventError::BadRequest);
        }
        let permissions = req.permissions().ok_or(EventError::BadRequest)?;

        let mut key = Key::default();
        key.set_salt(rand::random());
        key.set_master(master.master());
        key.set_contract(master.contract());
        key.set_signature(master.signature());
        key.set_permissions(permissions);
        key.set_target(match channel.target() {
            WILDCARD => 0,
            target => target,
        });
        key.set_expires(req.expires(timestamp_secs()));
        Ok(KeyGenResponse { status: 200, key: self.cipher.encrypt_key(&key), channel: path })
    }

    /// Registers `conn` on `ssid`, the first local subscriber is announced
    /// to the cluster.
    pub fn subscribe(&self, conn: &Arc<ConnHandle>, ssid: &Ssid, channel: Bytes) {
        self.trie.subscribe(ssid, Subscriber::Local(conn.clone()));
        if self.counters.increment(ssid, channel, conn.id) {
            if let Some(swarm) = &self.swarm {
                swarm.notify_subscribe(conn.id, ssid);
            }
        }
    }

    pub fn unsubscribe(&self, conn: &Arc<ConnHandle>, ssid: &Ssid) {
        self.trie.unsubscribe(ssid, &Subscriber::Local(conn.clone()));
        if let Some(counter) = self.counters.decrement(ssid) {
            if let Some(swarm) = &self.swarm {
                swarm.notify_unsubscribe(counter.conn, ssid);
            }
        }
    }

    /// Up to `limit` stored messages of `ssid`, oldest first.
    pub async fn last_messages(&self, ssid: &Ssid, limit: usize) -> Vec<Message> {
        match self.storage.query(ssid, 0, timestamp_nanos(), limit).await {
            Ok(msgs) => msgs,
            Err(e) => {
                log::warn!("{} query of {:?} failed, {:?}", self.storage.name(), ssid, e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;
    use crate::security::License;
    use crate::store::Storage;

    async fn context(license: License) -> ServerContext {
        ServerContext::new(license).build().await.unwrap()
    }

    fn keygen(scx: &ServerContext, channel: &str, access: &str) -> String {
        let req = KeyGenRequest {
            key: scx.license.new_master_key(),
            channel: channel.into(),
            access: access.into(),
            ttl: 0,
        };
        scx.keygen(&req).unwrap().key
    }

    fn raw_key(scx: &ServerContext, f: impl FnOnce(&mut Key)) -> String {
        let mut key = Key::default();
        key.set_master(scx.license.master);
        key.set_contract(scx.license.contract);
        key.set_signature(scx.license.signature);
        key.set_permissions(Permissions::READ | Permissions::WRITE);
        f(&mut key);
        scx.cipher.encrypt_key(&key)
    }

    async fn publish(scx: &ServerContext, topic: String) -> Result<Option<Publish>, EventError> {
        scx.publish(1, topic.as_bytes(), Bytes::from_static(b"hi")).await
    }

    #[tokio::test]
    async fn publish_errors() {
        let scx = context(License::generate()).await;
        let key = keygen(&scx, "a/", "rw");

        assert_eq!(publish(&scx, format!("{}/a/b/c/", key)).await, Ok(None));
        assert_eq!(publish(&scx, format!("{}/a+q/b/c/", key)).await, Err(EventError::BadRequest));
        assert_eq!(publish(&scx, format!("{}/+/b/c/", key)).await, Err(EventError::Forbidden));
        assert_eq!(publish(&scx, "a/b/".into()).await, Err(EventError::Unauthorized));

        let expired = raw_key(&scx, |k| k.set_expires(Some(timestamp_secs() - 10)));
        assert_eq!(publish(&scx, format!("{}/a/", expired)).await, Err(EventError::Unauthorized));

        let stranger = raw_key(&scx, |k| k.set_contract(scx.license.contract.wrapping_add(1)));
        assert_eq!(publish(&scx, format!("{}/a/", stranger)).await, Err(EventError::NotFound));

        let forged = raw_key(&scx, |k| k.set_signature(scx.license.signature.wrapping_add(1)));
        assert_eq!(publish(&scx, format!("{}/a/", forged)).await, Err(EventError::Unauthorized));

        //read-only key and a key for another channel
        let reader = keygen(&scx, "a/", "r");
        assert_eq!(publish(&scx, format!("{}/a/", reader)).await, Err(EventError::Unauthorized));
        assert_eq!(publish(&scx, format!("{}/b/", key)).await, Err(EventError::Unauthorized));
        scx.close();
    }

    #[tokio::test]
    async fn refused_contract() {
        let mut license = License::generate();
        license.expires = 1;
        let scx = context(license).await;
        let key = raw_key(&scx, |_| {});
        assert_eq!(publish(&scx, format!("{}/a/", key)).await, Err(EventError::PaymentRequired));
        scx.close();
    }

    #[tokio::test]
    async fn keygen_requests() {
        let scx = context(License::generate()).await;
        let master = scx.license.new_master_key();

        let payload = serde_json::to_vec(&KeyGenRequest {
            key: master.clone(),
            channel: "a/b".into(),
            access: "rwsl".into(),
            ttl: 3600,
        })
        .unwrap();
        let reply = scx.publish(1, b"emitter/keygen/", Bytes::from(payload)).await.unwrap().unwrap();
        assert_eq!(reply.topic, KEYGEN_CHANNEL);
        let resp: KeyGenResponse = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.channel, "a/b/");
        let key = scx.cipher.decrypt_key(&resp.key).unwrap();
        assert_eq!(key.permissions(), Permissions::READ | Permissions::WRITE | Permissions::STORE | Permissions::LOAD);
        assert_eq!(key.target(), crate::security::hash_part(b"a"));
        assert!(key.expires().is_some());

        let any = scx
            .keygen(&KeyGenRequest { key: master.clone(), channel: "+/".into(), access: "r".into(), ttl: 0 })
            .unwrap();
        assert_eq!(scx.cipher.decrypt_key(&any.key).unwrap().target(), 0);

        //only a master key may generate keys
        let plain = keygen(&scx, "a/", "rw");
        let req = KeyGenRequest { key: plain, channel: "a/".into(), access: "r".into(), ttl: 0 };
        assert_eq!(scx.keygen(&req), Err(EventError::Unauthorized));
        let req = KeyGenRequest { key: master.clone(), channel: "a/".into(), access: "x".into(), ttl: 0 };
        assert_eq!(scx.keygen(&req), Err(EventError::BadRequest));
        let req = KeyGenRequest { key: master, channel: "a//".into(), access: "r".into(), ttl: 0 };
        assert_eq!(scx.keygen(&req), Err(EventError::BadRequest));

        let err = scx.publish(1, b"emitter/keygen/", Bytes::from_static(b"{")).await;
        assert_eq!(err, Err(EventError::BadRequest));
        let err = scx.publish(1, b"emitter/presence/", Bytes::new()).await;
        assert_eq!(err, Err(EventError::NotImplemented));
        scx.close();
    }

    struct BrokenStorage;

    #[async_trait::async_trait]
    impl Storage for BrokenStorage {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn store(&self, _msg: Message) -> crate::Result<()> {
            Err(anyhow::anyhow!("disk full"))
        }

        async fn query(&self, _: &Ssid, _: i64, _: i64, _: usize) -> crate::Result<Vec<Message>> {
            Err(anyhow::anyhow!("disk full"))
        }
    }

    impl crate::cluster::Surveyee for BrokenStorage {
        fn on_survey(&self, _kind: &str, _payload: &[u8]) -> Option<Vec<u8>> {
            None
        }
    }

    #[tokio::test]
    async fn delivers_when_store_fails() {
        let scx = ServerContext::new(License::generate())
            .storage_provider(Arc::new(BrokenStorage))
            .build()
            .await
            .unwrap();
        let key = keygen(&scx, "a/", "rwsl");
        let (channel, k) = scx.authorize(format!("{}/a/", key).as_bytes(), Permissions::READ, true).unwrap();
        let ssid = channel.ssid(k.contract());

        let (tx, mut rx) = mpsc::channel(8);
        let conn = Arc::new(ConnHandle::new(2, tx));
        scx.subscribe(&conn, &ssid, channel.channel);

        assert_eq!(publish(&scx, format!("{}/a/?ttl=60", key)).await, Ok(None));
        assert_eq!(rx.recv().await.unwrap().payload, "hi");
        assert!(scx.last_messages(&ssid, 10).await.is_empty());
        scx.close();
    }

    #[tokio::test]
    async fn delivery_and_storage() {
        let scx = context(License::generate()).await;
        let key = keygen(&scx, "a/", "rwsl");
        let (ssid, channel) = {
            let (channel, key) = scx.authorize(format!("{}/a/+/", key).as_bytes(), Permissions::READ, true).unwrap();
            (channel.ssid(key.contract()), channel.channel)
        };

        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let c1 = Arc::new(ConnHandle::new(1, tx1));
        let c2 = Arc::new(ConnHandle::new(2, tx2));
        scx.subscribe(&c1, &ssid, channel.clone());
        scx.subscribe(&c2, &ssid, channel);
        assert_eq!(scx.counters.len(), 1);

        publish(&scx, format!("{}/a/b/?ttl=60", key)).await.unwrap();
        assert_eq!(rx1.recv().await.unwrap().channel, "a/b/");
        assert_eq!(rx2.recv().await.unwrap().payload, "hi");

        //me=0 skips the publisher
        scx.publish(1, format!("{}/a/c/?me=0", key).as_bytes(), Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(rx2.recv().await.unwrap().payload, "x");
        assert!(rx1.try_recv().is_err());

        let stored = scx.last_messages(&ssid, 10).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].ttl, 60);

        scx.unsubscribe(&c1, &ssid);
        scx.unsubscribe(&c2, &ssid);
        assert!(scx.counters.is_empty());
        assert!(scx.trie.is_empty());
        scx.close();
    }
}
