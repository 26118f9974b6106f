//! One task per client connection: CONNECT handshake, then a loop over
//! inbound packets, messages queued for the client and the keep-alive timer.

use std::collections::HashMap;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::error::EventError;
use super::subscriber::ConnHandle;
use super::ERROR_CHANNEL;
use crate::codec::{ConnectAckReason, Packet, Publish, QoS, SubscribeReturnCode};
use crate::context::ServerContext;
use crate::message::{Message, Ssid};
use crate::net::{MqttError, MqttStream};
use crate::security::Permissions;
use crate::Result;

const MAX_BATCH: usize = 64;

/// Serves one client until it disconnects, fails or the broker shuts down.
pub async fn process<Io>(scx: ServerContext, mut sink: MqttStream<Io>) -> Result<()>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let connect = sink.recv_connect(sink.cfg.handshake_timeout).await?;
    sink.send_connect_ack(ConnectAckReason::ConnectionAccepted, false).await?;

    let (tx, rx) = mpsc::channel(scx.limits.queue_len.max(1));
    let mut conn = Connection::new(scx, tx);
    log::debug!(
        "connection {} from {}, client id {:?}, keep alive {}s",
        conn.id(),
        sink.remote_addr,
        connect.client_id,
        connect.keep_alive
    );

    let res = conn.run(&mut sink, rx, connect.keep_alive).await;
    conn.close();
    let _ = sink.close().await;
    match res {
        Ok(()) => {
            log::debug!("connection {} closed", conn.id());
            Ok(())
        }
        Err(e) if e.downcast_ref::<MqttError>().is_some_and(MqttError::is_expected) => {
            log::debug!("connection {} closed, {}", conn.id(), e);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

struct Connection {
    scx: ServerContext,
    handle: Arc<ConnHandle>,
    subs: HashMap<Ssid, Bytes>,
}

impl Connection {
    fn new(scx: ServerContext, tx: mpsc::Sender<Message>) -> Self {
        let handle = Arc::new(ConnHandle::new(scx.next_conn_id(), tx));
        Self { scx, handle, subs: HashMap::new() }
    }

    #[inline]
    fn id(&self) -> u64 {
        self.handle.id
    }

    async fn run<Io>(&mut self, sink: &mut MqttStream<Io>, mut rx: mpsc::Receiver<Message>, keep_alive: u16) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let keep_alive_interval = if keep_alive == 0 {
            Duration::from_secs(u32::MAX as u64)
        } else {
            Duration::from_millis(keep_alive as u64 * 1500)
        };
        let keep_alive_delay = tokio::time::sleep(keep_alive_interval);
        tokio::pin!(keep_alive_delay);

        loop {
            tokio::select! {
                _ = &mut keep_alive_delay => {
                    return Err(MqttError::KeepAliveTimeout.into());
                }

                _ = self.scx.token.cancelled() => {
                    return Ok(());
                }

                msg = rx.recv() => match msg {
                    Some(msg) => {
                        sink.feed(Packet::Publish(to_publish(msg))).await?;
                        for _ in 1..MAX_BATCH {
                            match rx.try_recv() {
                                Ok(msg) => sink.feed(Packet::Publish(to_publish(msg))).await?,
                                Err(_) => break,
                            }
                        }
                        sink.flush().await?;
                    }
                    None => return Ok(()),
                },

                pkt = sink.next() => {
                    keep_alive_delay.as_mut().reset(Instant::now() + keep_alive_interval);
                    match pkt {
                        Some(Ok(pkt)) => {
                            if !self.on_packet(sink, pkt).await? {
                                return Ok(());
                            }
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Err(MqttError::Disconnected.into()),
                    }
                }
            }
        }
    }

    /// false once the client asked to disconnect.
    async fn on_packet<Io>(&mut self, sink: &mut MqttStream<Io>, pkt: Packet) -> Result<bool>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match pkt {
            Packet::Publish(publish) => {
                match self.scx.publish(self.id(), publish.topic.as_bytes(), publish.payload).await {
                    Ok(Some(reply)) => sink.send_publish(reply).await?,
                    Ok(None) => {}
                    Err(e) => self.notify_error(sink, e).await?,
                }
                if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
                    sink.send_publish_ack(packet_id).await?;
                }
            }
            Packet::Subscribe { packet_id, topic_filters } => self.on_subscribe(sink, packet_id, topic_filters).await?,
            Packet::Unsubscribe { packet_id, topic_filters } => {
                for topic in topic_filters {
                    if let Err(e) = self.on_unsubscribe(&topic) {
                        self.notify_error(sink, e).await?;
                    }
                }
                sink.send_unsubscribe_ack(packet_id).await?;
            }
            Packet::PingRequest => sink.send_ping_response().await?,
            Packet::Disconnect => return Ok(false),
            Packet::Connect(_) => return Err(MqttError::UnexpectedPacket("no second CONNECT").into()),
            other => log::debug!("connection {} ignores {:?}", self.id(), other),
        }
        Ok(true)
    }

    async fn on_subscribe<Io>(
        &mut self,
        sink: &mut MqttStream<Io>,
        packet_id: NonZeroU16,
        topic_filters: Vec<(ByteString, QoS)>,
    ) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut status = Vec::with_capacity(topic_filters.len());
        let mut replay = Vec::new();
        let mut errors = Vec::new();
        for (topic, qos) in topic_filters {
            let (channel, key) = match self.scx.authorize(topic.as_bytes(), Permissions::READ, true) {
                Ok(authorized) => authorized,
                Err(e) => {
                    status.push(SubscribeReturnCode::Failure);
                    errors.push(e);
                    continue;
                }
            };
            let ssid = channel.ssid(key.contract());
            if !self.subs.contains_key(&ssid) {
                self.scx.subscribe(&self.handle, &ssid, channel.channel.clone());
                self.subs.insert(ssid.clone(), channel.channel.clone());
            }
            if let Some(last) = channel.last() {
                if key.has_permission(Permissions::LOAD) {
                    replay.extend(self.scx.last_messages(&ssid, last).await);
                }
            }
            status.push(SubscribeReturnCode::Success(qos));
        }

        sink.send_subscribe_ack(packet_id, status).await?;
        for e in errors {
            self.notify_error(sink, e).await?;
        }
        if !replay.is_empty() {
            for msg in replay {
                sink.feed(Packet::Publish(to_publish(msg))).await?;
            }
            sink.flush().await?;
        }
        Ok(())
    }

    fn on_unsubscribe(&mut self, topic: &ByteString) -> std::result::Result<(), EventError> {
        let (channel, key) = self.scx.authorize(topic.as_bytes(), Permissions::READ, true)?;
        let ssid = channel.ssid(key.contract());
        if self.subs.remove(&ssid).is_some() {
            self.scx.unsubscribe(&self.handle, &ssid);
        }
        Ok(())
    }

    async fn notify_error<Io>(&self, sink: &mut MqttStream<Io>, e: EventError) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        log::debug!("connection {} request failed, {} {}", self.id(), e.status(), e);
        sink.send_publish(Publish::at_most_once(ByteString::from_static(ERROR_CHANNEL), e.to_payload())).await
    }

    /// Drops every subscription, announcing the last local ones.
    fn close(&mut self) {
        for (ssid, _) in self.subs.drain() {
            self.scx.unsubscribe(&self.handle, &ssid);
        }
    }
}

#[inline]
fn to_publish(msg: Message) -> Publish {
    let topic = match ByteString::try_from(msg.channel.clone()) {
        Ok(topic) => topic,
        Err(_) => ByteString::from(String::from_utf8_lossy(&msg.channel).into_owned()),
    };
    Publish::at_most_once(topic, msg.payload)
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::DuplexStream;

    use super::*;
    use crate::broker::KeyGenRequest;
    use crate::codec::Connect;
    use crate::net::{Builder, Dispatcher};
    use crate::security::License;

    struct Client {
        stream: MqttStream<DuplexStream>,
    }

    impl Client {
        async fn connect(scx: &ServerContext) -> Client {
            let (a, b) = tokio::io::duplex(64 * 1024);
            let cfg = Arc::new(Builder::new());
            let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
            let server = Dispatcher::new(b, addr, cfg.clone()).mqtt();
            let scx = scx.clone();
            tokio::spawn(async move { process(scx, server).await });

            let mut stream = Dispatcher::new(a, addr, cfg).mqtt();
            stream.send_connect(Connect { clean_session: true, keep_alive: 60, ..Default::default() }).await.unwrap();
            match stream.recv(Duration::from_secs(5)).await.unwrap() {
                Some(Packet::ConnectAck(ack)) => assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted),
                other => panic!("unexpected {:?}", other),
            }
            Client { stream }
        }

        async fn recv(&mut self) -> Packet {
            self.stream.recv(Duration::from_secs(5)).await.unwrap().unwrap()
        }

        async fn publish(&mut self, topic: String, payload: &'static [u8]) {
            let p = Publish::at_most_once(ByteString::from(topic), Bytes::from_static(payload));
            self.stream.send_publish(p).await.unwrap();
        }

        async fn subscribe(&mut self, topics: &[String]) -> Vec<SubscribeReturnCode> {
            let topic_filters = topics.iter().map(|t| (ByteString::from(t.clone()), QoS::AtMostOnce)).collect();
            let packet_id = NonZeroU16::new(1).unwrap();
            self.stream.send(Packet::Subscribe { packet_id, topic_filters }).await.unwrap();
            match self.recv().await {
                Packet::SubscribeAck { status, .. } => status,
                other => panic!("unexpected {:?}", other),
            }
        }

        async fn recv_publish(&mut self) -> Publish {
            match self.recv().await {
                Packet::Publish(p) => p,
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    async fn setup() -> (ServerContext, String) {
        let scx = ServerContext::new(License::generate()).build().await.unwrap();
        let req = KeyGenRequest {
            key: scx.license.new_master_key(),
            channel: "a/".into(),
            access: "rwsl".into(),
            ttl: 0,
        };
        let key = scx.keygen(&req).unwrap().key;
        (scx, key)
    }

    #[tokio::test]
    async fn publish_subscribe() {
        let (scx, key) = setup().await;
        let mut sub = Client::connect(&scx).await;
        let mut publisher = Client::connect(&scx).await;

        let status = sub.subscribe(&[format!("{}/a/b/c/", key)]).await;
        assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtMostOnce)]);
        assert_eq!(scx.trie.count(), 1);
        assert_eq!(scx.counters.len(), 1);

        publisher.publish(format!("{}/a/b/c/", key), b"hello").await;
        let p = sub.recv_publish().await;
        assert_eq!(p.topic, "a/b/c/");
        assert_eq!(p.payload.as_ref(), b"hello");

        publisher.stream.send(Packet::PingRequest).await.unwrap();
        assert_eq!(publisher.recv().await, Packet::PingResponse);

        sub.stream.send(Packet::Disconnect).await.unwrap();
        assert!(sub.stream.recv(Duration::from_secs(5)).await.unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(scx.counters.is_empty());
        assert!(scx.trie.is_empty());
        scx.close();
    }

    #[tokio::test]
    async fn errors_are_published() {
        let (scx, key) = setup().await;
        let mut client = Client::connect(&scx).await;

        client.publish(format!("{}/+/b/", key), b"x").await;
        let p = client.recv_publish().await;
        assert_eq!(p.topic, ERROR_CHANNEL);
        let v: serde_json::Value = serde_json::from_slice(&p.payload).unwrap();
        assert_eq!(v["status"], 403);

        let status = client.subscribe(&[format!("{}/a/", key), "bad/a+/".to_string()]).await;
        assert_eq!(status, vec![SubscribeReturnCode::Success(QoS::AtMostOnce), SubscribeReturnCode::Failure]);
        let p = client.recv_publish().await;
        let v: serde_json::Value = serde_json::from_slice(&p.payload).unwrap();
        assert_eq!(v["status"], 400);

        //the connection keeps serving after errors
        client.publish(format!("{}/a/", key), b"still here").await;
        assert_eq!(client.recv_publish().await.payload.as_ref(), b"still here");
        scx.close();
    }

    #[tokio::test]
    async fn last_messages_are_replayed() {
        let (scx, key) = setup().await;
        let mut publisher = Client::connect(&scx).await;
        for payload in [&b"1"[..], b"2", b"3"] {
            publisher.publish(format!("{}/a/b/?ttl=60", key), payload).await;
            publisher.stream.send(Packet::PingRequest).await.unwrap();
            assert_eq!(publisher.recv().await, Packet::PingResponse);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut sub = Client::connect(&scx).await;
        sub.subscribe(&[format!("{}/a/+/?last=2", key)]).await;
        assert_eq!(sub.recv_publish().await.payload.as_ref(), b"2");
        assert_eq!(sub.recv_publish().await.payload.as_ref(), b"3");
        scx.close();
    }

    #[tokio::test]
    async fn keygen_reply() {
        let (scx, _) = setup().await;
        let mut client = Client::connect(&scx).await;
        let req = serde_json::json!({"key": scx.license.new_master_key(), "channel": "b/", "type": "r"});
        let p = Publish::at_most_once(ByteString::from_static("emitter/keygen/"), Bytes::from(req.to_string()));
        client.stream.send_publish(p).await.unwrap();
        let p = client.recv_publish().await;
        assert_eq!(p.topic, "emitter/keygen/");
        let v: serde_json::Value = serde_json::from_slice(&p.payload).unwrap();
        assert_eq!(v["status"], 200);
        assert_eq!(v["channel"], "b/");
        scx.close();
    }
}
