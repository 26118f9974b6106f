use std::future::Future;
use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use rmesh_codec::error::EncodeError;
use rmesh_codec::{Connect, ConnectAck, ConnectAckReason, MqttCodec, Packet, Publish, SubscribeReturnCode};

use crate::error::MqttError;
use crate::{Builder, Error, Result};

/// A transport that finished its handshake and is ready for MQTT framing.
pub struct Dispatcher<Io> {
    io: Io,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> Dispatcher<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        Dispatcher { io, remote_addr, cfg }
    }

    #[inline]
    pub fn mqtt(self) -> MqttStream<Io> {
        let codec = MqttCodec::new(self.cfg.max_packet_size);
        MqttStream { io: Framed::new(self.io, codec), remote_addr: self.remote_addr, cfg: self.cfg }
    }
}

pub struct MqttStream<Io> {
    pub io: Framed<Io, MqttCodec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> MqttStream<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub async fn send_connect(&mut self, connect: Connect) -> Result<()> {
        self.send(Packet::Connect(Box::new(connect))).await
    }

    #[inline]
    pub async fn send_connect_ack(&mut self, return_code: ConnectAckReason, session_present: bool) -> Result<()> {
        self.send(Packet::ConnectAck(ConnectAck { session_present, return_code })).await
    }

    #[inline]
    pub async fn send_publish(&mut self, publish: Publish) -> Result<()> {
        self.send(Packet::Publish(publish)).await
    }

    #[inline]
    pub async fn send_publish_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::PublishAck { packet_id }).await
    }

    #[inline]
    pub async fn send_subscribe_ack(
        &mut self,
        packet_id: NonZeroU16,
        status: Vec<SubscribeReturnCode>,
    ) -> Result<()> {
        self.send(Packet::SubscribeAck { packet_id, status }).await
    }

    #[inline]
    pub async fn send_unsubscribe_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        self.send(Packet::UnsubscribeAck { packet_id }).await
    }

    #[inline]
    pub async fn send_ping_response(&mut self) -> Result<()> {
        self.send(Packet::PingResponse).await
    }

    /// Encodes and flushes one packet.
    #[inline]
    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        let tm = self.cfg.send_timeout;
        within(tm, self.io.send(packet), MqttError::WriteTimeout).await
    }

    /// Encodes one packet into the write buffer without flushing.
    #[inline]
    pub async fn feed(&mut self, packet: Packet) -> Result<()> {
        let tm = self.cfg.send_timeout;
        within(tm, self.io.feed(packet), MqttError::WriteTimeout).await
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<()> {
        let tm = self.cfg.send_timeout;
        within(tm, self.io.flush(), MqttError::FlushTimeout).await
    }

    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        let tm = self.cfg.send_timeout;
        within(tm, self.io.close(), MqttError::CloseTimeout).await
    }

    #[inline]
    pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
        match tokio::time::timeout(tm, self.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(msg)),
            Ok(Some(Err(e))) => Err(e),
            Ok(None) => Ok(None),
            Err(_) => Err(MqttError::ReadTimeout.into()),
        }
    }

    /// Waits for the CONNECT packet that must open every session.
    #[inline]
    pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
        match self.recv(tm).await? {
            Some(Packet::Connect(connect)) => Ok(connect),
            Some(_) => Err(MqttError::UnexpectedPacket("CONNECT").into()),
            None => Err(MqttError::Disconnected.into()),
        }
    }
}

impl<Io> futures::Stream for MqttStream<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Packet>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let next = Pin::new(&mut self.io).poll_next(cx);
        Poll::Ready(match futures::ready!(next) {
            Some(Ok((packet, _))) => Some(Ok(packet)),
            Some(Err(e)) => Some(Err(Error::from(MqttError::Decode(e)))),
            None => None,
        })
    }
}

/// Drives a sink operation, bounded by `tm` unless it is zero.
async fn within<F>(tm: Duration, fut: F, elapsed: MqttError) -> Result<()>
where
    F: Future<Output = std::result::Result<(), EncodeError>>,
{
    let res = if tm.is_zero() {
        fut.await
    } else {
        tokio::time::timeout(tm, fut).await.map_err(|_| elapsed)?
    };
    res.map_err(|e| MqttError::Encode(e).into())
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use bytestring::ByteString;
    use rmesh_codec::QoS;

    use super::*;

    fn pair() -> (MqttStream<tokio::io::DuplexStream>, MqttStream<tokio::io::DuplexStream>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let cfg = Arc::new(Builder::new());
        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        (Dispatcher::new(a, addr, cfg.clone()).mqtt(), Dispatcher::new(b, addr, cfg).mqtt())
    }

    #[tokio::test]
    async fn connect_handshake() {
        let (mut client, mut server) = pair();
        client.send_connect(Connect { clean_session: true, keep_alive: 30, ..Default::default() }).await.unwrap();

        let connect = server.recv_connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(connect.keep_alive, 30);
        server.send_connect_ack(ConnectAckReason::ConnectionAccepted, false).await.unwrap();

        match client.recv(Duration::from_secs(1)).await.unwrap() {
            Some(Packet::ConnectAck(ack)) => assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn recv_connect_rejects_other_packets() {
        let (mut client, mut server) = pair();
        client.send(Packet::PingRequest).await.unwrap();
        let err = server.recv_connect(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<MqttError>(), Some(MqttError::UnexpectedPacket(_))));
    }

    #[tokio::test]
    async fn recv_times_out() {
        let (_client, mut server) = pair();
        let err = server.recv(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err.downcast_ref::<MqttError>(), Some(MqttError::ReadTimeout)));
    }

    #[tokio::test]
    async fn feed_then_flush() {
        let (mut client, mut server) = pair();
        for i in 0..3u8 {
            server
                .feed(Packet::Publish(Publish::at_most_once(
                    ByteString::from_static("key/a/"),
                    Bytes::from(vec![i]),
                )))
                .await
                .unwrap();
        }
        server.flush().await.unwrap();
        for i in 0..3u8 {
            match client.recv(Duration::from_secs(1)).await.unwrap() {
                Some(Packet::Publish(p)) => {
                    assert_eq!(p.qos, QoS::AtMostOnce);
                    assert_eq!(p.payload.as_ref(), &[i]);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        server.close().await.unwrap();
        assert!(client.recv(Duration::from_secs(1)).await.unwrap().is_none());
    }
}
