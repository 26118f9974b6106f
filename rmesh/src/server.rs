//! Client listeners.
//!
//! Every accepted socket gets its own task which runs the transport
//! handshake and then [`conn::process`](crate::broker::conn::process).
//! A plain TCP listener also serves WebSocket clients on the same port
//! when the `ws` feature is on, telling them apart by the first byte.
//!
//! ```rust,no_run
//! use rmesh::context::ServerContext;
//! use rmesh::net::{Builder, Result};
//! use rmesh::security::License;
//! use rmesh::server::MqttServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let scx = ServerContext::new(License::generate()).build().await?;
//!     MqttServer::new(scx)
//!         .listener(Builder::new().name("external/tcp").laddr(([0, 0, 0, 0], 8080).into()).bind()?.tcp()?)
//!         .build()
//!         .run()
//!         .await
//! }
//! ```

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::broker::conn;
use crate::context::ServerContext;
use crate::net::{Acceptor, Dispatcher, Listener, ListenerType, Result};

pub struct MqttServerBuilder {
    scx: ServerContext,
    listeners: Vec<Listener>,
}

impl MqttServerBuilder {
    fn new(scx: ServerContext) -> Self {
        Self { scx, listeners: Vec::default() }
    }

    pub fn listener(mut self, listen: Listener) -> Self {
        self.listeners.push(listen);
        self
    }

    pub fn build(self) -> MqttServer {
        MqttServer { inner: Arc::new(MqttServerInner { scx: self.scx, listeners: self.listeners }) }
    }
}

#[derive(Clone)]
pub struct MqttServer {
    inner: Arc<MqttServerInner>,
}

pub struct MqttServerInner {
    scx: ServerContext,
    listeners: Vec<Listener>,
}

impl Deref for MqttServer {
    type Target = MqttServerInner;
    #[inline]
    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl MqttServer {
    #[allow(clippy::new_ret_no_self)]
    pub fn new(scx: ServerContext) -> MqttServerBuilder {
        MqttServerBuilder::new(scx)
    }

    /// Runs the server in a background task, exiting the process when it fails.
    pub fn start(self) {
        tokio::spawn(async move {
            if let Err(e) = self.run().await {
                log::error!("failed to start the server, {e}");
                std::process::exit(1);
            }
        });
    }

    /// Serves every listener until the context is closed.
    pub async fn run(self) -> Result<()> {
        let token = self.scx.token.clone();
        let listeners = self.listeners.iter().map(|l| {
            log::info!("{} listening on {} ({:?})", l.cfg.name, l.local_addr(), l.typ);
            accept_loop(self.scx.clone(), l)
        });
        tokio::select! {
            _ = futures::future::join_all(listeners) => {}
            _ = token.cancelled() => log::info!("listeners stopped"),
        }
        Ok(())
    }
}

async fn accept_loop(scx: ServerContext, l: &Listener) {
    loop {
        match l.accept().await {
            Ok(accept) => {
                tokio::spawn(handshake(scx.clone(), accept, l.typ));
            }
            Err(e) => {
                log::info!("{} accept failed, {e:?}", l.cfg.name);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Runs the transport handshake of one accepted socket, then the session.
async fn handshake(scx: ServerContext, accept: Acceptor<TcpStream>, typ: ListenerType) {
    let remote_addr = accept.remote_addr;
    log::debug!("{typ:?} connection from {remote_addr}");
    let res = match typ {
        #[cfg(feature = "ws")]
        ListenerType::TCP => match accept.is_websocket().await {
            Ok(true) => accept.ws().await.map(|d| serve(scx, d, "WebSocket").boxed()),
            Ok(false) => accept.tcp().map(|d| serve(scx, d, "TCP").boxed()),
            Err(e) => {
                log::debug!("connection from {remote_addr} closed early, {e:?}");
                return;
            }
        },
        #[cfg(not(feature = "ws"))]
        ListenerType::TCP => accept.tcp().map(|d| serve(scx, d, "TCP").boxed()),
        #[cfg(feature = "tls")]
        ListenerType::TLS => accept.tls().await.map(|d| serve(scx, d, "TLS").boxed()),
        #[cfg(feature = "ws")]
        ListenerType::WS => accept.ws().await.map(|d| serve(scx, d, "WebSocket").boxed()),
        #[cfg(all(feature = "tls", feature = "ws"))]
        ListenerType::WSS => accept.wss().await.map(|d| serve(scx, d, "WSS").boxed()),
    };
    match res {
        Ok(session) => session.await,
        Err(e) => log::warn!("{typ:?} handshake with {remote_addr} failed, {e:?}"),
    }
}

async fn serve<Io>(scx: ServerContext, d: Dispatcher<Io>, transport: &'static str)
where
    Io: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote_addr = d.remote_addr;
    if let Err(e) = conn::process(scx, d.mqtt()).await {
        log::info!("{transport} connection from {remote_addr} failed, {e:?}");
    }
}

#[cfg(test)]
mod tests {
    use bytestring::ByteString;

    use super::*;
    use crate::codec::{Connect, ConnectAckReason, Packet};
    use crate::net::Builder;
    use crate::security::License;

    #[tokio::test]
    async fn accepts_mqtt_over_tcp() {
        let scx = ServerContext::new(License::generate()).build().await.unwrap();
        let l = Builder::new().name("test/tcp").laddr(([127, 0, 0, 1], 0).into()).bind().unwrap().tcp().unwrap();
        let addr = l.local_addr();
        let cfg = l.cfg.clone();
        MqttServer::new(scx.clone()).listener(l).build().start();

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut client = Dispatcher::new(socket, addr, cfg).mqtt();
        let connect = Connect {
            clean_session: true,
            keep_alive: 30,
            client_id: ByteString::from_static("tcp-client"),
            ..Default::default()
        };
        client.send_connect(connect).await.unwrap();
        match client.recv(Duration::from_secs(5)).await.unwrap() {
            Some(Packet::ConnectAck(ack)) => assert_eq!(ack.return_code, ConnectAckReason::ConnectionAccepted),
            other => panic!("unexpected {:?}", other),
        }
        client.send(Packet::PingRequest).await.unwrap();
        assert_eq!(client.recv(Duration::from_secs(5)).await.unwrap(), Some(Packet::PingResponse));

        scx.close();
        assert_eq!(client.recv(Duration::from_secs(5)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn drops_anonymous_persistent_session() {
        let scx = ServerContext::new(License::generate()).build().await.unwrap();
        let l = Builder::new().name("test/tcp").laddr(([127, 0, 0, 1], 0).into()).bind().unwrap().tcp().unwrap();
        let addr = l.local_addr();
        let cfg = l.cfg.clone();
        MqttServer::new(scx.clone()).listener(l).build().start();

        let socket = TcpStream::connect(addr).await.unwrap();
        let mut client = Dispatcher::new(socket, addr, cfg).mqtt();
        //an empty client id needs a clean session
        client.send_connect(Connect { keep_alive: 30, ..Default::default() }).await.unwrap();
        assert!(!matches!(client.recv(Duration::from_secs(5)).await, Ok(Some(Packet::ConnectAck(_)))));
        scx.close();
    }
}
