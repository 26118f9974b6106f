use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use socket2::{Domain, SockAddr, Socket, Type};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

#[cfg(feature = "tls")]
#[cfg(not(target_os = "windows"))]
use rustls::crypto::aws_lc_rs as provider;
#[cfg(feature = "tls")]
#[cfg(target_os = "windows")]
use rustls::crypto::ring as provider;
#[cfg(feature = "tls")]
use rustls::pki_types::pem::PemObject;
#[cfg(feature = "tls")]
use tokio_rustls::{server::TlsStream, TlsAcceptor};

#[cfg(feature = "ws")]
use tokio_tungstenite::accept_hdr_async;
#[cfg(feature = "ws")]
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::stream::Dispatcher;
#[cfg(feature = "ws")]
use crate::ws::WsStream;
use crate::{Error, MqttError, Result};

/// Subprotocols accepted on the WebSocket upgrade, in order of preference.
#[cfg(feature = "ws")]
const WS_SUBPROTOCOLS: [&str; 2] = ["mqtt", "mqttv3.1"];

/// Listener settings, shared by every connection accepted on it.
#[derive(Clone, Debug)]
pub struct Builder {
    /// Listener name, used in logs.
    pub name: String,
    pub laddr: SocketAddr,
    /// Length of the pending connection queue.
    pub backlog: i32,
    pub reuseaddr: Option<bool>,
    pub reuseport: Option<bool>,
    /// Maximum accepted MQTT packet size, 0 means unlimited.
    pub max_packet_size: u32,
    /// Time allowed for the TLS/WebSocket handshake and the CONNECT packet.
    pub handshake_timeout: Duration,
    /// Time allowed for one write, 0 disables the limit.
    pub send_timeout: Duration,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            name: String::new(),
            laddr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backlog: 1024,
            reuseaddr: None,
            reuseport: None,
            max_packet_size: 1024 * 1024,
            handshake_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Builder {
    #[inline]
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn name<N: Into<String>>(mut self, name: N) -> Self {
        self.name = name.into();
        self
    }

    pub fn laddr(mut self, laddr: SocketAddr) -> Self {
        self.laddr = laddr;
        self
    }

    pub fn reuseaddr(mut self, reuseaddr: Option<bool>) -> Self {
        self.reuseaddr = reuseaddr;
        self
    }

    pub fn reuseport(mut self, reuseport: Option<bool>) -> Self {
        self.reuseport = reuseport;
        self
    }

    pub fn max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    pub fn handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    pub fn send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    pub fn tls_cert<N: Into<String>>(mut self, tls_cert: Option<N>) -> Self {
        self.tls_cert = tls_cert.map(Into::into);
        self
    }

    pub fn tls_key<N: Into<String>>(mut self, tls_key: Option<N>) -> Self {
        self.tls_key = tls_key.map(Into::into);
        self
    }

    /// Opens the listening socket, a plain TCP listener until converted.
    pub fn bind(self) -> Result<Listener> {
        let socket = Socket::new(Domain::for_address(self.laddr), Type::STREAM, None)?;
        socket.set_nonblocking(true)?;
        #[cfg(unix)]
        {
            if let Some(on) = self.reuseaddr {
                socket.set_reuse_address(on)?;
            }
            if let Some(on) = self.reuseport {
                socket.set_reuse_port(on)?;
            }
        }
        socket.bind(&SockAddr::from(self.laddr))?;
        socket.listen(self.backlog)?;

        let tcp_listener = TcpListener::from_std(socket.into())?;
        let local_addr = tcp_listener.local_addr()?;
        log::debug!("{} bound to {}", self.name, local_addr);
        Ok(Listener {
            typ: ListenerType::TCP,
            cfg: Arc::new(self),
            local_addr,
            tcp_listener,
            #[cfg(feature = "tls")]
            tls_acceptor: None,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ListenerType {
    TCP,
    #[cfg(feature = "tls")]
    TLS,
    #[cfg(feature = "ws")]
    WS,
    #[cfg(feature = "tls")]
    #[cfg(feature = "ws")]
    WSS,
}

pub struct Listener {
    pub typ: ListenerType,
    pub cfg: Arc<Builder>,
    local_addr: SocketAddr,
    tcp_listener: TcpListener,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<TlsAcceptor>,
}

impl Listener {
    /// The bound address, with the real port when bound to port 0.
    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tcp(self) -> Result<Self> {
        if self.typ != ListenerType::TCP {
            return Err(anyhow!("{:?} listener can not be turned back into TCP", self.typ));
        }
        Ok(self)
    }

    #[cfg(feature = "ws")]
    pub fn ws(mut self) -> Result<Self> {
        match self.typ {
            ListenerType::TCP | ListenerType::WS => self.typ = ListenerType::WS,
            _ => return Err(anyhow!("{:?} listener can not be turned into WS", self.typ)),
        }
        Ok(self)
    }

    #[cfg(feature = "tls")]
    #[cfg(feature = "ws")]
    pub fn wss(mut self) -> Result<Self> {
        if matches!(self.typ, ListenerType::TCP) {
            self = self.tls()?;
        }
        if !matches!(self.typ, ListenerType::TLS | ListenerType::WSS) {
            return Err(anyhow!("{:?} listener can not be turned into WSS", self.typ));
        }
        self.typ = ListenerType::WSS;
        Ok(self)
    }

    #[cfg(feature = "tls")]
    pub fn tls(mut self) -> Result<Listener> {
        match self.typ {
            ListenerType::TLS => return Ok(self),
            ListenerType::TCP => {}
            #[cfg(feature = "ws")]
            _ => return Err(anyhow!("{:?} listener can not be turned into TLS", self.typ)),
        }

        let (Some(cert), Some(key)) = (&self.cfg.tls_cert, &self.cfg.tls_key) else {
            return Err(anyhow!("{} needs both tls_cert and tls_key", self.cfg.name));
        };
        let tls_config = server_config(cert, key)?;
        self.tls_acceptor = Some(TlsAcceptor::from(Arc::new(tls_config)));
        self.typ = ListenerType::TLS;
        Ok(self)
    }

    pub async fn accept(&self) -> Result<Acceptor<TcpStream>> {
        let (socket, remote_addr) = self.tcp_listener.accept().await?;
        socket.set_nodelay(true)?;
        Ok(Acceptor {
            socket,
            remote_addr,
            #[cfg(feature = "tls")]
            acceptor: self.tls_acceptor.clone(),
            cfg: self.cfg.clone(),
            typ: self.typ,
        })
    }
}

/// Loads a PEM certificate chain and private key.
#[cfg(feature = "tls")]
fn server_config(cert: &str, key: &str) -> Result<rustls::ServerConfig> {
    use rustls::pki_types::{CertificateDer, PrivateKeyDer};

    let chain = CertificateDer::pem_file_iter(cert)
        .and_then(|certs| certs.collect::<std::result::Result<Vec<_>, _>>())
        .map_err(|e| anyhow!("cannot read certificates from {}, {}", cert, e))?;
    let key = PrivateKeyDer::from_pem_file(key).map_err(|e| anyhow!("cannot read private key from {}, {}", key, e))?;
    let config = rustls::ServerConfig::builder_with_provider(Arc::new(provider::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(chain, key)?;
    Ok(config)
}

/// An accepted socket waiting for its transport handshake.
pub struct Acceptor<S> {
    pub(crate) socket: S,
    #[cfg(feature = "tls")]
    acceptor: Option<TlsAcceptor>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
    pub typ: ListenerType,
}

impl<S> Acceptor<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[inline]
    pub fn tcp(self) -> Result<Dispatcher<S>> {
        if self.typ != ListenerType::TCP {
            return Err(MqttError::MismatchedListenerType.into());
        }
        Ok(Dispatcher::new(self.socket, self.remote_addr, self.cfg))
    }

    #[inline]
    #[cfg(feature = "tls")]
    pub async fn tls(self) -> Result<Dispatcher<TlsStream<S>>> {
        if self.typ != ListenerType::TLS {
            return Err(MqttError::MismatchedListenerType.into());
        }
        let acceptor = self.acceptor.ok_or(MqttError::ServiceUnavailable)?;
        let tls = handshake(&self.cfg, acceptor.accept(self.socket)).await?;
        Ok(Dispatcher::new(tls, self.remote_addr, self.cfg))
    }

    /// Upgrades to WebSocket. A TCP listener may hand over sockets that
    /// [`Acceptor::is_websocket`] identified as an HTTP upgrade.
    #[inline]
    #[cfg(feature = "ws")]
    pub async fn ws(self) -> Result<Dispatcher<WsStream<S>>> {
        if !matches!(self.typ, ListenerType::TCP | ListenerType::WS) {
            return Err(MqttError::MismatchedListenerType.into());
        }
        upgrade(self.socket, self.remote_addr, self.cfg).await
    }

    #[inline]
    #[cfg(feature = "tls")]
    #[cfg(feature = "ws")]
    pub async fn wss(self) -> Result<Dispatcher<WsStream<TlsStream<S>>>> {
        if self.typ != ListenerType::WSS {
            return Err(MqttError::MismatchedListenerType.into());
        }
        let acceptor = self.acceptor.ok_or(MqttError::ServiceUnavailable)?;
        let tls = handshake(&self.cfg, acceptor.accept(self.socket)).await?;
        upgrade(tls, self.remote_addr, self.cfg).await
    }
}

impl Acceptor<TcpStream> {
    /// Tells an HTTP upgrade request from raw MQTT by peeking at the first
    /// byte, a CONNECT packet starts with 0x10 and a GET request with 'G'.
    pub async fn is_websocket(&self) -> Result<bool> {
        let mut buf = [0u8; 1];
        match handshake(&self.cfg, self.socket.peek(&mut buf)).await? {
            0 => Err(MqttError::Disconnected.into()),
            _ => Ok(buf[0] == b'G'),
        }
    }
}

#[cfg(feature = "ws")]
async fn upgrade<S>(socket: S, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Result<Dispatcher<WsStream<S>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = handshake(&cfg, accept_hdr_async(socket, on_handshake)).await?;
    Ok(Dispatcher::new(WsStream::new(ws), remote_addr, cfg))
}

/// Runs a transport handshake within the handshake timeout.
async fn handshake<T, E>(cfg: &Builder, fut: impl Future<Output = std::result::Result<T, E>>) -> Result<T>
where
    Error: From<E>,
{
    match tokio::time::timeout(cfg.handshake_timeout, fut).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(MqttError::ReadTimeout.into()),
    }
}

/// Picks the first offered subprotocol we speak. A request without the
/// header is let through untouched.
#[allow(clippy::result_large_err)]
#[cfg(feature = "ws")]
fn on_handshake(req: &Request, mut response: Response) -> std::result::Result<Response, ErrorResponse> {
    const PROTOCOL_ERROR: &str = "Unsupported \"Sec-WebSocket-Protocol\", expected mqtt or mqttv3.1";
    let Some(offered) = req.headers().get("Sec-WebSocket-Protocol") else {
        return Ok(response);
    };
    let offered = offered.to_str().map_err(|_| ErrorResponse::new(Some(PROTOCOL_ERROR.into())))?;
    let selected = offered
        .split(',')
        .map(|p| p.trim())
        .find(|p| WS_SUBPROTOCOLS.contains(p))
        .ok_or_else(|| ErrorResponse::new(Some(PROTOCOL_ERROR.into())))?;
    response.headers_mut().append(
        "Sec-WebSocket-Protocol",
        selected.parse().map_err(|_| ErrorResponse::new(Some("InvalidHeaderValue".into())))?,
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_ephemeral() {
        let l = Builder::new().name("test/tcp").laddr(([127, 0, 0, 1], 0).into()).bind().unwrap().tcp().unwrap();
        assert_ne!(l.local_addr().port(), 0);
        assert_eq!(l.typ, ListenerType::TCP);

        let addr = l.local_addr();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let acceptor = l.accept().await.unwrap();
        assert_eq!(acceptor.typ, ListenerType::TCP);
        assert!(acceptor.tcp().is_ok());
        drop(client.await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn shared_port() {
        let first = Builder::new().laddr(([127, 0, 0, 1], 0).into()).reuseport(Some(true)).bind().unwrap();
        let laddr = first.local_addr();
        let second = Builder::new().laddr(laddr).reuseport(Some(true)).bind().unwrap().tcp().unwrap();
        assert_eq!(second.local_addr(), laddr);
        drop(first);
    }

    #[tokio::test]
    async fn sniffs_websocket_upgrade() {
        use tokio::io::AsyncWriteExt;

        let l = Builder::new().laddr(([127, 0, 0, 1], 0).into()).bind().unwrap();
        let addr = l.local_addr();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            s
        });
        let acceptor = l.accept().await.unwrap();
        assert!(acceptor.is_websocket().await.unwrap());
        drop(client.await.unwrap());

        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(addr).await.unwrap();
            s.write_all(&[0x10, 0x00]).await.unwrap();
            s
        });
        let acceptor = l.accept().await.unwrap();
        assert!(!acceptor.is_websocket().await.unwrap());
        drop(client.await.unwrap());
    }

    #[cfg(feature = "ws")]
    #[tokio::test]
    async fn ws_listener_rejects_tcp_dispatch() {
        let l = Builder::new().laddr(([127, 0, 0, 1], 0).into()).bind().unwrap().ws().unwrap();
        assert!(l.tcp().is_err());

        let l = Builder::new().laddr(([127, 0, 0, 1], 0).into()).bind().unwrap().ws().unwrap();
        let addr = l.local_addr();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let acceptor = l.accept().await.unwrap();
        assert!(acceptor.tcp().is_err());
        drop(client.await.unwrap());
    }

    #[cfg(feature = "ws")]
    #[test]
    fn subprotocol_selection() {
        let req = Request::builder()
            .uri("/")
            .header("Sec-WebSocket-Protocol", "foo, mqttv3.1, mqtt")
            .body(())
            .unwrap();
        let resp = on_handshake(&req, Response::new(())).unwrap();
        assert_eq!(resp.headers().get("Sec-WebSocket-Protocol").unwrap(), "mqttv3.1");

        let req = Request::builder().uri("/").header("Sec-WebSocket-Protocol", "stomp").body(()).unwrap();
        assert!(on_handshake(&req, Response::new(())).is_err());

        let req = Request::builder().uri("/").body(()).unwrap();
        let resp = on_handshake(&req, Response::new(())).unwrap();
        assert!(resp.headers().get("Sec-WebSocket-Protocol").is_none());
    }
}
