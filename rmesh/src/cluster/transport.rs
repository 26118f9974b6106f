use std::cmp::min;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

use super::event::PeerName;
use super::message::ClusterMessage;
use super::Swarm;
use crate::Result;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const LINK_QUEUE_LEN: usize = 1024;
const MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

type HmacSha256 = Hmac<Sha256>;
type Transport = Framed<TcpStream, LengthDelimitedCodec>;

/// An authenticated connection to another member.
pub(crate) struct Link {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::Sender<Bytes>,
    /// The member that opened the connection.
    dialer: PeerName,
    token: CancellationToken,
}

#[inline]
fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder().max_frame_length(MAX_FRAME_LENGTH).new_codec()
}

fn sign(passphrase: &str, nonce: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(passphrase.as_bytes()).map_err(|e| anyhow!(e))?;
    mac.update(nonce);
    Ok(mac)
}

async fn recv(io: &mut Transport) -> Result<ClusterMessage> {
    match io.next().await {
        Some(Ok(data)) => ClusterMessage::decode(&data),
        Some(Err(e)) => Err(e.into()),
        None => Err(anyhow!("link closed during handshake")),
    }
}

impl Swarm {
    pub(crate) async fn listen(&self, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.token.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((socket, addr)) => {
                        let swarm = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = swarm.connect(socket, false).await {
                                log::debug!("cluster link from {} failed, {:?}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::info!("cluster accept error, {:?}", e);
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        log::info!("cluster listener stopped");
    }

    /// Connects to `addr` in the background, unless a dial is already running.
    pub(crate) fn dial(&self, addr: String) {
        if addr.is_empty() || self.dialing.insert(addr.clone(), ()).is_some() {
            return;
        }
        let swarm = self.clone();
        tokio::spawn(async move {
            let res = match timeout(DIAL_TIMEOUT, TcpStream::connect(addr.as_str())).await {
                Ok(Ok(socket)) => {
                    swarm.dialing.remove(&addr);
                    swarm.connect(socket, true).await
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(anyhow!("dial timeout")),
            };
            swarm.dialing.remove(&addr);
            if let Err(e) = res {
                log::debug!("cluster link to {} failed, {:?}", addr, e);
            }
        });
    }

    async fn connect(&self, socket: TcpStream, outbound: bool) -> Result<()> {
        socket.set_nodelay(true)?;
        let mut io = Framed::new(socket, codec());
        let (remote, advertise) = timeout(HANDSHAKE_TIMEOUT, self.handshake(&mut io))
            .await
            .map_err(|_| anyhow!("handshake timeout"))??;
        let dialer = if outbound { self.name } else { remote };
        self.run_link(io, remote, advertise, dialer).await
    }

    /// Exchanges names and proves knowledge of the passphrase both ways.
    async fn handshake(&self, io: &mut Transport) -> Result<(PeerName, String)> {
        let nonce: [u8; 32] = rand::random();
        io.send(ClusterMessage::Hello { name: self.name, advertise: self.advertise(), nonce }.encode()?).await?;

        let (remote, advertise, remote_nonce) = match recv(io).await? {
            ClusterMessage::Hello { name, advertise, nonce } => (name, advertise, nonce),
            other => return Err(anyhow!("expected hello, got {:?}", other)),
        };
        if remote == self.name {
            return Err(anyhow!("connected to self"));
        }

        let mac = sign(&self.cfg.passphrase, &remote_nonce)?.finalize().into_bytes().to_vec();
        io.send(ClusterMessage::Auth { mac }.encode()?).await?;
        match recv(io).await? {
            ClusterMessage::Auth { mac } => sign(&self.cfg.passphrase, &nonce)?
                .verify_slice(&mac)
                .map_err(|_| anyhow!("{} failed authentication", remote))?,
            other => return Err(anyhow!("expected auth, got {:?}", other)),
        }
        Ok((remote, advertise))
    }

    /// Keeps one link per member; of two racing links both sides keep the
    /// one dialed by the lower name.
    fn register_link(&self, remote: PeerName, link: Link) -> bool {
        match self.links.entry(remote) {
            Entry::Vacant(e) => {
                e.insert(link);
                true
            }
            Entry::Occupied(mut e) => {
                let preferred = min(self.name, remote);
                if e.get().dialer == preferred && link.dialer != preferred {
                    return false;
                }
                let old = e.insert(link);
                old.token.cancel();
                true
            }
        }
    }

    async fn run_link(&self, io: Transport, remote: PeerName, advertise: String, dialer: PeerName) -> Result<()> {
        let id = self.link_id.fetch_add(1, Ordering::SeqCst);
        let (tx, mut rx) = mpsc::channel::<Bytes>(LINK_QUEUE_LEN);
        let token = self.token.child_token();
        if !self.register_link(remote, Link { id, tx: tx.clone(), dialer, token: token.clone() }) {
            return Err(anyhow!("already linked with {}", remote));
        }
        log::info!("cluster link {} with {} established, dialed by {}", id, remote, dialer);

        if !advertise.is_empty() {
            self.members.insert(remote, advertise);
        }
        self.peer(remote).touch();
        match self.encode_state() {
            Ok(state) => {
                let _ = tx.try_send(ClusterMessage::Gossip(state).encode()?);
            }
            Err(e) => log::warn!("cluster state encode failed, {:?}", e),
        }

        let (mut sink, mut stream) = io.split();
        let writer_token = token.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    data = rx.recv() => match data {
                        Some(data) => {
                            if let Err(e) = sink.send(data).await {
                                log::debug!("cluster link {} write error, {:?}", id, e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            let _ = sink.close().await;
        });

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(data)) => match ClusterMessage::decode(&data) {
                        Ok(msg) => self.on_message(remote, &tx, msg),
                        Err(e) => log::warn!("undecodable cluster message from {}, {:?}", remote, e),
                    },
                    Some(Err(e)) => {
                        log::debug!("cluster link {} read error, {:?}", id, e);
                        break;
                    }
                    None => break,
                }
            }
        }

        token.cancel();
        let _ = writer.await;
        self.links.remove_if(&remote, |_, l| l.id == id);
        log::info!("cluster link {} with {} closed", id, remote);
        Ok(())
    }

    fn on_message(&self, remote: PeerName, tx: &mpsc::Sender<Bytes>, msg: ClusterMessage) {
        if let Some(peer) = self.peers.get(&remote) {
            peer.touch();
        }
        match msg {
            ClusterMessage::Hello { .. } | ClusterMessage::Auth { .. } => {
                log::debug!("unexpected handshake message from {}", remote)
            }
            ClusterMessage::Members(members) => {
                for (name, addr) in members {
                    if name != self.name && !addr.is_empty() {
                        self.members.entry(name).or_insert(addr);
                    }
                }
            }
            ClusterMessage::Gossip(data) | ClusterMessage::GossipBroadcast(data) => self.on_gossip(&data),
            ClusterMessage::Unicast(data) => self.on_unicast(&data),
            ClusterMessage::Survey { id, kind, payload } => {
                let payload = self.answer_survey(&kind, &payload);
                match (ClusterMessage::SurveyReply { id, payload }).encode() {
                    Ok(data) => {
                        if tx.try_send(data).is_err() {
                            log::debug!("survey reply to {} dropped", remote);
                        }
                    }
                    Err(e) => log::warn!("survey reply encode failed, {:?}", e),
                }
            }
            ClusterMessage::SurveyReply { id, payload } => self.surveys.reply(id, payload),
            ClusterMessage::Ping => {}
        }
    }
}
