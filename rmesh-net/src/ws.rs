use std::io::{self, ErrorKind};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{ready, Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::{Error as WSError, Message};
use tokio_tungstenite::WebSocketStream;

/// Byte stream view over the binary frames of a WebSocket, so the MQTT
/// codec can frame packets that span or share WebSocket messages.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    pending: Option<Bytes>,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self { inner, pending: None }
    }

    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.inner
    }
}

/// Copies as much of `data` as fits and returns what is left over.
fn fill(buf: &mut ReadBuf<'_>, mut data: Bytes) -> Option<Bytes> {
    let n = data.len().min(buf.remaining());
    buf.put_slice(&data.split_to(n));
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if let Some(data) = self.pending.take() {
            self.pending = fill(buf, data);
            return Poll::Ready(Ok(()));
        }

        loop {
            match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    self.pending = fill(buf, data);
                    return Poll::Ready(Ok(()));
                }
                Some(Ok(Message::Text(text))) => {
                    let data = Bytes::copy_from_slice(text.as_bytes());
                    self.pending = fill(buf, data);
                    return Poll::Ready(Ok(()));
                }
                // an empty read signals EOF to the codec
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                // control frames are answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    log::debug!("websocket read error, {e:?}");
                    return Poll::Ready(Err(to_error(e)));
                }
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if let Err(e) = ready!(Pin::new(&mut self.inner).poll_ready(cx)) {
            return Poll::Ready(Err(to_error(e)));
        }
        if let Err(e) = Pin::new(&mut self.inner).start_send(Message::Binary(Bytes::copy_from_slice(buf))) {
            return Poll::Ready(Err(to_error(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(to_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.inner).poll_close(cx)) {
            Ok(()) | Err(WSError::ConnectionClosed) | Err(WSError::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(to_error(e))),
        }
    }
}

fn to_error(e: WSError) -> io::Error {
    match e {
        WSError::ConnectionClosed => io::Error::from(ErrorKind::ConnectionAborted),
        WSError::AlreadyClosed => io::Error::from(ErrorKind::NotConnected),
        WSError::Io(io_e) => io_e,
        _ => io::Error::other(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::SinkExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;

    #[tokio::test]
    async fn binary_frames_as_bytes() {
        let (a, b) = tokio::io::duplex(4096);
        let mut server = WsStream::new(WebSocketStream::from_raw_socket(a, Role::Server, None).await);
        let mut client = WebSocketStream::from_raw_socket(b, Role::Client, None).await;

        client.send(Message::Binary(Bytes::from_static(b"\xc0\x00\xc0"))).await.unwrap();
        client.send(Message::Ping(Bytes::from_static(b"hi"))).await.unwrap();
        client.send(Message::Binary(Bytes::from_static(b"\x00"))).await.unwrap();

        let mut out = [0u8; 2];
        server.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"\xc0\x00");
        let mut out = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(1), server.read_exact(&mut out)).await.unwrap().unwrap();
        assert_eq!(&out, b"\xc0\x00");

        server.write_all(b"\xd0\x00").await.unwrap();
        server.flush().await.unwrap();
        match futures::StreamExt::next(&mut client).await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data.as_ref(), b"\xd0\x00"),
            other => panic!("unexpected {:?}", other),
        }
    }
}
