//! WebSocket carriage for framed connections.
//!
//! Every frame travels as exactly one binary message. [`WsStream`] turns a
//! WebSocket into a byte stream so the same codec and loops drive it as a
//! TCP socket; text, ping and pong messages are skipped on read.

use crate::config::SocketConfig;
use crate::core::frame::HEAD_LEN;
use crate::error::{NetError, Result};
use crate::transport;
use crate::utils::timeout::with_timeout_error;
use bytes::{Buf, Bytes, BytesMut};
use futures::{Sink, Stream};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Byte-stream view of a WebSocket: reads concatenate binary messages,
/// flushes send each complete frame as its own message.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
    write_buf: BytesMut,
}

impl<S> WsStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
            write_buf: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &WebSocketStream<S> {
        &self.inner
    }
}

impl<S> std::fmt::Debug for WsStream<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsStream")
            .field("buffered_read", &self.read_buf.len())
            .field("buffered_write", &self.write_buf.len())
            .finish()
    }
}

/// Length of the first whole frame in `buf`, if one is buffered
fn complete_frame_len(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEAD_LEN {
        return None;
    }
    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total = HEAD_LEN + body_len;
    (buf.len() >= total).then_some(total)
}

fn ws_io_error(e: WsError) -> io::Error {
    match e {
        WsError::Io(e) => e,
        WsError::ConnectionClosed | WsError::AlreadyClosed => io::Error::from(io::ErrorKind::NotConnected),
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_buf.has_remaining() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = data.into(),
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Poll::Ready(Err(ws_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().write_buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while let Some(len) = complete_frame_len(&this.write_buf) {
            ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(ws_io_error)?;
            let frame = this.write_buf.split_to(len).freeze();
            Pin::new(&mut this.inner)
                .start_send(Message::binary(frame))
                .map_err(ws_io_error)?;
        }
        Pin::new(&mut this.inner).poll_flush(cx).map_err(ws_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        match ready!(Pin::new(&mut self.get_mut().inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(ws_io_error(e))),
        }
    }
}

/// Dial a `ws://` URL and complete the client handshake within `connect_timeout`.
///
/// Returns the stream and the peer address of the underlying socket.
pub async fn dial(
    url: &str,
    socket: &SocketConfig,
    connect_timeout: Duration,
) -> Result<(WsStream<TcpStream>, Option<SocketAddr>)> {
    let request = url
        .into_client_request()
        .map_err(|e| NetError::ConfigError(format!("invalid websocket url {url}: {e}")))?;
    let uri = request.uri();
    if uri.scheme_str() != Some("ws") {
        return Err(NetError::ConfigError(format!("unsupported websocket url {url}, expected ws://")));
    }
    let host = uri
        .host()
        .ok_or_else(|| NetError::ConfigError(format!("websocket url {url} has no host")))?;
    let addr = format!("{host}:{}", uri.port_u16().unwrap_or(80));

    let stream = transport::dial(&addr, socket, connect_timeout).await?;
    let peer = stream.peer_addr().ok();
    let (ws, _response) = with_timeout_error(
        async {
            tokio_tungstenite::client_async(request, stream)
                .await
                .map_err(|e| NetError::Transport(ws_io_error(e)))
        },
        connect_timeout,
    )
    .await?;
    debug!(url, peer = ?peer, "websocket handshake complete");
    Ok((WsStream::new(ws), peer))
}

/// Complete the server handshake on an accepted socket.
pub async fn accept<S>(stream: S) -> Result<WsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ws = tokio_tungstenite::accept_async(stream)
        .await
        .map_err(|e| NetError::Transport(ws_io_error(e)))?;
    Ok(WsStream::new(ws))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::frame::Frame;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_complete_frame_len() {
        let wire = Frame::new(1, 2, "abc").to_bytes().unwrap();
        assert_eq!(complete_frame_len(&wire), Some(HEAD_LEN + 3));
        assert_eq!(complete_frame_len(&wire[..HEAD_LEN + 2]), None);
        assert_eq!(complete_frame_len(&wire[..4]), None);

        let mut two = wire.to_vec();
        two.extend_from_slice(&wire);
        assert_eq!(complete_frame_len(&two), Some(HEAD_LEN + 3));
    }

    #[test]
    fn test_close_errors_map_to_not_connected() {
        assert_eq!(ws_io_error(WsError::ConnectionClosed).kind(), io::ErrorKind::NotConnected);
        let inner = io::Error::from(io::ErrorKind::BrokenPipe);
        assert_eq!(ws_io_error(WsError::Io(inner)).kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_dial_rejects_non_ws_scheme() {
        let res = dial("wss://127.0.0.1:1/", &SocketConfig::default(), Duration::from_secs(1)).await;
        assert!(matches!(res, Err(NetError::ConfigError(_))));
        let res = dial("not a url", &SocketConfig::default(), Duration::from_secs(1)).await;
        assert!(matches!(res, Err(NetError::ConfigError(_))));
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn test_one_message_per_frame() {
        use futures::StreamExt;
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/", listener.local_addr().unwrap());
        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            let mut sizes = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => sizes.push(data.len()),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            sizes
        });

        let (mut stream, peer) = dial(&url, &SocketConfig::default(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(peer.is_some());
        let mut wire = Frame::new(1, 1, "first").to_bytes().unwrap().to_vec();
        wire.extend_from_slice(&Frame::new(2, 2, vec![0u8; 300]).to_bytes().unwrap());
        // Split mid-frame: only whole frames leave on flush
        stream.write_all(&wire[..HEAD_LEN + 8]).await.unwrap();
        stream.write_all(&wire[HEAD_LEN + 8..]).await.unwrap();
        stream.flush().await.unwrap();
        stream.shutdown().await.unwrap();

        let sizes = server.await.unwrap();
        assert_eq!(sizes, vec![HEAD_LEN + 5, HEAD_LEN + 300]);
    }
}
