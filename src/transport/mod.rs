//! # Transport Layer
//!
//! TCP dialing, socket options and the framed [`Connection`](connection::Connection).
//! Connections accept any `AsyncRead + AsyncWrite` stream, so in-memory
//! duplex pipes and WebSocket streams work the same as sockets.

pub mod connection;
#[cfg(feature = "websocket")]
pub mod websocket;

use crate::config::SocketConfig;
use crate::error::Result;
use crate::utils::timeout::with_timeout_error;
use socket2::{SockRef, TcpKeepalive};
use std::io;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;

/// Dial `addr` within `connect_timeout` and apply `socket` options.
pub async fn dial(addr: &str, socket: &SocketConfig, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = with_timeout_error(
        async { Ok(TcpStream::connect(addr).await?) },
        connect_timeout,
    )
    .await?;
    if let Err(e) = apply_socket_options(&stream, socket) {
        debug!(addr, error = %e, "socket options not applied");
    }
    Ok(stream)
}

/// Apply nodelay, buffer sizes and keepalive.
pub fn apply_socket_options(stream: &TcpStream, cfg: &SocketConfig) -> io::Result<()> {
    stream.set_nodelay(cfg.nodelay)?;

    let sock = SockRef::from(stream);
    if cfg.recv_buffer_size > 0 {
        sock.set_recv_buffer_size(cfg.recv_buffer_size)?;
    }
    if cfg.send_buffer_size > 0 {
        sock.set_send_buffer_size(cfg.send_buffer_size)?;
    }
    if cfg.keepalive {
        let mut keepalive = TcpKeepalive::new();
        if !cfg.keepalive_period.is_zero() {
            keepalive = keepalive.with_time(cfg.keepalive_period);
        }
        sock.set_tcp_keepalive(&keepalive)?;
    } else {
        sock.set_keepalive(false)?;
    }
    Ok(())
}

/// Accept errors worth retrying after a short backoff
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    // ENFILE / EMFILE: out of descriptors, may clear as connections close
    if matches!(e.raw_os_error(), Some(23) | Some(24)) {
        return true;
    }
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}
