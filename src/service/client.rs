//! Dialing side: connect, keepalive and auto-reconnect settings.

use crate::config::ClientConfig;
use crate::error::Result;
use crate::protocol::dispatcher::Engine;
use crate::transport::connection::{ConnCallback, Connection, DialKind, Redial};
use crate::transport;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, instrument};

/// Per-connection settings for [`connect`]
#[derive(Clone)]
pub struct ClientOptions {
    /// Redial with backoff after the connection drops
    pub auto_reconnect: bool,
    /// Ping interval, zero disables keepalive
    pub keepalive: Duration,
    pub connect_timeout: Duration,
    /// Outbound queue capacity, `None` takes the engine's transport setting
    pub send_queue_size: Option<usize>,
    /// Read deadline, `None` takes the engine's transport setting
    pub read_timeout: Option<Duration>,
    /// Runs after every successful reconnect, once the sequence counters are reset
    pub on_connected: Option<ConnCallback>,
}

impl ClientOptions {
    /// Options for a regular client connection
    pub fn from_config(cfg: &ClientConfig) -> Self {
        Self {
            auto_reconnect: cfg.auto_reconnect,
            keepalive: cfg.keepalive_interval,
            connect_timeout: cfg.connect_timeout,
            send_queue_size: None,
            read_timeout: None,
            on_connected: None,
        }
    }

    /// Options for an RPC client: deeper queue, long read deadline
    pub fn rpc(cfg: &ClientConfig) -> Self {
        Self {
            send_queue_size: Some(cfg.rpc_send_queue_size),
            read_timeout: Some(cfg.rpc_read_timeout),
            ..Self::from_config(cfg)
        }
    }

    pub fn auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = enable;
        self
    }

    pub fn keepalive(mut self, interval: Duration) -> Self {
        self.keepalive = interval;
        self
    }

    pub fn send_queue_size(mut self, size: usize) -> Self {
        self.send_queue_size = Some(size);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Queue size and read deadline, falling back to `engine`'s transport config
    fn limits(&self, engine: &Engine) -> (usize, Duration) {
        let transport = engine.transport_config();
        (
            self.send_queue_size.unwrap_or(transport.send_queue_size),
            self.read_timeout.unwrap_or(transport.read_timeout),
        )
    }

    pub fn on_connected<F>(mut self, cb: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_connected = Some(Arc::new(cb));
        self
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl std::fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientOptions")
            .field("auto_reconnect", &self.auto_reconnect)
            .field("keepalive", &self.keepalive)
            .field("connect_timeout", &self.connect_timeout)
            .field("send_queue_size", &self.send_queue_size)
            .field("read_timeout", &self.read_timeout)
            .field("on_connected", &self.on_connected.is_some())
            .finish()
    }
}

/// Dial `addr` and start a connection driven by `engine`.
///
/// The initial dial is not retried; `on_connected` only runs for reconnects.
#[instrument(skip(engine, opts), fields(tag = %engine.tag()))]
pub async fn connect(addr: &str, engine: &Arc<Engine>, opts: ClientOptions) -> Result<Arc<Connection>> {
    let stream = transport::dial(addr, engine.socket_config(), opts.connect_timeout).await?;
    let peer = stream.peer_addr().ok();
    attach(engine, opts, stream, peer, addr, DialKind::Tcp)
}

/// Like [`connect`] over a WebSocket at `url` (`ws://host:port/path`).
/// Each frame travels as one binary message; reconnects redial the same URL.
#[cfg(feature = "websocket")]
#[instrument(skip(engine, opts), fields(tag = %engine.tag()))]
pub async fn connect_ws(url: &str, engine: &Arc<Engine>, opts: ClientOptions) -> Result<Arc<Connection>> {
    let (stream, peer) = transport::websocket::dial(url, engine.socket_config(), opts.connect_timeout).await?;
    attach(engine, opts, stream, peer, url, DialKind::WebSocket)
}

fn attach<S>(
    engine: &Arc<Engine>,
    opts: ClientOptions,
    stream: S,
    peer: Option<SocketAddr>,
    addr: &str,
    kind: DialKind,
) -> Result<Arc<Connection>>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (send_queue_size, read_timeout) = opts.limits(engine);
    let conn = Connection::new(
        engine.clone(),
        send_queue_size,
        read_timeout,
        Some(Redial {
            addr: addr.to_string(),
            kind,
            connect_timeout: opts.connect_timeout,
            auto_reconnect: opts.auto_reconnect,
            on_connected: opts.on_connected,
        }),
    );
    conn.start(stream, peer)?;
    conn.start_keepalive(opts.keepalive);

    info!(conn_id = conn.id(), peer = ?peer, ?kind, "connected");
    Ok(conn)
}
