//! Accepting side: listener loop, load shedding and graceful shutdown.

use crate::config::ServerConfig;
use crate::core::frame::Frame;
use crate::error::constants::ERR_SHUTDOWN_TIMEOUT;
use crate::error::{NetError, Result};
use crate::protocol::dispatcher::Engine;
use crate::transport::connection::Connection;
#[cfg(feature = "websocket")]
use crate::transport::websocket;
use crate::transport::{apply_socket_options, is_transient_accept_error};
use crate::utils::backoff::Backoff;
#[cfg(feature = "websocket")]
use crate::utils::timeout::{with_timeout_error, CONNECT_TIMEOUT};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

type StopHook = Arc<dyn Fn() + Send + Sync>;

pub struct ServerBuilder {
    engine: Arc<Engine>,
    config: ServerConfig,
    on_stop: Option<StopHook>,
}

impl ServerBuilder {
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Connection ceiling, 0 disables shedding
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.config.max_concurrent = max;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Runs once when the server stops, gracefully or on a fatal accept error
    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Arc<Server> {
        Arc::new(Server {
            engine: self.engine,
            config: self.config,
            on_stop: self.on_stop,
            local_addr: Mutex::new(None),
            serving: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            accepted: AtomicU64::new(0),
            token: CancellationToken::new(),
        })
    }
}

/// How accepted sockets are turned into connections
#[derive(Debug, Clone, Copy)]
enum Upgrade {
    Tcp,
    #[cfg(feature = "websocket")]
    WebSocket,
}

/// TCP or WebSocket server feeding accepted sockets into an [`Engine`].
pub struct Server {
    engine: Arc<Engine>,
    config: ServerConfig,
    on_stop: Option<StopHook>,
    local_addr: Mutex<Option<SocketAddr>>,
    serving: AtomicBool,
    stopped: AtomicBool,
    accepted: AtomicU64,
    token: CancellationToken,
}

impl Server {
    pub fn builder(engine: Arc<Engine>) -> ServerBuilder {
        ServerBuilder {
            engine,
            config: ServerConfig::default(),
            on_stop: None,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Bind a listener and remember its address
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        info!(tag = %self.engine.tag(), addr = %local, "listening");
        Ok(listener)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Accept until [`stop`](Self::stop) is called.
    ///
    /// Transient accept errors back off from 5 ms up to 1 s; any other error
    /// ends the loop, runs the stop hook and is returned.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        self.accept_loop(listener, Upgrade::Tcp).await
    }

    /// Like [`serve`](Self::serve), upgrading each socket to a WebSocket first.
    ///
    /// Load shedding happens before the handshake. A handshake that fails or
    /// takes longer than the connect timeout drops the socket.
    #[cfg(feature = "websocket")]
    pub async fn serve_ws(self: &Arc<Self>, listener: TcpListener) -> Result<()> {
        self.accept_loop(listener, Upgrade::WebSocket).await
    }

    #[instrument(skip(self, listener), fields(tag = %self.engine.tag()))]
    async fn accept_loop(self: &Arc<Self>, listener: TcpListener, upgrade: Upgrade) -> Result<()> {
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(NetError::AlreadyRunning);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }

        let mut backoff = Backoff::accept();
        loop {
            let accepted = tokio::select! {
                _ = self.token.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => {
                    backoff.reset();
                    self.accepted.fetch_add(1, Ordering::Relaxed);

                    let max = self.config.max_concurrent;
                    if max > 0 && self.engine.load() >= max {
                        self.engine.metrics().connection_shed();
                        warn!(peer = %peer, load = self.engine.load(), max, "over capacity, connection dropped");
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = apply_socket_options(&stream, self.engine.socket_config()) {
                        debug!(peer = %peer, error = %e, "socket options not applied");
                    }
                    match upgrade {
                        Upgrade::Tcp => self.attach(stream, peer),
                        #[cfg(feature = "websocket")]
                        Upgrade::WebSocket => {
                            let srv = self.clone();
                            tokio::spawn(async move {
                                let handshake = with_timeout_error(websocket::accept(stream), CONNECT_TIMEOUT);
                                match handshake.await {
                                    Ok(_) if srv.is_stopped() => debug!(peer = %peer, "server stopped during handshake"),
                                    Ok(ws) => srv.attach(ws, peer),
                                    Err(e) => debug!(peer = %peer, error = %e, "websocket handshake failed"),
                                }
                            });
                        }
                    }
                }
                Err(e) if is_transient_accept_error(&e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, delay_ms = delay.as_millis() as u64, "accept failed, retrying");
                    self.engine.timer().after(delay).await;
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    self.stopped.store(true, Ordering::SeqCst);
                    self.run_stop_hook();
                    return Err(e.into());
                }
            }
        }
        info!(accepted = self.accepted_num(), "accept loop stopped");
        Ok(())
    }

    fn attach<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        match self.engine.accept(stream, Some(peer)) {
            Ok(conn) => debug!(conn_id = conn.id(), peer = %peer, "accepted"),
            Err(e) => debug!(peer = %peer, error = %e, "accepted connection not started"),
        }
    }

    /// Serve until `signal` resolves, then shut down gracefully.
    pub async fn serve_until<F>(self: &Arc<Self>, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            res = self.serve(listener) => res,
            _ = signal => {
                let timeout = self.config.shutdown_timeout;
                self.stop_with_timeout(timeout, move || {
                    warn!(timeout_ms = timeout.as_millis() as u64, "{}", ERR_SHUTDOWN_TIMEOUT);
                })
                .await;
                Ok(())
            }
        }
    }

    /// Graceful stop bounded by the configured shutdown timeout
    pub async fn stop(&self) {
        let timeout = self.config.shutdown_timeout;
        self.stop_with_timeout(timeout, move || {
            warn!(timeout_ms = timeout.as_millis() as u64, "{}", ERR_SHUTDOWN_TIMEOUT);
        })
        .await
    }

    /// Stop accepting, refuse new dispatches, wait for running handlers,
    /// then stop every connection and run the stop hook.
    ///
    /// `on_timeout` runs on the timer thread if handlers are still running
    /// after `timeout`; the stop proceeds either way. Calling this again is
    /// a no-op.
    pub async fn stop_with_timeout<F>(&self, timeout: Duration, on_timeout: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();
        self.engine.set_running(false);

        let timer = self.engine.timer();
        let overrun = timer.once(timeout, on_timeout);
        tokio::select! {
            _ = self.engine.wait_idle() => timer.cancel(overrun),
            _ = timer.after(timeout) => {
                warn!(in_flight = self.engine.in_flight(), "handlers still running at shutdown");
            }
        }

        let conns = self.engine.connections();
        let count = conns.len();
        for conn in conns {
            conn.shutdown();
        }
        info!(tag = %self.engine.tag(), connections = count, "server stopped");
        self.engine.metrics().log_metrics(self.engine.tag());
        self.run_stop_hook();
    }

    fn run_stop_hook(&self) {
        if let Some(hook) = &self.on_stop {
            hook();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Live connections
    pub fn curr_load(&self) -> usize {
        self.engine.load()
    }

    pub fn max_load(&self) -> usize {
        self.config.max_concurrent
    }

    /// Sockets accepted since start, shed ones included
    pub fn accepted_num(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.engine.broadcast(frame)
    }

    pub fn broadcast_with_filter<F>(&self, frame: &Frame, filter: F) -> usize
    where
        F: Fn(&Arc<Connection>) -> bool,
    {
        self.engine.broadcast_with_filter(frame, filter)
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("engine", &self.engine)
            .field("local_addr", &self.local_addr())
            .field("max_concurrent", &self.config.max_concurrent)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
