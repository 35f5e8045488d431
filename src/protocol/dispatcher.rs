//! # Engine
//!
//! Command-id routing shared by every connection of a server or client.
//!
//! The handler tables are fixed at [`EngineBuilder::build`]; the engine
//! itself only carries the connection registry, the in-flight counter used
//! for graceful shutdown, hooks, and metrics.
//!
//! Dispatch order for an incoming frame:
//! 1. engine not running: frame ignored
//! 2. ping: answered with ping-ack; ping-ack: dropped
//! 3. set-real-ip: recorded when the engine accepts it
//! 4. `ext` matches a pending RPC session: delivered to the caller
//! 5. stray rpc-error, or rpc-method on a dialing side: dropped
//! 6. rpc-method: routed by method name
//! 7. everything else: the command table
//!
//! Each handler invocation counts as in-flight and runs inside a panic
//! boundary, so one bad handler cannot take its connection down.

use crate::config::{NetworkConfig, SocketConfig, TransportConfig};
use crate::core::cipher::{cipher_factory, Cipher, CipherFactory};
use crate::core::frame::{
    is_reserved, Frame, CMD_PING, CMD_PING_ACK, CMD_RPC_ERROR, CMD_RPC_METHOD, CMD_SET_REAL_IP,
};
use crate::core::serialization::SerializationFormat;
use crate::error::{NetError, Result};
use crate::protocol::rpc::{split_method, RpcContext, MAX_METHOD_LEN};
use crate::timer::{default_timer, Timer};
use crate::transport::connection::{ConnId, Connection};
use crate::utils::metrics::Metrics;
use crate::utils::panic_message;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

type SyncHandler = Arc<dyn Fn(&Arc<Connection>, Frame) + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Arc<Connection>, Frame) -> BoxFuture<'static, ()> + Send + Sync>;
type RpcHandler = Arc<dyn Fn(RpcContext) + Send + Sync>;
type ConnHook = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
type QueueFullHook = Arc<dyn Fn(&Arc<Connection>, &Frame) + Send + Sync>;

#[derive(Clone)]
enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

/// Counts running handler invocations and wakes waiters when it reaches zero
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

pub(crate) struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(self.clone())
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.current() == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Builder collecting handlers and hooks. Registration errors are setup
/// bugs: the `handle*` methods panic on them, the `try_handle*` methods
/// return them.
pub struct EngineBuilder {
    tag: String,
    handlers: HashMap<u32, Handler>,
    methods: HashMap<String, RpcHandler>,
    on_new_connection: Option<ConnHook>,
    on_disconnected: Option<ConnHook>,
    on_send_queue_full: Option<QueueFullHook>,
    cipher: Option<CipherFactory>,
    codec: SerializationFormat,
    transport: TransportConfig,
    socket: SocketConfig,
    timer: Option<Arc<Timer>>,
    accept_real_ip: bool,
}

impl EngineBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            handlers: HashMap::new(),
            methods: HashMap::new(),
            on_new_connection: None,
            on_disconnected: None,
            on_send_queue_full: None,
            cipher: None,
            codec: SerializationFormat::default(),
            transport: TransportConfig::default(),
            socket: SocketConfig::default(),
            timer: None,
            accept_real_ip: false,
        }
    }

    /// Take transport, socket and real-ip settings from a full config
    pub fn config(mut self, cfg: &NetworkConfig) -> Self {
        self.transport = cfg.transport.clone();
        self.socket = cfg.socket.clone();
        self.accept_real_ip = cfg.server.accept_real_ip;
        self
    }

    pub fn transport(mut self, cfg: TransportConfig) -> Self {
        self.transport = cfg;
        self
    }

    pub fn socket(mut self, cfg: SocketConfig) -> Self {
        self.socket = cfg;
        self
    }

    pub fn codec(mut self, codec: SerializationFormat) -> Self {
        self.codec = codec;
        self
    }

    /// Cipher factory; defaults to the one described by the transport config
    pub fn cipher<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Cipher> + Send + Sync + 'static,
    {
        self.cipher = Some(Arc::new(factory));
        self
    }

    /// Timer for keepalive, reconnect backoff, RPC deadlines and shutdown.
    /// Defaults to [`default_timer`].
    pub fn timer(mut self, timer: Arc<Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Honor set-real-ip frames from peers
    pub fn accept_real_ip(mut self, enable: bool) -> Self {
        self.accept_real_ip = enable;
        self
    }

    fn check_cmd(&self, cmd: u32) -> Result<()> {
        if is_reserved(cmd) {
            return Err(NetError::ReservedCommand(cmd));
        }
        if self.handlers.contains_key(&cmd) {
            return Err(NetError::DuplicateHandler(cmd));
        }
        Ok(())
    }

    /// Register a handler run inline on the connection's read loop.
    ///
    /// # Panics
    /// On a reserved (> 0xFFFFFF) or already registered command id.
    pub fn handle<F>(self, cmd: u32, handler: F) -> Self
    where
        F: Fn(&Arc<Connection>, Frame) + Send + Sync + 'static,
    {
        self.try_handle(cmd, handler).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_handle<F>(mut self, cmd: u32, handler: F) -> Result<Self>
    where
        F: Fn(&Arc<Connection>, Frame) + Send + Sync + 'static,
    {
        self.check_cmd(cmd)?;
        debug!(tag = %self.tag, cmd, "handle cmd");
        self.handlers.insert(cmd, Handler::Sync(Arc::new(handler)));
        Ok(self)
    }

    /// Register a handler that runs on its own task.
    ///
    /// # Panics
    /// On a reserved or already registered command id.
    pub fn handle_async<F, Fut>(self, cmd: u32, handler: F) -> Self
    where
        F: Fn(Arc<Connection>, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.try_handle_async(cmd, handler).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_handle_async<F, Fut>(mut self, cmd: u32, handler: F) -> Result<Self>
    where
        F: Fn(Arc<Connection>, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.check_cmd(cmd)?;
        debug!(tag = %self.tag, cmd, "handle async cmd");
        let handler: AsyncHandler = Arc::new(move |conn, frame| handler(conn, frame).boxed());
        self.handlers.insert(cmd, Handler::Async(handler));
        Ok(self)
    }

    /// Register an RPC handler for a command id. The reply goes out on the
    /// same command with the request's sequence number.
    ///
    /// # Panics
    /// On a reserved or already registered command id.
    pub fn handle_rpc<F>(self, cmd: u32, handler: F) -> Self
    where
        F: Fn(RpcContext) + Send + Sync + 'static,
    {
        let handler = rpc_guard(Arc::new(handler));
        self.handle(cmd, move |conn, frame| {
            handler(RpcContext::new(conn.clone(), frame, None))
        })
    }

    /// Like [`handle_rpc`](Self::handle_rpc) for handlers that await, e.g.
    /// on [`RpcContext::write_timeout`].
    pub fn handle_rpc_async<F, Fut>(self, cmd: u32, handler: F) -> Self
    where
        F: Fn(RpcContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handle_async(cmd, move |conn, frame| {
            let ctx = RpcContext::new(conn, frame, None);
            let reply = ctx.clone();
            let fut = handler(ctx);
            async move {
                if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                    let _ = reply.error("rpc handler panicked");
                    std::panic::resume_unwind(panic);
                }
            }
        })
    }

    /// Register a handler for calls made with [`RpcClient::call`](crate::protocol::rpc::RpcClient::call).
    ///
    /// # Panics
    /// If the method name is empty, longer than 127 bytes, or already registered.
    pub fn handle_rpc_method<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(RpcContext) + Send + Sync + 'static,
    {
        if method.is_empty() || method.len() > MAX_METHOD_LEN {
            panic!(
                "{}",
                NetError::InvalidRpcPayload(format!(
                    "rpc method name must be 1-127 bytes, got {}",
                    method.len()
                ))
            );
        }
        if self.methods.contains_key(method) {
            panic!("handler for rpc method {method} already registered");
        }
        debug!(tag = %self.tag, method, "handle rpc method");
        self.methods
            .insert(method.to_string(), rpc_guard(Arc::new(handler)));
        self
    }

    pub fn on_new_connection<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_new_connection = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnected<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        self.on_disconnected = Some(Arc::new(hook));
        self
    }

    /// Called with the rejected frame whenever a non-blocking send finds the queue full
    pub fn on_send_queue_full<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Arc<Connection>, &Frame) + Send + Sync + 'static,
    {
        self.on_send_queue_full = Some(Arc::new(hook));
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let cipher = self
            .cipher
            .unwrap_or_else(|| cipher_factory(&self.transport));
        Arc::new(Engine {
            tag: self.tag,
            handlers: self.handlers,
            methods: self.methods,
            on_new_connection: self.on_new_connection,
            on_disconnected: self.on_disconnected,
            on_send_queue_full: self.on_send_queue_full,
            cipher,
            codec: self.codec,
            transport: self.transport,
            socket: self.socket,
            timer: self.timer.unwrap_or_else(default_timer),
            accept_real_ip: self.accept_real_ip,
            running: AtomicBool::new(true),
            in_flight: Arc::new(InFlight::default()),
            registry: Mutex::new(HashMap::new()),
            load: AtomicUsize::new(0),
            metrics: Metrics::new(),
        })
    }
}

/// Reply with an rpc-error before letting a handler panic reach the dispatch boundary,
/// so the caller fails fast instead of waiting for its deadline.
fn rpc_guard(handler: RpcHandler) -> RpcHandler {
    Arc::new(move |ctx: RpcContext| {
        let reply = ctx.clone();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
            let _ = reply.error("rpc handler panicked");
            std::panic::resume_unwind(panic);
        }
    })
}

pub struct Engine {
    tag: String,
    handlers: HashMap<u32, Handler>,
    methods: HashMap<String, RpcHandler>,
    on_new_connection: Option<ConnHook>,
    on_disconnected: Option<ConnHook>,
    on_send_queue_full: Option<QueueFullHook>,
    cipher: CipherFactory,
    codec: SerializationFormat,
    transport: TransportConfig,
    socket: SocketConfig,
    timer: Arc<Timer>,
    accept_real_ip: bool,
    running: AtomicBool,
    in_flight: Arc<InFlight>,
    registry: Mutex<HashMap<ConnId, Arc<Connection>>>,
    load: AtomicUsize,
    metrics: Metrics,
}

impl Engine {
    pub fn builder(tag: impl Into<String>) -> EngineBuilder {
        EngineBuilder::new(tag)
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn codec(&self) -> SerializationFormat {
        self.codec
    }

    pub fn timer(&self) -> &Arc<Timer> {
        &self.timer
    }

    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    pub fn socket_config(&self) -> &SocketConfig {
        &self.socket
    }

    pub fn max_packet_len(&self) -> usize {
        self.transport.max_packet_len
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Handler invocations currently executing
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Resolves once no handler invocation is executing
    pub async fn wait_idle(&self) {
        self.in_flight.wait_idle().await
    }

    /// Number of registered (running) connections
    pub fn load(&self) -> usize {
        self.load.load(Ordering::SeqCst)
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ConnId, Arc<Connection>>> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.registry().values().cloned().collect()
    }

    pub fn connection(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.registry().get(&id).cloned()
    }

    /// Attach an accepted stream and start its loops.
    pub fn accept<S>(self: &Arc<Self>, stream: S, peer: Option<SocketAddr>) -> Result<Arc<Connection>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn = Connection::new(
            self.clone(),
            self.transport.send_queue_size,
            self.transport.read_timeout,
            None,
        );
        conn.start(stream, peer)?;
        Ok(conn)
    }

    /// Send `frame` to every registered connection, returning how many accepted it
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.broadcast_with_filter(frame, |_| true)
    }

    pub fn broadcast_with_filter<F>(&self, frame: &Frame, filter: F) -> usize
    where
        F: Fn(&Arc<Connection>) -> bool,
    {
        self.connections()
            .iter()
            .filter(|c| filter(c))
            .filter(|c| c.send(frame.clone()).is_ok())
            .count()
    }

    pub(crate) fn new_cipher(&self) -> Box<dyn Cipher> {
        (self.cipher)()
    }

    pub(crate) fn register(&self, conn: &Arc<Connection>) {
        let mut registry = self.registry();
        if registry.insert(conn.id(), conn.clone()).is_none() {
            self.load.fetch_add(1, Ordering::SeqCst);
            self.metrics.connection_established();
        }
    }

    pub(crate) fn unregister(&self, conn: &Arc<Connection>) {
        let mut registry = self.registry();
        if registry.remove(&conn.id()).is_some() {
            self.load.fetch_sub(1, Ordering::SeqCst);
            self.metrics.connection_closed();
        }
    }

    pub(crate) fn notify_new_connection(&self, conn: &Arc<Connection>) {
        if let Some(hook) = &self.on_new_connection {
            self.run_hook("new connection", || hook(conn));
        }
    }

    pub(crate) fn notify_disconnected(&self, conn: &Arc<Connection>) {
        if let Some(hook) = &self.on_disconnected {
            self.run_hook("disconnected", || hook(conn));
        }
    }

    pub(crate) fn notify_send_queue_full(&self, conn: &Arc<Connection>, frame: &Frame) {
        if let Some(hook) = &self.on_send_queue_full {
            self.run_hook("send queue full", || hook(conn, frame));
        }
    }

    fn run_hook(&self, name: &str, f: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            error!(tag = %self.tag, hook = name, panic = %panic_message(&*panic), "hook panicked");
        }
    }

    /// Route one decrypted frame. Called from the connection's read loop.
    pub(crate) fn dispatch(&self, conn: &Arc<Connection>, frame: Frame) {
        if !self.is_running() {
            debug!(tag = %self.tag, conn_id = conn.id(), cmd = frame.cmd, "engine not running, frame ignored");
            return;
        }

        match frame.cmd {
            CMD_PING => {
                if let Err(e) = conn.send(Frame::empty(CMD_PING_ACK, frame.ext)) {
                    debug!(conn_id = conn.id(), error = %e, "ping-ack not sent");
                }
                return;
            }
            CMD_PING_ACK => return,
            CMD_SET_REAL_IP => {
                self.on_set_real_ip(conn, &frame);
                return;
            }
            _ => {}
        }

        if let Some(session) = conn.take_session(frame.ext, frame.cmd) {
            let res = if frame.cmd == CMD_RPC_ERROR {
                Err(NetError::Remote(String::from_utf8_lossy(&frame.body).into_owned()))
            } else {
                Ok(frame)
            };
            // The caller may have given up already
            let _ = session.send(res);
            return;
        }

        if frame.cmd == CMD_RPC_ERROR || (frame.cmd == CMD_RPC_METHOD && conn.is_client()) {
            debug!(conn_id = conn.id(), cmd = frame.cmd, seq = frame.ext, "no pending rpc session, frame discarded");
            return;
        }

        if frame.cmd == CMD_RPC_METHOD {
            self.on_rpc_method(conn, frame);
            return;
        }

        match self.handlers.get(&frame.cmd) {
            Some(Handler::Sync(handler)) => {
                let cmd = frame.cmd;
                let _guard = self.in_flight.enter();
                if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(conn, frame))) {
                    self.metrics.handler_panic();
                    error!(tag = %self.tag, conn_id = conn.id(), cmd, panic = %panic_message(&*panic), "handler panicked");
                }
            }
            Some(Handler::Async(handler)) => {
                let cmd = frame.cmd;
                let guard = self.in_flight.enter();
                let fut = handler(conn.clone(), frame);
                let conn_id = conn.id();
                let tag = self.tag.clone();
                let engine = conn.engine().clone();
                tokio::spawn(async move {
                    let _guard = guard;
                    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                        engine.metrics().handler_panic();
                        error!(tag = %tag, conn_id, cmd, panic = %panic_message(&*panic), "async handler panicked");
                    }
                });
            }
            None => {
                debug!(tag = %self.tag, conn_id = conn.id(), cmd = frame.cmd, "no handler for cmd");
            }
        }
    }

    fn on_set_real_ip(&self, conn: &Arc<Connection>, frame: &Frame) {
        if !self.accept_real_ip || conn.is_client() {
            debug!(conn_id = conn.id(), "set-real-ip ignored");
            return;
        }
        match std::str::from_utf8(&frame.body).ok().and_then(|s| s.trim().parse::<IpAddr>().ok()) {
            Some(ip) => conn.set_real_ip(ip),
            None => warn!(conn_id = conn.id(), "set-real-ip with invalid address"),
        }
    }

    fn on_rpc_method(&self, conn: &Arc<Connection>, mut frame: Frame) {
        let reply_error = |text: String| {
            if let Err(e) = conn.send(Frame::new(CMD_RPC_ERROR, frame.ext, text)) {
                debug!(conn_id = conn.id(), error = %e, "rpc error reply not sent");
            }
        };
        let (payload, method) = match split_method(&frame.body) {
            Ok(parts) => parts,
            // Peers match on the bare text, without the error prefix
            Err(NetError::InvalidRpcPayload(text)) => {
                reply_error(text);
                return;
            }
            Err(e) => {
                reply_error(e.to_string());
                return;
            }
        };
        let Some(handler) = self.methods.get(&method) else {
            reply_error(format!("invalid rpc method {method}"));
            return;
        };
        frame.body = payload;
        let method_name = method.clone();
        let ctx = RpcContext::new(conn.clone(), frame, Some(method));

        let _guard = self.in_flight.enter();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(ctx))) {
            self.metrics.handler_panic();
            error!(tag = %self.tag, conn_id = conn.id(), method = %method_name, panic = %panic_message(&*panic), "rpc method handler panicked");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tag", &self.tag)
            .field("handlers", &self.handlers.len())
            .field("methods", &self.methods.len())
            .field("load", &self.load())
            .field("running", &self.is_running())
            .finish()
    }
}
