//! A framed connection: one read loop, one write loop, one bounded queue.
//!
//! ```text
//! read:  socket -> FrameCodec -> Cipher::decrypt -> Engine::dispatch
//! write: queue  -> Cipher::encrypt -> FrameCodec -> socket
//! ```
//!
//! Every mutable field lives behind one per-connection lock, and every state
//! change goes through [`ConnInner::transition`]. A supervisor task joins both
//! loops and then finalizes the session exactly once: pending RPC sessions are
//! failed, close callbacks fire, and the connection either stops or, for
//! clients with auto-reconnect, redials in place.

use crate::core::cipher::Cipher;
use crate::core::codec::FrameCodec;
use crate::core::frame::{Frame, CMD_FLAG_COMPRESSED, CMD_PING, CMD_RPC_ERROR, CMD_SET_REAL_IP};
use crate::error::constants::{ERR_CONNECTION_STOPPED, ERR_SEND_QUEUE_FULL};
use crate::error::{FrameError, NetError, Result};
use crate::protocol::dispatcher::Engine;
use crate::timer::TimerId;
use crate::transport;
use crate::utils::backoff::Backoff;
use crate::utils::panic_message;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection id
pub type ConnId = u64;

/// Opaque handle returned by [`Connection::on_close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CloseHandle(u64);

/// Callback taking the connection, used for close and connected hooks
pub type ConnCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Completion callback for [`Connection::send_with_callback`]
pub type SendCallback = Box<dyn FnOnce(Result<()>) + Send>;

type SessionSender = oneshot::Sender<Result<Frame>>;

/// A pending RPC call: the request's command and where its response goes
struct Session {
    cmd: u32,
    tx: SessionSender,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Running,
    Stopping,
    Stopped,
    Reconnecting,
}

impl ConnState {
    fn can_transition(self, to: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, to),
            (Connecting, Running)
                | (Connecting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Reconnecting)
                | (Reconnecting, Running)
                | (Reconnecting, Stopped)
        )
    }
}

/// How a client connection reaches its server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DialKind {
    Tcp,
    #[cfg(feature = "websocket")]
    WebSocket,
}

/// Dial-side settings kept for redialing
#[derive(Clone)]
pub(crate) struct Redial {
    /// `host:port` for TCP, a `ws://` URL for WebSocket
    pub addr: String,
    pub kind: DialKind,
    pub connect_timeout: Duration,
    pub auto_reconnect: bool,
    pub on_connected: Option<ConnCallback>,
}

pub(crate) struct Outbound {
    frame: Frame,
    done: Option<SendCallback>,
}

impl Outbound {
    fn complete(self, res: Result<()>) {
        if let Some(cb) = self.done {
            cb(res);
        }
    }
}

struct ConnInner {
    state: ConnState,
    shutdown: bool,
    tx: Option<mpsc::Sender<Outbound>>,
    token: CancellationToken,
    peer_addr: Option<SocketAddr>,
    real_ip: Option<IpAddr>,
    sessions: HashMap<u64, Session>,
    close_callbacks: HashMap<CloseHandle, ConnCallback>,
    next_close_handle: u64,
    keepalive: Option<TimerId>,
}

impl ConnInner {
    fn transition(&mut self, to: ConnState) -> bool {
        if self.state.can_transition(to) {
            self.state = to;
            true
        } else {
            debug!(from = ?self.state, to = ?to, "rejected state transition");
            false
        }
    }
}

pub struct Connection {
    id: ConnId,
    engine: Arc<Engine>,
    cipher: Box<dyn Cipher>,
    send_queue_size: usize,
    read_timeout: Duration,
    write_timeout: Duration,
    send_seq: AtomicU64,
    recv_seq: AtomicU64,
    rpc_seq: AtomicU64,
    send_key: AtomicU32,
    recv_key: AtomicU32,
    redial: Option<Redial>,
    inner: Mutex<ConnInner>,
}

impl Connection {
    pub(crate) fn new(
        engine: Arc<Engine>,
        send_queue_size: usize,
        read_timeout: Duration,
        redial: Option<Redial>,
    ) -> Arc<Self> {
        let cipher = engine.new_cipher();
        cipher.init();
        let write_timeout = engine.transport_config().write_timeout;
        Arc::new(Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            engine,
            cipher,
            send_queue_size: send_queue_size.max(1),
            read_timeout,
            write_timeout,
            send_seq: AtomicU64::new(0),
            recv_seq: AtomicU64::new(0),
            rpc_seq: AtomicU64::new(0),
            send_key: AtomicU32::new(0),
            recv_key: AtomicU32::new(0),
            redial,
            inner: Mutex::new(ConnInner {
                state: ConnState::Connecting,
                shutdown: false,
                tx: None,
                token: CancellationToken::new(),
                peer_addr: None,
                real_ip: None,
                sessions: HashMap::new(),
                close_callbacks: HashMap::new(),
                next_close_handle: 0,
                keepalive: None,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start both loops on `stream`. Valid from `Connecting` or `Reconnecting`.
    pub(crate) fn start<S>(self: &Arc<Self>, stream: S, peer: Option<SocketAddr>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (rx, token) = {
            let mut inner = self.lock();
            if inner.shutdown {
                inner.transition(ConnState::Stopped);
                return Err(NetError::Disconnected);
            }
            if !inner.transition(ConnState::Running) {
                return Err(NetError::AlreadyRunning);
            }
            self.send_seq.store(0, Ordering::SeqCst);
            self.recv_seq.store(0, Ordering::SeqCst);
            self.rpc_seq.store(0, Ordering::SeqCst);
            self.cipher.init();

            let (tx, rx) = mpsc::channel(self.send_queue_size);
            let token = CancellationToken::new();
            inner.tx = Some(tx);
            inner.token = token.clone();
            inner.peer_addr = peer;
            (rx, token)
        };

        self.engine.register(self);
        self.engine.notify_new_connection(self);

        let (reader, writer) = tokio::io::split(stream);
        let conn = self.clone();
        tokio::spawn(async move {
            tokio::join!(
                conn.clone().read_loop(reader, token.clone()),
                conn.clone().write_loop(writer, rx, token),
            );
            conn.finalize();
        });

        debug!(conn_id = self.id, peer = ?peer, "connection started");
        Ok(())
    }

    async fn read_loop<R>(self: Arc<Self>, reader: R, token: CancellationToken)
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, FrameCodec::new(self.engine.max_packet_len()));
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = tokio::time::timeout(self.read_timeout, frames.next()) => next,
            };
            let frame = match next {
                Err(_) => {
                    debug!(conn_id = self.id, "read deadline exceeded");
                    break;
                }
                Ok(None) => {
                    debug!(conn_id = self.id, "peer closed the connection");
                    break;
                }
                Ok(Some(Err(e))) => {
                    match e {
                        NetError::Protocol(_) => self.engine.metrics().protocol_error(),
                        _ => self.engine.metrics().connection_error(),
                    }
                    warn!(conn_id = self.id, error = %e, "read failed");
                    break;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            self.engine.metrics().frame_received(frame.wire_len() as u64);
            let seq = self.recv_seq.fetch_add(1, Ordering::SeqCst);
            let key = self.recv_key.load(Ordering::Relaxed);
            let frame = match self.cipher.decrypt(seq, key, frame) {
                Ok(frame) => frame,
                Err(e) => {
                    self.engine.metrics().protocol_error();
                    warn!(conn_id = self.id, seq, error = %e, "decrypt failed");
                    break;
                }
            };
            self.engine.dispatch(&self, frame);
        }
        token.cancel();
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        writer: W,
        mut rx: mpsc::Receiver<Outbound>,
        token: CancellationToken,
    ) where
        W: AsyncWrite + Unpin,
    {
        let mut sink = FramedWrite::new(writer, FrameCodec::new(self.engine.max_packet_len()));
        let mut healthy = true;
        loop {
            let out = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                out = rx.recv() => match out {
                    Some(out) => out,
                    None => break,
                },
            };
            if !self.write_one(&mut sink, out).await {
                healthy = false;
                break;
            }
        }
        token.cancel();
        rx.close();

        // Flush what was queued before the stop, then half-close
        if healthy {
            let drain = async {
                while let Ok(out) = rx.try_recv() {
                    if !self.write_one(&mut sink, out).await {
                        return;
                    }
                }
                if let Err(e) = sink.get_mut().shutdown().await {
                    debug!(conn_id = self.id, error = %e, "half-close failed");
                }
            };
            if tokio::time::timeout(self.write_timeout, drain).await.is_err() {
                debug!(conn_id = self.id, "flush on stop timed out");
            }
        }
        while let Ok(out) = rx.try_recv() {
            out.complete(Err(NetError::Disconnected));
        }
    }

    /// Encrypt and write one frame, reporting the result to its callback.
    /// Returns false once the connection is unusable.
    async fn write_one<W>(&self, sink: &mut FramedWrite<W, FrameCodec>, out: Outbound) -> bool
    where
        W: AsyncWrite + Unpin,
    {
        let Outbound { frame, done } = out;
        let cmd = frame.cmd;
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);
        let key = self.send_key.load(Ordering::Relaxed);
        let res = match self.cipher.encrypt(seq, key, frame) {
            Ok(frame) => {
                let len = frame.wire_len() as u64;
                match tokio::time::timeout(self.write_timeout, sink.send(frame)).await {
                    Ok(Ok(())) => {
                        self.engine.metrics().frame_sent(len);
                        Ok(())
                    }
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(NetError::Timeout),
                }
            }
            Err(e) => Err(e),
        };
        if let Err(e) = &res {
            self.engine.metrics().connection_error();
            warn!(conn_id = self.id, cmd, seq, error = %e, "write failed");
        }
        let ok = res.is_ok();
        if let Some(cb) = done {
            cb(res);
        }
        ok
    }

    /// Runs once per session after both loops have exited.
    fn finalize(self: &Arc<Self>) {
        let (sessions, callbacks, redial) = {
            let mut inner = self.lock();
            if inner.state == ConnState::Running {
                inner.transition(ConnState::Stopping);
            }
            inner.tx = None;
            let sessions = std::mem::take(&mut inner.sessions);
            let callbacks: Vec<ConnCallback> = inner.close_callbacks.values().cloned().collect();
            let redial = !inner.shutdown
                && self.engine.is_running()
                && self.redial.as_ref().is_some_and(|r| r.auto_reconnect);
            if redial {
                inner.transition(ConnState::Reconnecting);
            } else {
                inner.transition(ConnState::Stopped);
            }
            (sessions, callbacks, redial)
        };

        // Waiters observe a dropped sender as `Disconnected`
        drop(sessions);
        self.engine.unregister(self);

        for cb in callbacks {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| cb(self))) {
                warn!(conn_id = self.id, panic = %panic_message(&*panic), "close callback panicked");
            }
        }
        self.engine.notify_disconnected(self);
        debug!(conn_id = self.id, reconnect = redial, "{}", ERR_CONNECTION_STOPPED);

        if redial {
            self.spawn_reconnect();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let Some(redial) = self.redial.clone() else {
            return;
        };
        let conn = self.clone();
        tokio::spawn(async move {
            let mut backoff = Backoff::reconnect();
            loop {
                conn.engine.timer().after(backoff.next_delay()).await;
                if conn.state() != ConnState::Reconnecting {
                    return;
                }
                match conn.redial_once(&redial).await {
                    Ok(started) => {
                        // A shutdown that raced the dial closes the new socket here
                        if let Err(e) = started {
                            debug!(conn_id = conn.id, error = %e, "reconnect abandoned");
                            return;
                        }
                        conn.engine.metrics().reconnected();
                        info!(conn_id = conn.id, addr = %redial.addr, "reconnected");
                        if let Some(cb) = &redial.on_connected {
                            cb(&conn);
                        }
                        return;
                    }
                    Err(e) => {
                        debug!(conn_id = conn.id, addr = %redial.addr, error = %e, "reconnect attempt failed");
                    }
                }
            }
        });
    }

    /// Dial once and restart on the new stream. The outer error is a failed
    /// dial worth retrying, the inner one a restart that must not be.
    async fn redial_once(self: &Arc<Self>, redial: &Redial) -> Result<Result<()>> {
        let socket_cfg = self.engine.socket_config().clone();
        match redial.kind {
            DialKind::Tcp => {
                let stream = transport::dial(&redial.addr, &socket_cfg, redial.connect_timeout).await?;
                let peer = stream.peer_addr().ok();
                Ok(self.start(stream, peer))
            }
            #[cfg(feature = "websocket")]
            DialKind::WebSocket => {
                let (stream, peer) =
                    transport::websocket::dial(&redial.addr, &socket_cfg, redial.connect_timeout).await?;
                Ok(self.start(stream, peer))
            }
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn state(&self) -> ConnState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == ConnState::Running
    }

    /// Whether this side dialed the connection
    pub fn is_client(&self) -> bool {
        self.redial.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.lock().peer_addr
    }

    /// Real client ip if one was announced, otherwise the socket peer ip
    pub fn ip(&self) -> Option<IpAddr> {
        let inner = self.lock();
        inner.real_ip.or(inner.peer_addr.map(|a| a.ip()))
    }

    pub fn set_real_ip(&self, ip: IpAddr) {
        self.lock().real_ip = Some(ip);
    }

    /// Announce `ip` as this side's real address
    pub fn send_real_ip(self: &Arc<Self>, ip: IpAddr) -> Result<()> {
        self.send(Frame::new(CMD_SET_REAL_IP, 0, ip.to_string()))
    }

    pub fn send_seq(&self) -> u64 {
        self.send_seq.load(Ordering::SeqCst)
    }

    pub fn recv_seq(&self) -> u64 {
        self.recv_seq.load(Ordering::SeqCst)
    }

    /// Set the per-direction keys handed to the cipher
    pub fn set_cipher_keys(&self, send_key: u32, recv_key: u32) {
        self.send_key.store(send_key, Ordering::Relaxed);
        self.recv_key.store(recv_key, Ordering::Relaxed);
    }

    /// Non-blocking enqueue.
    ///
    /// A full queue fires the engine's send-queue-full hook and returns
    /// [`NetError::Backpressure`]; the connection stays up.
    pub fn send(self: &Arc<Self>, frame: Frame) -> Result<()> {
        self.enqueue(Outbound { frame, done: None })
    }

    /// Enqueue with a callback the write loop invokes with the write result.
    ///
    /// The callback is not invoked if the enqueue itself fails.
    pub fn send_with_callback<F>(self: &Arc<Self>, frame: Frame, cb: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        self.enqueue(Outbound {
            frame,
            done: Some(Box::new(cb)),
        })
    }

    fn enqueue(self: &Arc<Self>, out: Outbound) -> Result<()> {
        check_outbound(&out.frame)?;
        let rejected = {
            let inner = self.lock();
            if inner.state != ConnState::Running {
                return Err(NetError::Disconnected);
            }
            let Some(tx) = inner.tx.as_ref() else {
                return Err(NetError::Disconnected);
            };
            match tx.try_send(out) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(NetError::Disconnected),
                Err(mpsc::error::TrySendError::Full(out)) => out,
            }
        };
        self.engine.metrics().backpressure();
        debug!(conn_id = self.id, cmd = rejected.frame.cmd, "{}", ERR_SEND_QUEUE_FULL);
        self.engine.notify_send_queue_full(self, &rejected.frame);
        Err(NetError::Backpressure)
    }

    /// Enqueue, waiting up to `timeout` for queue space.
    pub async fn send_timeout(&self, frame: Frame, timeout: Duration) -> Result<()> {
        check_outbound(&frame)?;
        let tx = {
            let inner = self.lock();
            if inner.state != ConnState::Running {
                return Err(NetError::Disconnected);
            }
            inner.tx.clone().ok_or(NetError::Disconnected)?
        };
        tx.send_timeout(Outbound { frame, done: None }, timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => NetError::Timeout,
                mpsc::error::SendTimeoutError::Closed(_) => NetError::Disconnected,
            })
    }

    /// Stop both loops: queued frames are flushed, then the write side is
    /// shut down. Idempotent. An auto-reconnecting client will redial.
    pub fn stop(&self) {
        let token = {
            let mut inner = self.lock();
            match inner.state {
                ConnState::Running => {
                    inner.transition(ConnState::Stopping);
                    Some(inner.token.clone())
                }
                ConnState::Connecting => {
                    inner.transition(ConnState::Stopped);
                    None
                }
                ConnState::Reconnecting if inner.shutdown => {
                    inner.transition(ConnState::Stopped);
                    None
                }
                _ => None,
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Stop for good: no reconnect, keepalive cancelled.
    pub fn shutdown(&self) {
        let keepalive = {
            let mut inner = self.lock();
            inner.shutdown = true;
            inner.keepalive.take()
        };
        if let Some(id) = keepalive {
            self.engine.timer().cancel(id);
        }
        self.stop();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Register a callback fired each time the connection closes
    pub fn on_close<F>(&self, cb: F) -> CloseHandle
    where
        F: Fn(&Arc<Connection>) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        inner.next_close_handle += 1;
        let handle = CloseHandle(inner.next_close_handle);
        inner.close_callbacks.insert(handle, Arc::new(cb));
        handle
    }

    /// Returns false if the handle was not registered
    pub fn cancel_on_close(&self, handle: CloseHandle) -> bool {
        self.lock().close_callbacks.remove(&handle).is_some()
    }

    /// Send a ping every `interval` while running. Replaces any previous keepalive.
    pub fn start_keepalive(self: &Arc<Self>, interval: Duration) {
        if interval.is_zero() {
            return;
        }
        let weak: Weak<Connection> = Arc::downgrade(self);
        let id = self.engine.timer().schedule(interval, interval, 0, move || {
            if let Some(conn) = weak.upgrade() {
                if conn.is_running() {
                    if let Err(e) = conn.send(Frame::empty(CMD_PING, 0)) {
                        debug!(conn_id = conn.id, error = %e, "keepalive ping not sent");
                    }
                }
            }
        });
        let previous = self.lock().keepalive.replace(id);
        if let Some(old) = previous {
            self.engine.timer().cancel(old);
        }
    }

    /// Register a pending RPC session for a request on `cmd` and allocate its sequence id.
    pub(crate) fn open_session(&self, cmd: u32) -> Result<(u64, oneshot::Receiver<Result<Frame>>)> {
        let mut inner = self.lock();
        if inner.state != ConnState::Running {
            return Err(NetError::Disconnected);
        }
        let seq = self.rpc_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        inner.sessions.insert(seq, Session { cmd, tx });
        Ok((seq, rx))
    }

    pub(crate) fn close_session(&self, seq: u64) -> bool {
        self.lock().sessions.remove(&seq).is_some()
    }

    /// Remove and return the session a frame on `cmd` with `ext == seq` answers.
    ///
    /// Only a reply on the request's own command or an rpc-error counts;
    /// any other frame that happens to carry the same `ext` is left for the
    /// command table and the session stays pending.
    pub(crate) fn take_session(&self, seq: u64, cmd: u32) -> Option<SessionSender> {
        let mut inner = self.lock();
        match inner.sessions.get(&seq) {
            Some(session) if session.cmd == cmd || cmd == CMD_RPC_ERROR => {
                inner.sessions.remove(&seq).map(|session| session.tx)
            }
            _ => None,
        }
    }

    /// Number of RPC calls waiting for a response
    pub fn pending_sessions(&self) -> usize {
        self.lock().sessions.len()
    }
}

/// Bit 31 belongs to the cipher and the header stores the body length in 32 bits.
fn check_outbound(frame: &Frame) -> Result<()> {
    if frame.cmd & CMD_FLAG_COMPRESSED != 0 {
        return Err(NetError::ReservedCommand(frame.cmd));
    }
    if u32::try_from(frame.body.len()).is_err() {
        return Err(FrameError::TooLarge {
            len: frame.body.len(),
            max: u32::MAX as usize,
        }
        .into());
    }
    Ok(())
}

impl Drop for Connection {
    fn drop(&mut self) {
        let keepalive = self
            .inner
            .get_mut()
            .map(|inner| inner.keepalive.take())
            .unwrap_or_else(|e| e.into_inner().keepalive.take());
        if let Some(id) = keepalive {
            self.engine.timer().cancel(id);
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("peer_addr", &self.peer_addr())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        use ConnState::*;
        assert!(Connecting.can_transition(Running));
        assert!(Running.can_transition(Stopping));
        assert!(Stopping.can_transition(Stopped));
        assert!(Stopping.can_transition(Reconnecting));
        assert!(Reconnecting.can_transition(Running));
        assert!(Reconnecting.can_transition(Stopped));
    }

    #[test]
    fn test_illegal_transitions() {
        use ConnState::*;
        assert!(!Running.can_transition(Stopped));
        assert!(!Running.can_transition(Reconnecting));
        assert!(!Stopped.can_transition(Running));
        assert!(!Stopped.can_transition(Reconnecting));
        assert!(!Stopping.can_transition(Running));
        assert!(!Running.can_transition(Running));
    }

    #[test]
    fn test_outbound_rejects_compression_flag() {
        let frame = Frame::new(7 | CMD_FLAG_COMPRESSED, 0, "");
        assert!(matches!(
            check_outbound(&frame),
            Err(NetError::ReservedCommand(cmd)) if cmd == 7 | CMD_FLAG_COMPRESSED
        ));
        assert!(check_outbound(&Frame::new(7, 0, "ok")).is_ok());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn test_session_only_answers_its_own_command() {
        let engine = Engine::builder("sessions").build();
        let conn = Connection::new(engine, 4, Duration::from_secs(1), None);
        conn.lock().state = ConnState::Running;

        let (seq, _rx) = conn.open_session(5).unwrap();
        assert!(conn.take_session(seq, 9).is_none());
        assert_eq!(conn.pending_sessions(), 1);
        assert!(conn.take_session(seq, 5).is_some());
        assert_eq!(conn.pending_sessions(), 0);

        let (seq, _rx) = conn.open_session(5).unwrap();
        assert!(conn.take_session(seq, CMD_RPC_ERROR).is_some());
        assert_eq!(conn.pending_sessions(), 0);
    }
}
