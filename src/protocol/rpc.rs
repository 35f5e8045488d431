//! # RPC correlation
//!
//! Requests and responses share a command id and are matched by the
//! frame's `ext` field, which carries a per-connection sequence number.
//!
//! Method calls use the reserved rpc-method command and append the method
//! name to the payload:
//!
//! ```text
//! [payload][method bytes][method len u8]
//! ```
//!
//! A failed call on the server side answers with an rpc-error frame whose
//! body is the error text; the caller sees it as [`NetError::Remote`].

use crate::config::ClientConfig;
use crate::core::frame::{Frame, CMD_RPC_ERROR, CMD_RPC_METHOD};
use crate::core::serialization::{Codec, SerializationFormat};
use crate::error::constants::ERR_RPC_INVALID_PAYLOAD;
use crate::error::{NetError, Result};
use crate::protocol::dispatcher::Engine;
use crate::service::client::{self, ClientOptions};
use crate::transport::connection::Connection;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Longest method name that fits the 1-byte length suffix
pub const MAX_METHOD_LEN: usize = 127;

/// Append `method` and its length to `payload`.
pub(crate) fn join_method(mut payload: Vec<u8>, method: &str) -> Result<Bytes> {
    if method.is_empty() || method.len() > MAX_METHOD_LEN {
        return Err(NetError::InvalidRpcPayload(format!(
            "invalid rpc method length {}, should be (1-127)",
            method.len()
        )));
    }
    payload.reserve(method.len() + 1);
    payload.extend_from_slice(method.as_bytes());
    payload.push(method.len() as u8);
    Ok(payload.into())
}

/// Split an rpc-method body into its payload and method name.
pub(crate) fn split_method(body: &Bytes) -> Result<(Bytes, String)> {
    if body.len() < 2 {
        return Err(NetError::InvalidRpcPayload(ERR_RPC_INVALID_PAYLOAD.to_string()));
    }
    let end = body.len() - 1;
    let method_len = body[end] as usize;
    if method_len == 0 || method_len > MAX_METHOD_LEN || method_len > end {
        return Err(NetError::InvalidRpcPayload(format!(
            "invalid rpc method length {method_len}, should be (1-127)"
        )));
    }
    let start = end - method_len;
    let method = std::str::from_utf8(&body[start..end])
        .map_err(|_| NetError::InvalidRpcPayload(ERR_RPC_INVALID_PAYLOAD.to_string()))?;
    Ok((body.slice(..start), method.to_string()))
}

/// Server-side view of one RPC request.
///
/// Replies go out on the request's command with the request's sequence
/// number. `write*` are non-blocking and fail with
/// [`NetError::Backpressure`] on a full queue; use
/// [`write_timeout`](Self::write_timeout) from async handlers to wait.
#[derive(Clone)]
pub struct RpcContext {
    conn: Arc<Connection>,
    frame: Frame,
    method: Option<String>,
}

impl RpcContext {
    pub(crate) fn new(conn: Arc<Connection>, frame: Frame, method: Option<String>) -> Self {
        Self { conn, frame, method }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn cmd(&self) -> u32 {
        self.frame.cmd
    }

    /// Sequence number the caller is waiting on
    pub fn seq(&self) -> u64 {
        self.frame.ext
    }

    /// Request payload, method suffix already removed
    pub fn body(&self) -> &Bytes {
        &self.frame.body
    }

    /// Method name for calls routed by name
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Decode the request with the engine's codec
    pub fn bind<T: DeserializeOwned>(&self) -> Result<T> {
        self.conn.engine().codec().unmarshal(&self.frame.body)
    }

    /// Encode `value` with the engine's codec and reply with it
    pub fn write<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let data = self.conn.engine().codec().marshal(value)?;
        self.write_data(data)
    }

    pub fn write_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.conn.send(self.reply(data))
    }

    /// Reply, waiting up to `timeout` for queue space
    pub async fn write_timeout(&self, data: impl Into<Bytes>, timeout: Duration) -> Result<()> {
        self.conn.send_timeout(self.reply(data), timeout).await
    }

    /// Fail the call; the caller receives [`NetError::Remote`] with `text`
    pub fn error(&self, text: impl Into<String>) -> Result<()> {
        self.conn
            .send(Frame::new(CMD_RPC_ERROR, self.frame.ext, text.into()))
    }

    fn reply(&self, data: impl Into<Bytes>) -> Frame {
        Frame::new(self.frame.cmd, self.frame.ext, data)
    }
}

impl std::fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcContext")
            .field("conn_id", &self.conn.id())
            .field("cmd", &self.frame.cmd)
            .field("seq", &self.frame.ext)
            .field("method", &self.method)
            .finish()
    }
}

/// Removes the session on every exit path of a call
struct SessionGuard<'a> {
    conn: &'a Connection,
    seq: u64,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.conn.close_session(self.seq);
    }
}

/// Request/response client over one connection.
///
/// Calls may run concurrently; each gets its own sequence number and only
/// ever sees its own response.
#[derive(Clone)]
pub struct RpcClient<C: Codec = SerializationFormat> {
    conn: Arc<Connection>,
    codec: C,
    call_timeout: Duration,
}

impl RpcClient<SerializationFormat> {
    /// Dial `addr` with the RPC queue size and read deadline from `cfg`.
    pub async fn connect(addr: &str, engine: &Arc<Engine>, cfg: &ClientConfig) -> Result<Self> {
        let conn = client::connect(addr, engine, ClientOptions::rpc(cfg)).await?;
        Ok(Self::from_connection(conn).with_call_timeout(cfg.rpc_call_timeout))
    }

    /// [`connect`](Self::connect) over a WebSocket at `url`.
    #[cfg(feature = "websocket")]
    pub async fn connect_ws(url: &str, engine: &Arc<Engine>, cfg: &ClientConfig) -> Result<Self> {
        let conn = client::connect_ws(url, engine, ClientOptions::rpc(cfg)).await?;
        Ok(Self::from_connection(conn).with_call_timeout(cfg.rpc_call_timeout))
    }

    /// Wrap an existing connection, using its engine's codec
    pub fn from_connection(conn: Arc<Connection>) -> Self {
        let codec = conn.engine().codec();
        Self {
            conn,
            codec,
            call_timeout: crate::utils::timeout::RPC_CALL_TIMEOUT,
        }
    }
}

impl<C: Codec> RpcClient<C> {
    pub fn with_codec<D: Codec>(self, codec: D) -> RpcClient<D> {
        RpcClient {
            conn: self.conn,
            codec,
            call_timeout: self.call_timeout,
        }
    }

    /// Deadline used by [`call_cmd`](Self::call_cmd)
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    /// Send `body` on `cmd` and wait for the matching response body.
    pub async fn call_raw(&self, cmd: u32, body: impl Into<Bytes>, timeout: Duration) -> Result<Bytes> {
        self.round_trip(cmd, body.into(), Instant::now() + timeout).await
    }

    pub async fn call_cmd_with_timeout<Req, Rsp>(&self, cmd: u32, req: &Req, timeout: Duration) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let data = self.codec.marshal(req)?;
        let rsp = self.round_trip(cmd, data.into(), Instant::now() + timeout).await?;
        self.codec.unmarshal(&rsp)
    }

    /// [`call_cmd_with_timeout`](Self::call_cmd_with_timeout) with the client's default deadline
    pub async fn call_cmd<Req, Rsp>(&self, cmd: u32, req: &Req) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        self.call_cmd_with_timeout(cmd, req, self.call_timeout).await
    }

    /// Call a handler registered with `handle_rpc_method`.
    pub async fn call<Req, Rsp>(&self, method: &str, req: &Req, timeout: Duration) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        self.call_with_deadline(method, req, Instant::now() + timeout).await
    }

    /// Like [`call`](Self::call) with an absolute deadline, so several
    /// calls can share one budget.
    pub async fn call_with_deadline<Req, Rsp>(&self, method: &str, req: &Req, deadline: Instant) -> Result<Rsp>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let body = join_method(self.codec.marshal(req)?, method)?;
        let rsp = self.round_trip(CMD_RPC_METHOD, body, deadline).await?;
        self.codec.unmarshal(&rsp)
    }

    async fn round_trip(&self, cmd: u32, body: Bytes, deadline: Instant) -> Result<Bytes> {
        // Register before sending so a fast response always finds its session
        let (seq, rx) = self.conn.open_session(cmd)?;
        let _session = SessionGuard { conn: &self.conn, seq };
        let engine = self.conn.engine();

        let remaining = deadline.saturating_duration_since(Instant::now());
        match self.conn.send_timeout(Frame::new(cmd, seq, body), remaining).await {
            Ok(()) => {}
            Err(NetError::Timeout) => {
                engine.metrics().rpc_timeout();
                return Err(NetError::Timeout);
            }
            Err(e) => return Err(e),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            res = rx => match res {
                Ok(Ok(frame)) => Ok(frame.body),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(NetError::Disconnected),
            },
            _ = engine.timer().after(remaining) => {
                engine.metrics().rpc_timeout();
                debug!(conn_id = self.conn.id(), cmd, seq, "rpc call timed out");
                Err(NetError::Timeout)
            }
        }
    }
}

impl<C: Codec> std::fmt::Debug for RpcClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("conn", &self.conn)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_method_suffix_round_trip() {
        let body = join_method(b"{\"a\":1}".to_vec(), "echo").unwrap();
        assert_eq!(body.last(), Some(&4u8));

        let (payload, method) = split_method(&body).unwrap();
        assert_eq!(method, "echo");
        assert_eq!(&payload[..], b"{\"a\":1}");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_empty_payload_with_method() {
        let body = join_method(Vec::new(), "m").unwrap();
        let (payload, method) = split_method(&body).unwrap();
        assert!(payload.is_empty());
        assert_eq!(method, "m");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_short_body_rejected() {
        let err = split_method(&Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, NetError::InvalidRpcPayload(ref t) if t == ERR_RPC_INVALID_PAYLOAD));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_bad_method_length_rejected() {
        // length byte larger than what precedes it
        let err = split_method(&Bytes::from_static(b"ab\x05")).unwrap_err();
        assert!(matches!(err, NetError::InvalidRpcPayload(ref t) if t.contains("length 5")));

        let err = split_method(&Bytes::from_static(b"ab\x00")).unwrap_err();
        assert!(matches!(err, NetError::InvalidRpcPayload(_)));

        let mut long = vec![b'a'; 200];
        long.push(200);
        assert!(split_method(&Bytes::from(long)).is_err());
    }

    #[test]
    fn test_method_name_bounds() {
        assert!(join_method(Vec::new(), "").is_err());
        assert!(join_method(Vec::new(), &"x".repeat(128)).is_err());
        assert!(join_method(Vec::new(), &"x".repeat(127)).is_ok());
    }
}
