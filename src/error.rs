//! # Error Types
//!
//! Error handling for the framing engine, connections and the RPC layer.
//!
//! Every fallible operation in the crate returns [`NetError`]. The variants
//! map onto how a failure affects the connection it happened on:
//!
//! ## Error Categories
//! - **Protocol**: malformed or oversized frames. Connection-fatal, never retried.
//! - **Transport**: socket I/O failures. Connection-fatal, may trigger reconnect.
//! - **Backpressure**: the send queue is full. The connection stays alive.
//! - **Timeout**: an RPC deadline or bounded enqueue expired. The connection stays alive.
//! - **Disconnected**: the connection is stopped, or it closed under a pending call.
//! - **Setup**: reserved or duplicate command registration, invalid configuration.
//!
//! ## Example Usage
//! ```rust
//! use framelink::error::{NetError, Result};
//!
//! fn check(len: usize) -> Result<()> {
//!     if len > 1024 {
//!         return Err(NetError::Backpressure);
//!     }
//!     Ok(())
//! }
//!
//! assert!(check(2048).is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to keep hot error paths allocation free.
pub mod constants {
    pub const ERR_CONNECTION_STOPPED: &str = "connection is stopped";
    pub const ERR_SEND_QUEUE_FULL: &str = "send queue is full";
    pub const ERR_RPC_INVALID_PAYLOAD: &str = "invalid rpc payload";
    pub const ERR_SHUTDOWN_TIMEOUT: &str = "shutdown timeout";
}

/// Frame-level decoding failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes, header needs 16")]
    TooShort(usize),

    #[error("frame too large: body of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },

    #[error("frame truncated: declared {declared} body bytes, got {actual}")]
    Truncated { declared: usize, actual: usize },
}

/// NetError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum NetError {
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("send queue is full")]
    Backpressure,

    #[error("operation timed out")]
    Timeout,

    #[error("connection is disconnected")]
    Disconnected,

    #[error("cmd {0}/0x{0:X} is reserved for internal use, use a value <= 0xFFFFFF")]
    ReservedCommand(u32),

    #[error("handler for cmd {0}/0x{0:X} already registered")]
    DuplicateHandler(u32),

    #[error("remote error: {0}")]
    Remote(String),

    #[error("invalid rpc payload: {0}")]
    InvalidRpcPayload(String),

    #[error("serialize error: {0}")]
    Serialize(String),

    #[error("deserialize error: {0}")]
    Deserialize(String),

    #[error("compression failed")]
    CompressionFailure,

    #[error("decompression failed")]
    DecompressionFailure,

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("already running")]
    AlreadyRunning,
}

impl NetError {
    /// Whether this error tears the connection down when it happens inside a loop.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            NetError::Protocol(_)
                | NetError::Transport(_)
                | NetError::DecompressionFailure
                | NetError::CompressionFailure
        )
    }
}

/// Type alias for Results using NetError
pub type Result<T> = std::result::Result<T, NetError>;
