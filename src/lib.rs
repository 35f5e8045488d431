//! # framelink
//!
//! Framed binary messaging over TCP or WebSocket: a 16-byte little-endian header, numeric
//! command routing, per-connection bounded send queues, RPC correlation by
//! sequence number, client auto-reconnect, and a heap-driven timer.
//!
//! ## Layers
//! - [`core`]: frame layout, the tokio codec, ciphers and value codecs
//! - [`transport`]: connections, socket setup and the WebSocket adapter
//! - [`protocol`]: the dispatch engine and RPC
//! - [`service`]: server and client entry points
//! - [`timer`]: the shared timer behind keepalive, backoff and deadlines
//!
//! ## Example
//! ```rust,no_run
//! use framelink::{Engine, RpcClient, Server, ClientConfig};
//! use std::time::Duration;
//!
//! # async fn run() -> framelink::Result<()> {
//! let engine = Engine::builder("echo")
//!     .handle_rpc_method("echo", |ctx| {
//!         let _ = ctx.write_data(ctx.body().clone());
//!     })
//!     .build();
//! let server = Server::builder(engine).build();
//! let listener = server.listen("127.0.0.1:9000").await?;
//! let srv = server.clone();
//! tokio::spawn(async move { srv.serve(listener).await });
//!
//! let client_engine = Engine::builder("client").build();
//! let client = RpcClient::connect("127.0.0.1:9000", &client_engine, &ClientConfig::default()).await?;
//! let reply: String = client.call("echo", "hi", Duration::from_secs(1)).await?;
//! assert_eq!(reply, "hi");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod service;
pub mod timer;
pub mod transport;
pub mod utils;

pub use crate::config::{ClientConfig, NetworkConfig, ServerConfig, SocketConfig, TransportConfig};
pub use crate::core::cipher::{Cipher, CompressionCipher, NoopCipher};
pub use crate::core::frame::{Frame, CMD_USER_MAX};
pub use crate::core::serialization::{Codec, SerializationFormat};
pub use crate::error::{FrameError, NetError, Result};
pub use crate::protocol::dispatcher::{Engine, EngineBuilder};
pub use crate::protocol::rpc::{RpcClient, RpcContext};
pub use crate::service::{connect, ClientOptions, Server, ServerBuilder};
#[cfg(feature = "websocket")]
pub use crate::service::connect_ws;
pub use crate::timer::{default_timer, Timer, TimerId};
pub use crate::transport::connection::{CloseHandle, ConnState, Connection};
