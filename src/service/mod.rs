//! # Service Layer
//!
//! TCP and WebSocket entry points built on the engine.
//!
//! ## Components
//! - **Server**: accept loop with load shedding and bounded graceful shutdown
//! - **Client**: dialing with keepalive and auto-reconnect

pub mod client;
pub mod server;

pub use client::{connect, ClientOptions};
#[cfg(feature = "websocket")]
pub use client::connect_ws;
pub use server::{Server, ServerBuilder};
