//! # Protocol Layer
//!
//! Routing of decoded frames and the RPC correlation built on top of it.
//!
//! ## Components
//! - **Dispatcher**: the [`Engine`](dispatcher::Engine), its builder and the command table
//! - **RPC**: sequence-matched request/response, method calls, server-side context

pub mod dispatcher;
pub mod rpc;
