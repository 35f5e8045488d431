//! # Core Protocol Components
//!
//! Frame layout, the stream codec, the cipher pipeline and payload marshaling.
//!
//! ## Wire Format
//! ```text
//! [body_len u32][cmd u32][ext u64][body]      (little-endian)
//! ```
//!
//! ## Components
//! - **Frame**: header layout, reserved command ids, raw encode/decode
//! - **Codec**: Tokio codec for framing over byte streams
//! - **Cipher**: per-frame transform, compression by default
//! - **Serialization**: JSON, bincode and MessagePack behind one trait

pub mod cipher;
pub mod codec;
pub mod frame;
pub mod serialization;
