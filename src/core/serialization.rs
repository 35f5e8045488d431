//! # Serialization Formats
//!
//! Payload marshaling behind the [`Codec`] trait. The RPC layer and
//! `RpcContext` use it to turn request and response values into frame bodies.
//!
//! ## Formats
//! - **JSON** (default): human-readable, interoperable
//! - **Bincode**: fastest, binary
//! - **MessagePack**: compact binary
//!
//! ## Usage
//! ```rust
//! use framelink::core::serialization::{Codec, SerializationFormat};
//!
//! let bytes = SerializationFormat::MessagePack.marshal(&("ping", 7u32)).unwrap();
//! let back: (String, u32) = SerializationFormat::MessagePack.unmarshal(&bytes).unwrap();
//! assert_eq!(back.1, 7);
//! ```

use crate::error::{NetError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Value marshaling for frame bodies
pub trait Codec: Send + Sync + 'static {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T>;
}

/// Supported serialization formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializationFormat {
    /// Human-readable JSON format (default, interop)
    #[default]
    Json,
    /// Binary compact format (fastest)
    Bincode,
    /// Compact binary format (MessagePack)
    MessagePack,
}

impl SerializationFormat {
    /// Get human-readable name
    pub fn name(self) -> &'static str {
        match self {
            SerializationFormat::Json => "JSON",
            SerializationFormat::Bincode => "Bincode",
            SerializationFormat::MessagePack => "MessagePack",
        }
    }
}

impl Codec for SerializationFormat {
    fn marshal<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Json => {
                serde_json::to_vec(value).map_err(|e| NetError::Serialize(e.to_string()))
            }
            SerializationFormat::Bincode => {
                bincode::serialize(value).map_err(|e| NetError::Serialize(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::to_vec(value).map_err(|e| NetError::Serialize(e.to_string()))
            }
        }
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Json => {
                serde_json::from_slice(data).map_err(|e| NetError::Deserialize(e.to_string()))
            }
            SerializationFormat::Bincode => {
                bincode::deserialize(data).map_err(|e| NetError::Deserialize(e.to_string()))
            }
            SerializationFormat::MessagePack => {
                rmp_serde::from_slice(data).map_err(|e| NetError::Deserialize(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: u64,
        symbol: String,
        qty: i32,
    }

    fn sample() -> Order {
        Order {
            id: 17,
            symbol: "ABC".into(),
            qty: -3,
        }
    }

    #[test]
    fn test_default_format() {
        assert_eq!(SerializationFormat::default(), SerializationFormat::Json);
    }

    #[test]
    fn test_format_names() {
        assert_eq!(SerializationFormat::Bincode.name(), "Bincode");
        assert_eq!(SerializationFormat::Json.name(), "JSON");
        assert_eq!(SerializationFormat::MessagePack.name(), "MessagePack");
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_every_format_restores_value() {
        for format in [
            SerializationFormat::Json,
            SerializationFormat::Bincode,
            SerializationFormat::MessagePack,
        ] {
            let bytes = format.marshal(&sample()).expect("marshal");
            let back: Order = format.unmarshal(&bytes).expect("unmarshal");
            assert_eq!(back, sample(), "{}", format.name());
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn test_json_is_readable() {
        let bytes = SerializationFormat::Json.marshal(&sample()).expect("marshal");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("\"symbol\":\"ABC\""));
    }

    #[test]
    fn test_garbage_is_deserialize_error() {
        let res: Result<Order> = SerializationFormat::Json.unmarshal(b"{not json");
        assert!(matches!(res, Err(NetError::Deserialize(_))));
    }
}
