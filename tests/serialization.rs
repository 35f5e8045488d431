//! Integration tests for payload serialization formats
//!
//! Covers the `Codec` implementation of `SerializationFormat` for JSON
//! (default, interop), Bincode and MessagePack.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use framelink::core::serialization::{Codec, SerializationFormat};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Event {
    Ping,
    Echo(String),
    Move { x: i32, y: i32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    id: u64,
    events: Vec<Event>,
    tags: BTreeMap<String, String>,
    blob: Vec<u8>,
}

fn envelope() -> Envelope {
    let mut tags = BTreeMap::new();
    tags.insert("region".to_string(), "eu-west".to_string());
    Envelope {
        id: 42,
        events: vec![
            Event::Ping,
            Event::Echo("Hello, 世界!".to_string()),
            Event::Move { x: -3, y: 9 },
        ],
        tags,
        blob: (0..=255).collect(),
    }
}

const ALL: [SerializationFormat; 3] = [
    SerializationFormat::Json,
    SerializationFormat::Bincode,
    SerializationFormat::MessagePack,
];

#[test]
fn test_every_format_restores_value() {
    let value = envelope();
    for format in ALL {
        let bytes = format.marshal(&value).expect("Failed to serialize");
        let recovered: Envelope = format.unmarshal(&bytes).expect("Failed to deserialize");
        assert_eq!(value, recovered, "{} round trip", format.name());
    }
}

#[test]
fn test_default_is_json() {
    assert_eq!(SerializationFormat::default(), SerializationFormat::Json);
    let bytes = SerializationFormat::default().marshal(&Event::Echo("hi".into())).unwrap();
    assert_eq!(String::from_utf8(bytes).unwrap(), r#"{"Echo":"hi"}"#);
}

#[test]
fn test_format_names() {
    assert_eq!(SerializationFormat::Json.name(), "JSON");
    assert_eq!(SerializationFormat::Bincode.name(), "Bincode");
    assert_eq!(SerializationFormat::MessagePack.name(), "MessagePack");
}

#[test]
fn test_binary_formats_are_smaller_than_json() {
    let value = envelope();
    let json = SerializationFormat::Json.marshal(&value).unwrap().len();
    let msgpack = SerializationFormat::MessagePack.marshal(&value).unwrap().len();
    assert!(msgpack < json, "msgpack {msgpack} >= json {json}");
}

#[test]
fn test_unsized_payload() {
    let text: &str = "borrowed";
    for format in ALL {
        let bytes = format.marshal(text).unwrap();
        let back: String = format.unmarshal(&bytes).unwrap();
        assert_eq!(back, text);
    }
}

#[test]
fn test_garbage_fails_without_panic() {
    let garbage = [0xC1u8, 0xFF, 0x00];
    for format in ALL {
        let res: framelink::Result<Envelope> = format.unmarshal(&garbage);
        assert!(matches!(res, Err(framelink::NetError::Deserialize(_))));
    }
}

#[test]
fn test_format_in_toml_config() {
    #[derive(Serialize, Deserialize)]
    struct Holder {
        codec: SerializationFormat,
    }
    let text = toml::to_string(&Holder {
        codec: SerializationFormat::MessagePack,
    })
    .unwrap();
    assert!(text.contains("messagepack"));
    let back: Holder = toml::from_str(&text).unwrap();
    assert_eq!(back.codec, SerializationFormat::MessagePack);
}
