#![allow(clippy::unwrap_used)]

use bytes::BytesMut;
use framelink::core::cipher::{Cipher, CompressionCipher};
use framelink::core::codec::FrameCodec;
use framelink::core::frame::{decode, Frame};
use framelink::utils::compression::CompressionKind;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn stress_frame_encode_decode_large_series() {
    // Heavy burst of frames; nothing may panic or leak into the next frame
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();

    for size in [0usize, 1, 64, 512, 4096, 65536, 1_048_576] {
        for i in 0..200u64 {
            codec.encode(Frame::new(1, i, vec![0u8; size]), &mut buf).unwrap();
            let decoded = decode(&buf, usize::MAX).unwrap();
            assert_eq!(decoded.body.len(), size);
            buf.clear();
        }
    }
}

#[test]
fn stress_pipelined_stream() {
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();
    for i in 0..10_000u64 {
        codec
            .encode(Frame::new((i % 100) as u32, i, i.to_le_bytes().to_vec()), &mut buf)
            .unwrap();
    }

    let mut next = 0u64;
    while let Some(frame) = codec.decode(&mut buf).unwrap() {
        assert_eq!(frame.ext, next);
        assert_eq!(&frame.body[..], &next.to_le_bytes());
        next += 1;
    }
    assert_eq!(next, 10_000);
}

#[test]
fn stress_compression_cipher_series() {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let cipher = CompressionCipher::new(kind, Some(256));
        for i in 0..500u64 {
            let body: Vec<u8> = (0..(i as usize * 37) % 8192).map(|b| (b % 13) as u8).collect();
            let frame = Frame::new(3, i, body);
            let sealed = cipher.encrypt(i, 0, frame.clone()).unwrap();
            assert_eq!(cipher.decrypt(i, 0, sealed).unwrap(), frame);
        }
    }
}

#[test]
fn stress_random_chunked_delivery() {
    use rand::Rng;

    let mut rng = rand::rng();
    let mut codec = FrameCodec::default();
    let mut wire = BytesMut::new();
    let mut sent = Vec::new();
    for i in 0..2_000u64 {
        let mut body = vec![0u8; rng.random_range(0..2048)];
        rng.fill(&mut body[..]);
        let frame = Frame::new(rng.random_range(0..=framelink::CMD_USER_MAX), i, body);
        codec.encode(frame.clone(), &mut wire).unwrap();
        sent.push(frame);
    }

    // Deliver the stream in random-sized reads
    let mut inbox = BytesMut::new();
    let mut received = Vec::new();
    while !wire.is_empty() {
        let n = rng.random_range(1..=4096).min(wire.len());
        inbox.extend_from_slice(&wire.split_to(n));
        while let Some(frame) = codec.decode(&mut inbox).unwrap() {
            received.push(frame);
        }
    }
    assert!(inbox.is_empty());
    assert_eq!(received, sent);
}
