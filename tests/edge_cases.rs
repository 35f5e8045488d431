#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! Boundary conditions for framing, compression, ciphers and the timer

use bytes::BytesMut;
use framelink::core::cipher::{Cipher, CompressionCipher};
use framelink::core::codec::FrameCodec;
use framelink::core::frame::{
    decode, encode, is_reserved, Frame, CMD_FLAG_COMPRESSED, CMD_PING, CMD_RPC_ERROR,
    CMD_USER_MAX, HEAD_LEN,
};
use framelink::error::{FrameError, NetError};
use framelink::timer::Timer;
use framelink::utils::compression::{compress, decompress, CompressionKind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::codec::{Decoder, Encoder};

// ============================================================================
// FRAME CODEC EDGE CASES
// ============================================================================

#[test]
fn test_frame_empty_body() {
    let bytes = encode(1, 0, &[]).unwrap();
    assert_eq!(bytes.len(), HEAD_LEN);
    let frame = decode(&bytes, 0).expect("zero limit still admits empty bodies");
    assert!(frame.body.is_empty());
}

#[test]
fn test_frame_body_exactly_at_limit() {
    let bytes = encode(1, 0, &[7u8; 1024]).unwrap();
    assert!(decode(&bytes, 1024).is_ok());
    assert!(matches!(
        decode(&bytes, 1023),
        Err(NetError::Protocol(FrameError::TooLarge { len: 1024, max: 1023 }))
    ));
}

#[test]
fn test_codec_rejects_oversized_header_before_body_arrives() {
    let mut codec = FrameCodec::new(100);
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&(1_000_000u32).to_le_bytes());
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());

    let err = codec.decode(&mut buf).unwrap_err();
    assert!(err.is_connection_fatal());
    assert!(matches!(err, NetError::Protocol(FrameError::TooLarge { .. })));
}

#[test]
fn test_codec_refuses_to_encode_oversized_body() {
    let mut codec = FrameCodec::new(8);
    let mut buf = BytesMut::new();
    let err = codec.encode(Frame::new(1, 0, vec![0u8; 9]), &mut buf).unwrap_err();
    assert!(matches!(err, NetError::Protocol(FrameError::TooLarge { len: 9, max: 8 })));
    assert!(buf.is_empty());
}

#[test]
fn test_codec_byte_at_a_time() {
    let frame = Frame::new(0x00AB_CDEF, u64::MAX, "drip");
    let wire = frame.to_bytes().unwrap();
    let mut codec = FrameCodec::default();
    let mut buf = BytesMut::new();
    let mut out = None;
    for b in wire.iter() {
        assert!(out.is_none());
        buf.extend_from_slice(&[*b]);
        out = codec.decode(&mut buf).unwrap();
    }
    assert_eq!(out, Some(frame));
}

#[test]
fn test_decode_ignores_trailing_bytes() {
    let mut bytes = encode(3, 4, b"body").unwrap().to_vec();
    bytes.extend_from_slice(b"trailing");
    let frame = decode(&bytes, 1024).unwrap();
    assert_eq!(&frame.body[..], b"body");
}

#[test]
fn test_reserved_command_space() {
    assert!(!is_reserved(0));
    assert!(!is_reserved(CMD_USER_MAX));
    assert!(is_reserved(CMD_USER_MAX + 1));
    assert!(is_reserved(CMD_PING));
    assert!(is_reserved(CMD_RPC_ERROR));
    // The compression flag alone does not make a command reserved
    assert!(!is_reserved(5 | CMD_FLAG_COMPRESSED));
}

// ============================================================================
// COMPRESSION EDGE CASES
// ============================================================================

#[test]
fn test_compression_empty_data() {
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let packed = compress(&[], kind).expect("compress empty");
        let unpacked = decompress(&packed, kind, 16).expect("decompress empty");
        assert!(unpacked.is_empty());
    }
}

#[test]
fn test_compression_highly_repetitive_data() {
    let repetitive = vec![0xAA; 1_000_000];
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let packed = compress(&repetitive, kind).expect("compress");
        assert!(packed.len() < repetitive.len() / 10);
        let unpacked = decompress(&packed, kind, repetitive.len()).expect("decompress");
        assert_eq!(unpacked, repetitive);
    }
}

#[test]
fn test_decompression_respects_limit() {
    let data = vec![0u8; 10_000];
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let packed = compress(&data, kind).expect("compress");
        assert!(matches!(
            decompress(&packed, kind, 9_999),
            Err(NetError::DecompressionFailure)
        ));
        assert!(decompress(&packed, kind, 10_000).is_ok());
    }
}

#[test]
fn test_decompression_of_garbage_fails_cleanly() {
    let garbage = [0xFFu8; 64];
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        assert!(decompress(&garbage, kind, 1 << 20).is_err());
    }
}

#[test]
fn test_cipher_rejects_corrupt_compressed_frame() {
    let cipher = CompressionCipher::default();
    let frame = Frame::new(2 | CMD_FLAG_COMPRESSED, 0, vec![0xFFu8; 64]);
    assert!(matches!(
        cipher.decrypt(0, 0, frame),
        Err(NetError::DecompressionFailure)
    ));
}

// ============================================================================
// TIMER EDGE CASES
// ============================================================================

#[test]
fn test_timer_zero_delay_fires() {
    let timer = Timer::new("edge-zero");
    let (tx, rx) = std::sync::mpsc::channel();
    timer.once(Duration::ZERO, move || {
        let _ = tx.send(());
    });
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
}

#[test]
fn test_timer_cancel_after_fire_is_noop() {
    let timer = Timer::new("edge-stale");
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let id = timer.once(Duration::ZERO, move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(100));
    timer.cancel(id);
    timer.reset(id, Duration::from_millis(10));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(timer.is_empty());
}

#[test]
fn test_timer_schedule_after_stop_is_dropped() {
    let timer = Timer::new("edge-stopped");
    timer.stop();
    timer.stop();
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    timer.once(Duration::ZERO, move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(hits.load(Ordering::SeqCst), 0);
    assert_eq!(timer.len(), 0);
}

#[test]
fn test_timer_callback_can_cancel_itself_via_handle() {
    let timer = Arc::new(Timer::new("edge-self-cancel"));
    let hits = Arc::new(AtomicUsize::new(0));
    let slot: Arc<std::sync::Mutex<Option<framelink::TimerId>>> = Arc::default();

    let (t, h, s) = (Arc::downgrade(&timer), hits.clone(), slot.clone());
    let id = timer.schedule(Duration::ZERO, Duration::from_millis(5), 0, move || {
        if h.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            if let (Some(timer), Some(id)) = (t.upgrade(), *s.lock().unwrap()) {
                timer.cancel(id);
            }
        }
    });
    *slot.lock().unwrap() = Some(id);

    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}
