//! Whole-frame transforms applied between the codec and the socket.
//!
//! A connection calls `encrypt` from its write loop and `decrypt` from its
//! read loop, passing that direction's sequence number and key. Each
//! direction is owned by exactly one loop, so a cipher sees frames in wire
//! order.

use crate::config::{TransportConfig, COMPRESSION_THRESHOLD, MAX_PACKET_LEN};
use crate::core::frame::{Frame, CMD_FLAG_COMPRESSED};
use crate::error::Result;
use crate::utils::compression::{self, CompressionKind};
use std::sync::Arc;

/// Pluggable frame transform.
pub trait Cipher: Send + Sync + 'static {
    /// Reset any per-session state. Called on attach and after every reconnect.
    fn init(&self);

    fn encrypt(&self, seq: u64, key: u32, frame: Frame) -> Result<Frame>;

    fn decrypt(&self, seq: u64, key: u32, frame: Frame) -> Result<Frame>;
}

/// Builds one cipher per connection
pub type CipherFactory = Arc<dyn Fn() -> Box<dyn Cipher> + Send + Sync>;

/// Cipher that leaves frames untouched
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCipher;

impl Cipher for NoopCipher {
    fn init(&self) {}

    fn encrypt(&self, _seq: u64, _key: u32, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }

    fn decrypt(&self, _seq: u64, _key: u32, frame: Frame) -> Result<Frame> {
        Ok(frame)
    }
}

/// Compresses bodies longer than a threshold and flags them with bit 31.
#[derive(Debug, Clone, Copy)]
pub struct CompressionCipher {
    kind: CompressionKind,
    threshold: Option<usize>,
    max_packet_len: usize,
}

impl CompressionCipher {
    /// Compress bodies longer than `threshold` bytes. `None` disables
    /// compression on send but still inflates flagged frames on receive.
    pub fn new(kind: CompressionKind, threshold: Option<usize>) -> Self {
        Self {
            kind,
            threshold,
            max_packet_len: MAX_PACKET_LEN,
        }
    }

    /// Bound on inflated body size
    pub fn with_max_packet_len(mut self, max_packet_len: usize) -> Self {
        self.max_packet_len = max_packet_len;
        self
    }

    pub fn from_config(cfg: &TransportConfig) -> Self {
        let threshold = cfg.compression_enabled.then_some(cfg.compression_threshold);
        Self::new(cfg.compression_kind, threshold).with_max_packet_len(cfg.max_packet_len)
    }
}

impl Default for CompressionCipher {
    fn default() -> Self {
        Self::new(CompressionKind::Lz4, Some(COMPRESSION_THRESHOLD))
    }
}

impl Cipher for CompressionCipher {
    fn init(&self) {}

    fn encrypt(&self, _seq: u64, _key: u32, mut frame: Frame) -> Result<Frame> {
        match self.threshold {
            Some(threshold) if frame.body.len() > threshold => {
                frame.body = compression::compress(&frame.body, self.kind)?.into();
                frame.cmd |= CMD_FLAG_COMPRESSED;
            }
            _ => frame.cmd &= !CMD_FLAG_COMPRESSED,
        }
        Ok(frame)
    }

    fn decrypt(&self, _seq: u64, _key: u32, mut frame: Frame) -> Result<Frame> {
        if frame.is_compressed() {
            frame.body = compression::decompress(&frame.body, self.kind, self.max_packet_len)?.into();
            frame.cmd &= !CMD_FLAG_COMPRESSED;
        }
        Ok(frame)
    }
}

/// Factory installing the cipher described by `cfg`.
///
/// Always a [`CompressionCipher`]: with compression disabled it never
/// compresses on send but still inflates flagged frames from peers that do.
pub fn cipher_factory(cfg: &TransportConfig) -> CipherFactory {
    let cipher = CompressionCipher::from_config(cfg);
    Arc::new(move || Box::new(cipher) as Box<dyn Cipher>)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NetError;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_small_body_passes_through() {
        let cipher = CompressionCipher::new(CompressionKind::Lz4, Some(16));
        let frame = Frame::new(5, 1, &b"short"[..]);
        let out = cipher.encrypt(0, 0, frame.clone()).unwrap();
        assert_eq!(out, frame);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_large_body_is_flagged_and_restored() {
        let cipher = CompressionCipher::new(CompressionKind::Lz4, Some(16));
        let frame = Frame::new(5, 9, vec![b'x'; 4096]);
        let sealed = cipher.encrypt(0, 0, frame.clone()).unwrap();
        assert!(sealed.is_compressed());
        assert_eq!(sealed.command(), 5);
        assert!(sealed.body.len() < 4096);

        let opened = cipher.decrypt(0, 0, sealed).unwrap();
        assert_eq!(opened, frame);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_threshold_boundary_is_exclusive() {
        let cipher = CompressionCipher::new(CompressionKind::Zstd, Some(32));
        let at = cipher.encrypt(0, 0, Frame::new(1, 0, vec![0u8; 32])).unwrap();
        assert!(!at.is_compressed());
        let over = cipher.encrypt(0, 0, Frame::new(1, 0, vec![0u8; 33])).unwrap();
        assert!(over.is_compressed());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_disabled_threshold_still_inflates() {
        let sender = CompressionCipher::new(CompressionKind::Lz4, Some(0));
        let receiver = CompressionCipher::new(CompressionKind::Lz4, None);
        let sealed = sender.encrypt(0, 0, Frame::new(3, 0, vec![1u8; 256])).unwrap();
        let opened = receiver.decrypt(0, 0, sealed).unwrap();
        assert_eq!(opened.body.len(), 256);
        assert_eq!(opened.cmd, 3);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_default_factory_inflates_but_never_compresses() {
        let cfg = TransportConfig::default();
        assert!(!cfg.compression_enabled);
        let cipher = cipher_factory(&cfg)();

        let plain = cipher.encrypt(0, 0, Frame::new(7, 0, vec![b'z'; 64 * 1024])).unwrap();
        assert!(!plain.is_compressed());
        assert_eq!(plain.body.len(), 64 * 1024);

        let sender = CompressionCipher::new(CompressionKind::Lz4, Some(0));
        let sealed = sender.encrypt(0, 0, Frame::new(7, 1, vec![b'z'; 4096])).unwrap();
        assert_eq!(sealed.cmd, 7 | CMD_FLAG_COMPRESSED);
        let opened = cipher.decrypt(0, 0, sealed).unwrap();
        assert_eq!(opened.cmd, 7);
        assert_eq!(opened.body.len(), 4096);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_inflate_is_bounded() {
        let sender = CompressionCipher::new(CompressionKind::Lz4, Some(0));
        let receiver = CompressionCipher::new(CompressionKind::Lz4, None).with_max_packet_len(100);
        let sealed = sender.encrypt(0, 0, Frame::new(3, 0, vec![1u8; 256])).unwrap();
        assert!(matches!(
            receiver.decrypt(0, 0, sealed),
            Err(NetError::DecompressionFailure)
        ));
    }
}
