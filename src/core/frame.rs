//! Frame layout and the raw encode/decode pair.
//!
//! ```text
//! [body_len u32 LE][cmd u32 LE][ext u64 LE][body]
//! ```
//!
//! Bit 31 of `cmd` marks a compressed body. The low 24 bits are the user
//! command space; ids above that are reserved for engine-internal frames.

use crate::error::{FrameError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the fixed frame header
pub const HEAD_LEN: usize = 16;

/// Compression flag carried in the command id
pub const CMD_FLAG_COMPRESSED: u32 = 0x8000_0000;

/// Highest command id available to applications
pub const CMD_USER_MAX: u32 = 0x00FF_FFFF;

pub const CMD_PING: u32 = 0x0100_0000;
pub const CMD_PING_ACK: u32 = 0x0100_0001;
pub const CMD_SET_REAL_IP: u32 = 0x0100_0002;
pub const CMD_RPC_METHOD: u32 = 0x0100_0003;
pub const CMD_RPC_ERROR: u32 = 0x0100_0004;

/// A single framed message.
///
/// The body length is always `body.len()`, so a frame cannot disagree with
/// its own header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Frame {
    pub cmd: u32,
    pub ext: u64,
    pub body: Bytes,
}

impl Frame {
    pub fn new(cmd: u32, ext: u64, body: impl Into<Bytes>) -> Self {
        Self {
            cmd,
            ext,
            body: body.into(),
        }
    }

    /// A frame with no body
    pub fn empty(cmd: u32, ext: u64) -> Self {
        Self {
            cmd,
            ext,
            body: Bytes::new(),
        }
    }

    /// Header value for the body length; `None` once the body outgrows 32 bits
    #[inline]
    pub fn body_len(&self) -> Option<u32> {
        u32::try_from(self.body.len()).ok()
    }

    /// Command id with the compression flag cleared
    #[inline]
    pub fn command(&self) -> u32 {
        self.cmd & !CMD_FLAG_COMPRESSED
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.cmd & CMD_FLAG_COMPRESSED != 0
    }

    /// Total encoded size
    #[inline]
    pub fn wire_len(&self) -> usize {
        HEAD_LEN + self.body.len()
    }

    /// Serialize header and body into a freshly allocated buffer
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut dst = BytesMut::with_capacity(self.wire_len());
        self.write_to(&mut dst)?;
        Ok(dst.freeze())
    }

    pub(crate) fn write_to(&self, dst: &mut BytesMut) -> Result<()> {
        let body_len = self.body_len().ok_or(FrameError::TooLarge {
            len: self.body.len(),
            max: u32::MAX as usize,
        })?;
        dst.reserve(self.wire_len());
        dst.put_u32_le(body_len);
        dst.put_u32_le(self.cmd);
        dst.put_u64_le(self.ext);
        dst.extend_from_slice(&self.body);
        Ok(())
    }
}

/// True for ids the engine handles itself
#[inline]
pub fn is_reserved(cmd: u32) -> bool {
    cmd & !CMD_FLAG_COMPRESSED > CMD_USER_MAX
}

/// Encode a frame to its wire representation.
///
/// Fails with [`FrameError::TooLarge`] if the body length does not fit the
/// 32-bit header field.
pub fn encode(cmd: u32, ext: u64, body: &[u8]) -> Result<Bytes> {
    let body_len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    let mut dst = BytesMut::with_capacity(HEAD_LEN + body.len());
    dst.put_u32_le(body_len);
    dst.put_u32_le(cmd);
    dst.put_u64_le(ext);
    dst.extend_from_slice(body);
    Ok(dst.freeze())
}

/// Parsed header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub body_len: usize,
    pub cmd: u32,
    pub ext: u64,
}

/// Read and validate a header without consuming `src`.
pub(crate) fn peek_header(src: &[u8], max_packet_len: usize) -> std::result::Result<Header, FrameError> {
    if src.len() < HEAD_LEN {
        return Err(FrameError::TooShort(src.len()));
    }
    let mut head = &src[..HEAD_LEN];
    let body_len = head.get_u32_le() as usize;
    let cmd = head.get_u32_le();
    let ext = head.get_u64_le();
    if body_len > max_packet_len {
        return Err(FrameError::TooLarge {
            len: body_len,
            max: max_packet_len,
        });
    }
    Ok(Header { body_len, cmd, ext })
}

/// Decode one complete frame from `src`.
///
/// Trailing bytes after the declared body are ignored.
pub fn decode(src: &[u8], max_packet_len: usize) -> Result<Frame> {
    let header = peek_header(src, max_packet_len)?;
    let actual = src.len() - HEAD_LEN;
    if actual < header.body_len {
        return Err(FrameError::Truncated {
            declared: header.body_len,
            actual,
        }
        .into());
    }
    Ok(Frame {
        cmd: header.cmd,
        ext: header.ext,
        body: Bytes::copy_from_slice(&src[HEAD_LEN..HEAD_LEN + header.body_len]),
    })
}
