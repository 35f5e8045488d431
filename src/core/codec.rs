//! Tokio codec for framing over byte streams.
//!
//! Decoding waits for a full header, validates the declared body length
//! against the configured limit, then waits for the full body. The body is
//! split off the read buffer without copying.

use crate::config::MAX_PACKET_LEN;
use crate::core::frame::{peek_header, Frame, HEAD_LEN};
use crate::error::{FrameError, NetError};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_packet_len: usize,
}

impl FrameCodec {
    pub fn new(max_packet_len: usize) -> Self {
        Self { max_packet_len }
    }

    pub fn max_packet_len(&self) -> usize {
        self.max_packet_len
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_LEN)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match peek_header(src, self.max_packet_len) {
            Ok(h) => h,
            Err(FrameError::TooShort(_)) => {
                src.reserve(HEAD_LEN - src.len());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let total = HEAD_LEN + header.body_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEAD_LEN);
        let body = src.split_to(header.body_len).freeze();
        Ok(Some(Frame {
            cmd: header.cmd,
            ext: header.ext,
            body,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = NetError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.body.len() > self.max_packet_len {
            return Err(FrameError::TooLarge {
                len: item.body.len(),
                max: self.max_packet_len,
            }
            .into());
        }
        item.write_to(dst)
    }
}
