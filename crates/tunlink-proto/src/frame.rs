//! Length-prefixed transport framing
//!
//! Format: `[length: u32 big-endian][body]`. One body carries one encoded
//! [`crate::Message`] on control channels, or one chunk of raw bytes on proxy
//! channels after the initial `RegProxy`.

use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length of the frame header
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// `tokio_util` codec for length-prefixed frames
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encode a single frame into a fresh buffer
    pub fn encode_frame(body: &[u8]) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
        FrameCodec.encode(Bytes::copy_from_slice(body), &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a buffer that must contain exactly one complete frame
    ///
    /// Returns `None` if the buffer is short or has bytes past the frame.
    pub fn decode_exact(data: &[u8]) -> Result<Option<Bytes>, FrameError> {
        let mut buf = BytesMut::from(data);
        match FrameCodec.decode(&mut buf)? {
            Some(body) if buf.is_empty() => Ok(Some(body)),
            _ => Ok(None),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(body.len()));
        }

        dst.reserve(FRAME_HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.extend_from_slice(&body);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length header
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; FRAME_HEADER_LEN];
        length_bytes.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }

        if src.len() < FRAME_HEADER_LEN + length {
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}
