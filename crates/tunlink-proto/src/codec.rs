//! Codec for encoding/decoding control messages
//!
//! Format: `[tag: u8][payload: bincode]`. The tag selects the payload type;
//! the payload is the variant's struct with its fields in declaration order.
//! Length-prefixing for the transport is handled by [`crate::frame::FrameCodec`].

use crate::messages::*;
use crate::MAX_FRAME_SIZE;
use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::trace;

/// Encoding errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),
}

/// Decoding errors
///
/// Both variants are fatal to the control-channel generation that produced
/// the frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Unknown message type tag: {0}")]
    UnknownType(u8),

    #[error("Malformed {kind} payload: {reason}")]
    Malformed { kind: &'static str, reason: String },
}

impl DecodeError {
    fn malformed(kind: &'static str, reason: impl ToString) -> Self {
        DecodeError::Malformed {
            kind,
            reason: reason.to_string(),
        }
    }
}

/// Wire tags, one per [`Message`] variant
pub mod tags {
    pub const AUTH: u8 = 1;
    pub const AUTH_RESP: u8 = 2;
    pub const REQ_TUNNEL: u8 = 3;
    pub const NEW_TUNNEL: u8 = 4;
    pub const REQ_PROXY: u8 = 5;
    pub const REG_PROXY: u8 = 6;
    pub const PING: u8 = 7;
    pub const PONG: u8 = 8;
    pub const ERROR: u8 = 9;
    pub const TUNNEL_CLOSED: u8 = 10;

    /// Highest assigned tag
    pub const MAX_TAG: u8 = TUNNEL_CLOSED;
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .reject_trailing_bytes()
}

/// Control message codec
pub struct MessageCodec;

impl MessageCodec {
    /// Wire tag for a message
    pub fn tag(msg: &Message) -> u8 {
        match msg {
            Message::Auth(_) => tags::AUTH,
            Message::AuthResp(_) => tags::AUTH_RESP,
            Message::ReqTunnel(_) => tags::REQ_TUNNEL,
            Message::NewTunnel(_) => tags::NEW_TUNNEL,
            Message::ReqProxy(_) => tags::REQ_PROXY,
            Message::RegProxy(_) => tags::REG_PROXY,
            Message::Ping(_) => tags::PING,
            Message::Pong(_) => tags::PONG,
            Message::Error(_) => tags::ERROR,
            Message::TunnelClosed(_) => tags::TUNNEL_CLOSED,
        }
    }

    /// Encode a message to its tagged binary form
    pub fn encode(msg: &Message) -> Result<Bytes, CodecError> {
        let payload = match msg {
            Message::Auth(p) => options().serialize(p)?,
            Message::AuthResp(p) => options().serialize(p)?,
            Message::ReqTunnel(p) => options().serialize(p)?,
            Message::NewTunnel(p) => options().serialize(p)?,
            Message::ReqProxy(p) => options().serialize(p)?,
            Message::RegProxy(p) => options().serialize(p)?,
            Message::Ping(p) => options().serialize(p)?,
            Message::Pong(p) => options().serialize(p)?,
            Message::Error(p) => options().serialize(p)?,
            Message::TunnelClosed(p) => options().serialize(p)?,
        };

        if payload.len() + 1 > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len() + 1));
        }

        let mut buf = BytesMut::with_capacity(1 + payload.len());
        buf.put_u8(Self::tag(msg));
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one complete tagged message
    ///
    /// The buffer must hold exactly one message; trailing bytes are treated
    /// as corruption.
    pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
        let (&tag, payload) = buf
            .split_first()
            .ok_or_else(|| DecodeError::malformed("empty", "frame has no type tag"))?;

        trace!("Decoding tag {} ({} payload bytes)", tag, payload.len());

        match tag {
            tags::AUTH => payload_of("Auth", payload).map(Message::Auth),
            tags::AUTH_RESP => payload_of("AuthResp", payload).map(Message::AuthResp),
            tags::REQ_TUNNEL => payload_of("ReqTunnel", payload).map(Message::ReqTunnel),
            tags::NEW_TUNNEL => payload_of("NewTunnel", payload).map(Message::NewTunnel),
            tags::REQ_PROXY => payload_of("ReqProxy", payload).map(Message::ReqProxy),
            tags::REG_PROXY => payload_of("RegProxy", payload).map(Message::RegProxy),
            tags::PING => payload_of("Ping", payload).map(Message::Ping),
            tags::PONG => payload_of("Pong", payload).map(Message::Pong),
            tags::ERROR => payload_of("Error", payload).map(Message::Error),
            tags::TUNNEL_CLOSED => payload_of("TunnelClosed", payload).map(Message::TunnelClosed),
            unknown => Err(DecodeError::UnknownType(unknown)),
        }
    }
}

fn payload_of<T: DeserializeOwned>(kind: &'static str, payload: &[u8]) -> Result<T, DecodeError> {
    options()
        .deserialize(payload)
        .map_err(|e| DecodeError::malformed(kind, e))
}

/// Serialize any payload with the wire options (used by tests and tools that
/// need to hand-craft frames)
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, CodecError> {
    Ok(options().serialize(payload)?)
}
