//! Error types for the client core

use crate::control::ChannelState;
use std::time::Duration;
use thiserror::Error;
use tunlink_proto::{CodecError, DecodeError};
use tunlink_transport::TransportError;

/// How a control-channel failure is treated by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Network trouble; retried with backoff
    Transient,
    /// Broker sent something we cannot process; ends the generation, retried
    Protocol,
    /// Broker rejected our credentials; retried a bounded number of times
    Auth,
}

/// Failure of a single control-channel generation
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] CodecError),

    #[error("Failed to decode message: {0}")]
    Decode(#[from] DecodeError),

    #[error("Timed out after {1:?} waiting for {0}")]
    Timeout(&'static str, Duration),

    #[error("Connection closed by broker")]
    Closed,

    #[error("Unexpected {kind} message while {state}")]
    Unexpected {
        kind: &'static str,
        state: ChannelState,
    },

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Heartbeat timeout: {0} pongs missed")]
    HeartbeatTimeout(u32),

    #[error("Tunnel request {0} was not answered in time")]
    TunnelRequestTimeout(u64),

    #[error("Control writer stopped unexpectedly")]
    WriterStopped,
}

impl ControlError {
    pub fn kind(&self) -> FaultKind {
        match self {
            ControlError::AuthRejected(_) => FaultKind::Auth,
            ControlError::Transport(TransportError::ProtocolError(_))
            | ControlError::Encode(_)
            | ControlError::Decode(_)
            | ControlError::Unexpected { .. }
            | ControlError::TunnelRequestTimeout(_) => FaultKind::Protocol,
            ControlError::Transport(_)
            | ControlError::Timeout(..)
            | ControlError::Closed
            | ControlError::HeartbeatTimeout(_)
            | ControlError::WriterStopped => FaultKind::Transient,
        }
    }
}

/// Auth token provider failure
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("No auth token configured")]
    Missing,

    #[error("Token provider failed: {0}")]
    Provider(String),
}

/// Errors surfaced by [`crate::TunnelClient`]
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Auth token unavailable: {0}")]
    Token(#[from] TokenError),

    #[error("Authentication failed {attempts} times: {reason}")]
    AuthenticationFailed { attempts: u32, reason: String },

    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(usize),

    #[error("Client task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<TransportError> for TunnelError {
    fn from(e: TransportError) -> Self {
        TunnelError::Config(e.to_string())
    }
}
