//! Transport abstraction for broker connections
//!
//! The client core talks to the broker through two kinds of framed,
//! bidirectional connections: one long-lived control channel per generation
//! and one short-lived proxy channel per relayed connection. This crate
//! defines the object-safe traits the core depends on and the concrete
//! connectors that implement them.
//!
//! ```text
//!        client core (control loop, proxy multiplexer)
//!                          │ Connector / FrameSink / FrameSource
//!       ┌──────────────────┼──────────────────┐
//!   WebSocketConnector  TcpConnector   MemoryConnector
//!    (ws://, wss://)    (tcp://)       (in-process)
//! ```

pub mod endpoint;
pub mod framed;
pub mod memory;
pub mod tcp;
pub mod websocket;

pub use endpoint::{connector_for_endpoint, Endpoint};
pub use framed::framed_connection;
pub use memory::{memory_transport, Accepted, MemoryConnector, MemoryListener};
pub use tcp::TcpConnector;
pub use websocket::WebSocketConnector;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt::{self, Debug};
use thiserror::Error;
use tunlink_proto::FrameError;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Connection closed")]
    Closed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),
}

impl From<FrameError> for TransportError {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(io) => TransportError::IoError(io),
            other => TransportError::ProtocolError(other.to_string()),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Which broker channel a connection serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// The per-generation control channel (handshake, registration, signaling)
    Control,
    /// A per-connection data channel, bound by an initial `RegProxy`
    Proxy,
}

/// Writing half of a framed connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame body
    async fn send(&mut self, frame: Bytes) -> TransportResult<()>;

    /// Close the writing side; the peer's source ends after pending frames
    async fn close(&mut self) -> TransportResult<()>;
}

/// Reading half of a framed connection
#[async_trait]
pub trait FrameSource: Send {
    /// Receive the next frame body
    ///
    /// Returns `None` once the peer has closed the connection gracefully.
    async fn recv(&mut self) -> TransportResult<Option<Bytes>>;
}

/// An established connection, already split so each half can be owned by a
/// different task
pub struct FramedConnection {
    /// Identifier for logging
    pub id: String,
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Debug for FramedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FramedConnection")
            .field("id", &self.id)
            .finish()
    }
}

/// Client-side: establishes outgoing connections to the broker
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Open a new connection for the given channel kind
    async fn connect(&self, kind: ChannelKind) -> TransportResult<FramedConnection>;

    /// Human-readable broker address, for logs
    fn describe(&self) -> String;
}
