//! Tunnel client core
//!
//! Keeps a control channel to a tunnel broker alive, registers the
//! configured tunnels on every (re)connect and relays one byte stream per
//! inbound proxy request to the local service.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tunlink_client::{
//!     ClientConfig, ClientContext, StaticToken, TracingSink, TunnelClient, TunnelSpec,
//! };
//! use tunlink_proto::TunnelProtocol;
//!
//! # async fn run() -> Result<(), tunlink_client::TunnelError> {
//! let config = ClientConfig::builder()
//!     .server_endpoint("localhost:6400")
//!     .tunnel(TunnelSpec::new(TunnelProtocol::Http, 3000))
//!     .build()?;
//! let ctx = ClientContext::new(
//!     config,
//!     Arc::new(StaticToken::new("my-token")),
//!     Arc::new(TracingSink),
//! )?;
//!
//! let client = TunnelClient::start(ctx)?;
//! tokio::signal::ctrl_c().await.ok();
//! client.shutdown();
//! client.wait().await
//! # }
//! ```

pub mod config;
pub mod context;
pub mod control;
pub mod error;
pub mod events;
pub mod proxy;
pub mod reconnect;
pub mod registry;
pub mod supervisor;

pub use config::{ClientConfig, ClientConfigBuilder, Timeouts, TunnelSpec};
pub use context::{ClientContext, StaticToken, TokenProvider};
pub use control::{ChannelState, ControlChannel, GenerationOutcome, GenerationReport};
pub use error::{ControlError, FaultKind, TokenError, TunnelError};
pub use events::{ClientEvent, EventSink, NullSink, TracingSink};
pub use proxy::{ProxyDecision, ProxyMultiplexer, ProxyReport, ProxyState, RelaySettings, TrafficSnapshot};
pub use reconnect::{Backoff, ReconnectConfig, ReconnectError};
pub use registry::{LeaseId, LeaseState, LeaseTable, LeaseUpdate, TunnelLease, TunnelRegistry};
pub use supervisor::{ReconnectSupervisor, TunnelClient};
