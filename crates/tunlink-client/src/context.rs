//! Collaborators handed to the supervisor at construction

use crate::config::ClientConfig;
use crate::error::{TokenError, TunnelError};
use crate::events::EventSink;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tunlink_transport::{connector_for_endpoint, Connector};

/// Supplies the bearer token sent in `Auth`
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self) -> Result<String, TokenError>;
}

/// A token known up front
#[derive(Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticToken(***)")
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<String, TokenError> {
        if self.0.trim().is_empty() {
            return Err(TokenError::Missing);
        }
        Ok(self.0.clone())
    }
}

/// Everything a client run needs
#[derive(Clone)]
pub struct ClientContext {
    pub config: ClientConfig,
    pub tokens: Arc<dyn TokenProvider>,
    pub events: Arc<dyn EventSink>,
    pub connector: Arc<dyn Connector>,
}

impl ClientContext {
    /// Build a context whose connector is derived from `config.server_endpoint`
    pub fn new(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, TunnelError> {
        let connector = connector_for_endpoint(&config.server_endpoint)?;
        Ok(Self::with_connector(config, tokens, events, connector))
    }

    /// Build a context around an explicit connector
    pub fn with_connector(
        config: ClientConfig,
        tokens: Arc<dyn TokenProvider>,
        events: Arc<dyn EventSink>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            tokens,
            events,
            connector,
        }
    }
}

impl fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientContext")
            .field("config", &self.config)
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}
