//! Reconnect supervisor and the public client handle

use crate::context::ClientContext;
use crate::control::{ControlChannel, GenerationOutcome};
use crate::error::{FaultKind, TunnelError};
use crate::events::ClientEvent;
use crate::reconnect::{Backoff, ReconnectError};
use crate::registry::{LeaseTable, TunnelLease, TunnelRegistry};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Drives control-channel generations until shutdown or a fatal error
///
/// Generations never overlap: a new attempt starts only after the previous
/// [`ControlChannel::run`] has returned, which includes closing its socket
/// and cancelling all of its proxy connections.
pub struct ReconnectSupervisor {
    ctx: Arc<ClientContext>,
    registry: TunnelRegistry,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl ReconnectSupervisor {
    pub fn new(ctx: ClientContext, shutdown: CancellationToken) -> Self {
        let registry = TunnelRegistry::new(ctx.config.tunnels.clone());
        let backoff = Backoff::new(ctx.config.reconnect.clone());
        Self {
            ctx: Arc::new(ctx),
            registry,
            backoff,
            shutdown,
        }
    }

    pub fn leases(&self) -> LeaseTable {
        self.registry.table()
    }

    pub async fn run(mut self) -> Result<(), TunnelError> {
        let result = self.supervise().await;

        self.registry.close_all().await;
        if let Err(e) = &result {
            error!("Client stopped: {}", e);
        }
        self.ctx.events.emit(ClientEvent::Stopped);
        result
    }

    async fn supervise(&mut self) -> Result<(), TunnelError> {
        let token = self.ctx.tokens.token().await?;
        let max_auth_failures = self.ctx.config.max_auth_failures;
        let mut auth_failures = 0u32;
        let mut generation = 0u64;

        info!(
            "Starting tunnel client for {} with {} tunnels",
            self.ctx.connector.describe(),
            self.registry.desired().len()
        );

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(());
            }

            generation += 1;
            self.ctx.events.emit(ClientEvent::Connecting {
                attempt: self.backoff.attempt() + 1,
            });

            let channel = ControlChannel::new(self.ctx.clone(), generation, self.shutdown.clone());
            let report = channel.run(&mut self.registry, &token).await;

            if let Some(ready_for) = report.ready_for {
                self.backoff.record_session(ready_for);
                auth_failures = 0;
            }

            let err = match report.outcome {
                GenerationOutcome::Shutdown => return Ok(()),
                GenerationOutcome::Failed(err) => err,
            };

            warn!("Generation {} ended: {}", report.generation, err);
            self.ctx.events.emit(ClientEvent::Disconnected {
                reason: err.to_string(),
            });

            if err.kind() == FaultKind::Auth {
                auth_failures += 1;
                if auth_failures >= max_auth_failures {
                    return Err(TunnelError::AuthenticationFailed {
                        attempts: auth_failures,
                        reason: err.to_string(),
                    });
                }
            }

            let delay = match self.backoff.next_delay() {
                Ok(delay) => delay,
                Err(ReconnectError::MaxAttemptsReached(max)) => {
                    return Err(TunnelError::ReconnectExhausted(max));
                }
            };
            self.ctx.events.emit(ClientEvent::Reconnecting {
                attempt: self.backoff.attempt(),
                delay,
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Handle on a running client
pub struct TunnelClient {
    shutdown: CancellationToken,
    leases: LeaseTable,
    handle: JoinHandle<Result<(), TunnelError>>,
}

impl TunnelClient {
    /// Validate the configuration and start supervising in the background
    pub fn start(ctx: ClientContext) -> Result<Self, TunnelError> {
        ctx.config.validate()?;

        let shutdown = CancellationToken::new();
        let supervisor = ReconnectSupervisor::new(ctx, shutdown.clone());
        let leases = supervisor.leases();
        let handle = tokio::spawn(supervisor.run());

        Ok(Self {
            shutdown,
            leases,
            handle,
        })
    }

    /// Current lease states, in configuration order
    pub async fn leases(&self) -> Vec<TunnelLease> {
        self.leases.snapshot().await
    }

    /// Request a graceful stop; live proxy connections get the drain grace
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Token that requests the same graceful stop as [`TunnelClient::shutdown`]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Wait for the client to stop
    pub async fn wait(self) -> Result<(), TunnelError> {
        self.handle.await?
    }
}
