//! Desired and acknowledged tunnel leases
//!
//! The registry is the only writer of the lease table. The proxy
//! multiplexer holds a [`LeaseTable`] clone and only reads it to resolve a
//! `ReqProxy` to a local port.

use crate::config::TunnelSpec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use tunlink_proto::{NewTunnel, ReqTunnel, TunnelProtocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Waiting for the broker to acknowledge a request
    Pending,
    /// Acknowledged in the current generation
    Active,
    /// Rejected or revoked; not requested again
    Failed,
    /// The client has stopped
    Closed,
}

/// Lease identity: a correlation id until the broker assigns a tunnel id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LeaseId {
    Local(u64),
    Broker(String),
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseId::Local(id) => write!(f, "req-{}", id),
            LeaseId::Broker(id) => f.write_str(id),
        }
    }
}

/// One requested or active tunnel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelLease {
    pub name: String,
    pub id: LeaseId,
    pub protocol: TunnelProtocol,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub basic_auth: Option<String>,
    pub public_url: Option<String>,
    pub state: LeaseState,
    /// Last failure reason, kept once the lease is Failed
    pub error: Option<String>,
}

impl TunnelLease {
    fn demote(&mut self, correlation: u64) {
        self.id = LeaseId::Local(correlation);
        self.public_url = None;
        self.state = LeaseState::Pending;
    }

    fn fail(&mut self, reason: String) {
        self.state = LeaseState::Failed;
        self.public_url = None;
        self.error = Some(reason);
    }
}

/// Shared read handle on the lease table
#[derive(Debug, Clone, Default)]
pub struct LeaseTable {
    inner: Arc<RwLock<Vec<TunnelLease>>>,
}

impl LeaseTable {
    pub async fn snapshot(&self) -> Vec<TunnelLease> {
        self.inner.read().await.clone()
    }

    /// The Active lease with this broker tunnel id, if any
    pub async fn find_active(&self, tunnel_id: &str) -> Option<TunnelLease> {
        self.inner
            .read()
            .await
            .iter()
            .find(|lease| {
                lease.state == LeaseState::Active
                    && matches!(&lease.id, LeaseId::Broker(id) if id == tunnel_id)
            })
            .cloned()
    }
}

/// Result of applying a broker message to the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseUpdate {
    Activated {
        name: String,
        tunnel_id: String,
        public_url: String,
    },
    Failed {
        name: String,
        reason: String,
    },
    /// The message referenced nothing pending or active and was dropped
    Stale,
}

/// Correlation ids, unique for the registry's lifetime
#[derive(Debug)]
struct CorrelationIds {
    next: u64,
}

impl CorrelationIds {
    fn next(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }
}

#[derive(Debug)]
struct PendingRequest {
    index: usize,
    sent_at: Instant,
}

/// Holds desired leases and reconciles them with the broker
#[derive(Debug)]
pub struct TunnelRegistry {
    specs: Vec<TunnelSpec>,
    table: LeaseTable,
    ids: CorrelationIds,
    pending: HashMap<u64, PendingRequest>,
    generation: u64,
}

impl TunnelRegistry {
    pub fn new(specs: Vec<TunnelSpec>) -> Self {
        let mut ids = CorrelationIds { next: 1 };
        let leases = specs
            .iter()
            .map(|spec| TunnelLease {
                name: spec.name.clone(),
                id: LeaseId::Local(ids.next()),
                protocol: spec.protocol,
                local_port: spec.local_port,
                subdomain: spec.subdomain.clone(),
                basic_auth: spec.basic_auth.clone(),
                public_url: None,
                state: LeaseState::Pending,
                error: None,
            })
            .collect();

        Self {
            specs,
            table: LeaseTable {
                inner: Arc::new(RwLock::new(leases)),
            },
            ids,
            pending: HashMap::new(),
            generation: 0,
        }
    }

    /// Desired tunnels in configuration order
    ///
    /// The per-tunnel lease state lives in `table()`; this is the
    /// configuration the leases were built from.
    pub fn desired(&self) -> &[TunnelSpec] {
        &self.specs
    }

    pub fn table(&self) -> LeaseTable {
        self.table.clone()
    }

    /// Start a new generation: forget outstanding requests and demote
    /// everything the previous generation had acknowledged
    pub async fn begin_generation(&mut self, generation: u64) {
        self.generation = generation;
        self.pending.clear();
        self.demote_active().await;
        debug!("Registry entering generation {}", generation);
    }

    /// Requests for every lease that is Pending and not yet requested
    pub async fn reconcile(&mut self) -> Vec<ReqTunnel> {
        let mut leases = self.table.inner.write().await;
        let mut requests = Vec::new();

        for (index, lease) in leases.iter_mut().enumerate() {
            if lease.state != LeaseState::Pending {
                continue;
            }
            if matches!(&lease.id, LeaseId::Local(id) if self.pending.contains_key(id)) {
                continue;
            }

            let req_id = self.ids.next();
            lease.id = LeaseId::Local(req_id);
            self.pending.insert(
                req_id,
                PendingRequest {
                    index,
                    sent_at: Instant::now(),
                },
            );

            debug!(
                "Requesting tunnel {} ({} -> port {}) as req {}",
                lease.name, lease.protocol, lease.local_port, req_id
            );
            requests.push(ReqTunnel {
                req_id,
                protocol: lease.protocol,
                local_port: lease.local_port,
                subdomain: lease.subdomain.clone(),
                basic_auth: lease.basic_auth.clone(),
            });
        }

        requests
    }

    /// Apply the broker's answer to a `ReqTunnel`
    pub async fn apply_new_tunnel(&mut self, msg: &NewTunnel) -> LeaseUpdate {
        let Some(request) = self.pending.remove(&msg.req_id) else {
            warn!("Discarding NewTunnel for unknown request {}", msg.req_id);
            return LeaseUpdate::Stale;
        };

        let mut leases = self.table.inner.write().await;
        let Some(lease) = leases.get_mut(request.index) else {
            return LeaseUpdate::Stale;
        };

        match &msg.error {
            Some(reason) => {
                warn!("Tunnel {} rejected: {}", lease.name, reason);
                lease.fail(reason.clone());
                LeaseUpdate::Failed {
                    name: lease.name.clone(),
                    reason: reason.clone(),
                }
            }
            None => {
                info!("Tunnel {} active at {}", lease.name, msg.public_url);
                lease.id = LeaseId::Broker(msg.tunnel_id.clone());
                lease.public_url = Some(msg.public_url.clone());
                lease.state = LeaseState::Active;
                lease.error = None;
                LeaseUpdate::Activated {
                    name: lease.name.clone(),
                    tunnel_id: msg.tunnel_id.clone(),
                    public_url: msg.public_url.clone(),
                }
            }
        }
    }

    /// Apply a broker `Error` that names a request
    pub async fn apply_request_error(&mut self, req_id: u64, reason: &str) -> LeaseUpdate {
        let Some(request) = self.pending.remove(&req_id) else {
            warn!("Discarding error for unknown request {}: {}", req_id, reason);
            return LeaseUpdate::Stale;
        };

        let mut leases = self.table.inner.write().await;
        match leases.get_mut(request.index) {
            Some(lease) => {
                warn!("Tunnel {} rejected: {}", lease.name, reason);
                lease.fail(reason.to_string());
                LeaseUpdate::Failed {
                    name: lease.name.clone(),
                    reason: reason.to_string(),
                }
            }
            None => LeaseUpdate::Stale,
        }
    }

    /// Broker revoked an active tunnel; the lease fails, the channel stays up
    pub async fn revoke(&mut self, tunnel_id: &str, reason: &str) -> LeaseUpdate {
        let mut leases = self.table.inner.write().await;
        let lease = leases.iter_mut().find(|lease| {
            lease.state == LeaseState::Active
                && matches!(&lease.id, LeaseId::Broker(id) if id == tunnel_id)
        });

        match lease {
            Some(lease) => {
                warn!("Tunnel {} revoked by broker: {}", lease.name, reason);
                lease.fail(reason.to_string());
                LeaseUpdate::Failed {
                    name: lease.name.clone(),
                    reason: reason.to_string(),
                }
            }
            None => {
                warn!("Discarding revocation of unknown tunnel {}", tunnel_id);
                LeaseUpdate::Stale
            }
        }
    }

    /// Correlation ids of requests older than `timeout`
    pub fn expired_requests(&self, now: Instant, timeout: Duration) -> Vec<u64> {
        let mut expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, request)| now.saturating_duration_since(request.sent_at) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();
        expired
    }

    /// The generation is gone: nothing it acknowledged is Active any more
    pub async fn end_generation(&mut self) {
        self.pending.clear();
        self.demote_active().await;
        debug!("Registry left generation {}", self.generation);
    }

    /// Mark every lease that has not failed as Closed
    pub async fn close_all(&mut self) {
        self.pending.clear();
        let mut leases = self.table.inner.write().await;
        for lease in leases.iter_mut() {
            if lease.state != LeaseState::Failed {
                lease.state = LeaseState::Closed;
                lease.public_url = None;
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<TunnelLease> {
        self.table.snapshot().await
    }

    async fn demote_active(&mut self) {
        let active: Vec<usize> = {
            let leases = self.table.inner.read().await;
            leases
                .iter()
                .enumerate()
                .filter(|(_, lease)| lease.state == LeaseState::Active)
                .map(|(index, _)| index)
                .collect()
        };
        if active.is_empty() {
            return;
        }

        let ids: Vec<u64> = active.iter().map(|_| self.ids.next()).collect();
        let mut leases = self.table.inner.write().await;
        for (index, correlation) in active.into_iter().zip(ids) {
            if let Some(lease) = leases.get_mut(index) {
                lease.demote(correlation);
            }
        }
    }
}
