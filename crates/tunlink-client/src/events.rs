//! Lifecycle events for the presentation layer

use crate::proxy::{ProxyReport, TrafficSnapshot};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Something the presentation layer may want to show
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Connecting {
        attempt: usize,
    },
    Connected {
        client_id: String,
        generation: u64,
    },
    TunnelActive {
        name: String,
        tunnel_id: String,
        public_url: String,
    },
    TunnelFailed {
        name: String,
        reason: String,
    },
    Reconnecting {
        attempt: usize,
        delay: Duration,
    },
    Disconnected {
        reason: String,
    },
    ProxyClosed {
        report: ProxyReport,
    },
    Traffic {
        snapshot: TrafficSnapshot,
    },
    Stopped,
}

/// Receives client events; must never block the caller
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ClientEvent);
}

impl EventSink for mpsc::UnboundedSender<ClientEvent> {
    fn emit(&self, event: ClientEvent) {
        // A dropped receiver just means nobody is watching
        let _ = self.send(event);
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ClientEvent) {
        match event {
            ClientEvent::Connecting { attempt } => {
                info!("Connecting to broker (attempt {})", attempt)
            }
            ClientEvent::Connected {
                client_id,
                generation,
            } => info!("✅ Connected as {} (generation {})", client_id, generation),
            ClientEvent::TunnelActive {
                name, public_url, ..
            } => info!("🌍 Tunnel {} is live at {}", name, public_url),
            ClientEvent::TunnelFailed { name, reason } => {
                warn!("Tunnel {} failed: {}", name, reason)
            }
            ClientEvent::Reconnecting { attempt, delay } => info!(
                "🔄 Reconnecting in {:.1}s (attempt {})",
                delay.as_secs_f64(),
                attempt
            ),
            ClientEvent::Disconnected { reason } => warn!("Disconnected: {}", reason),
            ClientEvent::ProxyClosed { report } => debug!(
                "Proxy connection {} on {} closed: {} bytes in, {} bytes out{}",
                report.conn_id,
                report.tunnel_id,
                report.bytes_in,
                report.bytes_out,
                report
                    .error
                    .map(|e| format!(" ({})", e))
                    .unwrap_or_default()
            ),
            ClientEvent::Traffic { snapshot } => debug!(
                "Traffic: {} active connections, {} bytes in, {} bytes out",
                snapshot.active_connections, snapshot.bytes_in, snapshot.bytes_out
            ),
            ClientEvent::Stopped => info!("Client stopped"),
        }
    }
}

/// Discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ClientEvent) {}
}
