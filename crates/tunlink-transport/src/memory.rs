//! In-process transport
//!
//! Every `connect` creates a `tokio::io::duplex` pair: the client keeps one
//! end and the other end is handed to the paired [`MemoryListener`]. Used by
//! the test harness to run a scripted broker in the same runtime.

use crate::{
    framed_connection, ChannelKind, Connector, FramedConnection, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

const DUPLEX_BUFFER: usize = 64 * 1024;

/// Broker side of an accepted in-process connection
#[derive(Debug)]
pub struct Accepted {
    pub kind: ChannelKind,
    pub conn: FramedConnection,
}

/// Client side of the in-process transport
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<Accepted>,
    refusing: Arc<AtomicBool>,
    next_id: Arc<AtomicU64>,
}

/// Broker side of the in-process transport
#[derive(Debug)]
pub struct MemoryListener {
    rx: mpsc::UnboundedReceiver<Accepted>,
}

/// Create a connected connector/listener pair
pub fn memory_transport() -> (MemoryConnector, MemoryListener) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            tx,
            refusing: Arc::new(AtomicBool::new(false)),
            next_id: Arc::new(AtomicU64::new(1)),
        },
        MemoryListener { rx },
    )
}

impl MemoryConnector {
    /// While set, every `connect` fails as if the broker were unreachable
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, kind: ChannelKind) -> TransportResult<FramedConnection> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(
                "connection refused".to_string(),
            ));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (client, server) = tokio::io::duplex(DUPLEX_BUFFER);

        self.tx
            .send(Accepted {
                kind,
                conn: framed_connection(server, format!("mem-server-{}", id)),
            })
            .map_err(|_| TransportError::ConnectionError("listener closed".to_string()))?;

        Ok(framed_connection(client, format!("mem-{}", id)))
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

impl MemoryListener {
    /// Wait for the next connection; `None` once every connector is dropped
    pub async fn accept(&mut self) -> Option<Accepted> {
        self.rx.recv().await
    }
}
