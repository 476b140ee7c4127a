//! Proxy multiplexer: one relayed byte stream per `ReqProxy`
//!
//! For every accepted request the multiplexer opens the local target, opens
//! a proxy channel to the broker (announced with `RegProxy`), and runs two
//! copy loops as separate tasks:
//!
//! ```text
//!   broker proxy channel ──frames──▶ copy_to_local  ──bytes──▶ local socket
//!   broker proxy channel ◀──frames── copy_to_broker ◀──bytes── local socket
//! ```
//!
//! When either loop ends the other is cancelled and gets `linger` to finish
//! its in-flight I/O before it is aborted. All connections of a generation
//! hang off one [`CancellationToken`], so ending the generation stops them.

use crate::config::ClientConfig;
use crate::registry::LeaseTable;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tunlink_proto::{
    error_codes, CodecError, ErrorMsg, Message, MessageCodec, RegProxy, ReqProxy,
};
use tunlink_transport::{ChannelKind, Connector, FrameSink, FrameSource, TransportError};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Final accounting for one proxy connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyReport {
    pub conn_id: u64,
    pub tunnel_id: String,
    /// Bytes relayed broker -> local
    pub bytes_in: u64,
    /// Bytes relayed local -> broker
    pub bytes_out: u64,
    pub error: Option<String>,
}

/// Byte totals for the current generation, live and closed connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrafficSnapshot {
    pub generation: u64,
    pub active_connections: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Opening,
    Relaying,
    Closing,
    Closed,
}

/// What the multiplexer did with a `ReqProxy`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyDecision {
    Started,
    /// The conn id was already used in this generation; ignored
    Duplicate,
    /// Unknown or inactive tunnel; the error should go back to the broker
    Rejected(ErrorMsg),
}

#[derive(Debug, Error)]
enum RelayError {
    #[error("local service {addr} unreachable: {source}")]
    LocalUnreachable { addr: String, source: io::Error },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Failed to encode RegProxy: {0}")]
    Encode(#[from] CodecError),

    #[error("Timed out during {0}")]
    Timeout(&'static str),

    #[error("Cancelled before relaying")]
    Cancelled,

    #[error("Copy loop did not finish within linger, force-closed")]
    LingerExpired,

    #[error("Copy task failed: {0}")]
    Join(#[from] JoinError),
}

/// Connection-level settings taken from the client configuration
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub local_host: String,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub linger: Duration,
}

impl RelaySettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            local_host: config.local_host.clone(),
            connect_timeout: config.timeouts.connect,
            io_timeout: config.timeouts.io,
            linger: config.timeouts.linger,
        }
    }
}

#[derive(Debug, Default)]
struct ByteCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

#[derive(Debug)]
struct LiveConnection {
    tunnel_id: String,
    counters: Arc<ByteCounters>,
}

/// Fans `ReqProxy` messages out into independent relay tasks
pub struct ProxyMultiplexer {
    generation: u64,
    leases: LeaseTable,
    connector: Arc<dyn Connector>,
    settings: Arc<RelaySettings>,
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
    tasks: JoinSet<ProxyReport>,
    seen: HashSet<u64>,
    live: HashMap<u64, LiveConnection>,
    closed_in: u64,
    closed_out: u64,
}

impl ProxyMultiplexer {
    pub fn new(
        generation: u64,
        leases: LeaseTable,
        connector: Arc<dyn Connector>,
        settings: RelaySettings,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Self {
        Self {
            generation,
            leases,
            connector,
            settings: Arc::new(settings),
            outbound,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
            seen: HashSet::new(),
            live: HashMap::new(),
            closed_in: 0,
            closed_out: 0,
        }
    }

    /// Handle a broker request for a new proxy connection
    pub async fn on_req_proxy(&mut self, req: ReqProxy) -> ProxyDecision {
        if self.seen.contains(&req.conn_id) {
            warn!(
                "Discarding duplicate ReqProxy for connection {} in generation {}",
                req.conn_id, self.generation
            );
            return ProxyDecision::Duplicate;
        }

        let Some(lease) = self.leases.find_active(&req.tunnel_id).await else {
            warn!(
                "ReqProxy for unknown or inactive tunnel {} (connection {})",
                req.tunnel_id, req.conn_id
            );
            return ProxyDecision::Rejected(ErrorMsg::new(
                error_codes::TUNNEL_NOT_FOUND,
                format!("tunnel {} is not active", req.tunnel_id),
            ));
        };

        self.seen.insert(req.conn_id);
        let counters = Arc::new(ByteCounters::default());
        self.live.insert(
            req.conn_id,
            LiveConnection {
                tunnel_id: req.tunnel_id.clone(),
                counters: counters.clone(),
            },
        );

        let conn = ProxyConnection {
            conn_id: req.conn_id,
            tunnel_id: req.tunnel_id,
            local_addr: format!("{}:{}", self.settings.local_host, lease.local_port),
            state: ProxyState::Opening,
            counters,
            token: self.cancel.child_token(),
        };
        debug!(
            "Opening proxy connection {} to {}",
            conn.conn_id, conn.local_addr
        );

        self.tasks.spawn(conn.run(
            self.connector.clone(),
            self.settings.clone(),
            self.outbound.clone(),
        ));
        ProxyDecision::Started
    }

    /// True while any relay task has not been reaped
    pub fn has_live(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Wait for the next connection to finish
    ///
    /// Returns `None` immediately when nothing is running.
    pub async fn next_finished(&mut self) -> Option<ProxyReport> {
        loop {
            match self.tasks.join_next().await? {
                Ok(report) => {
                    self.finalize(&report);
                    return Some(report);
                }
                // The connection stays in `live` until the generation ends
                Err(e) => error!("Proxy task failed: {}", e),
            }
        }
    }

    pub fn snapshot(&self) -> TrafficSnapshot {
        let mut snapshot = TrafficSnapshot {
            generation: self.generation,
            active_connections: self.live.len(),
            bytes_in: self.closed_in,
            bytes_out: self.closed_out,
        };
        for conn in self.live.values() {
            snapshot.bytes_in += conn.counters.bytes_in.load(Ordering::Relaxed);
            snapshot.bytes_out += conn.counters.bytes_out.load(Ordering::Relaxed);
        }
        snapshot
    }

    /// Let live connections finish for up to `grace`, then force-close the rest
    pub async fn drain(&mut self, grace: Duration) -> Vec<ProxyReport> {
        let mut reports = Vec::new();
        if self.has_live() {
            info!(
                "Draining {} proxy connections (grace {:?})",
                self.live.len(),
                grace
            );
            let _ = timeout(grace, async {
                while let Some(report) = self.next_finished().await {
                    reports.push(report);
                }
            })
            .await;
        }
        reports.extend(self.connection_lost().await);
        reports
    }

    /// The generation ended: cancel every connection and collect reports
    pub async fn connection_lost(&mut self) -> Vec<ProxyReport> {
        self.cancel.cancel();

        let mut reports = Vec::new();
        if self.tasks.is_empty() && self.live.is_empty() {
            return reports;
        }
        debug!(
            "Closing {} proxy connections of generation {}",
            self.tasks.len(),
            self.generation
        );

        // Each task bounds its own shutdown by `linger` once cancelled
        let bound = self.settings.linger * 2;
        let _ = timeout(bound, async {
            while let Some(report) = self.next_finished().await {
                reports.push(report);
            }
        })
        .await;

        if !self.tasks.is_empty() {
            warn!("Aborting {} stuck proxy tasks", self.tasks.len());
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        // Whatever is still live was never reported
        for (conn_id, conn) in self.live.drain() {
            let report = ProxyReport {
                conn_id,
                tunnel_id: conn.tunnel_id,
                bytes_in: conn.counters.bytes_in.load(Ordering::Relaxed),
                bytes_out: conn.counters.bytes_out.load(Ordering::Relaxed),
                error: Some("force-closed".to_string()),
            };
            self.closed_in += report.bytes_in;
            self.closed_out += report.bytes_out;
            reports.push(report);
        }
        reports
    }

    fn finalize(&mut self, report: &ProxyReport) {
        if self.live.remove(&report.conn_id).is_some() {
            self.closed_in += report.bytes_in;
            self.closed_out += report.bytes_out;
        }
    }
}

/// One relayed stream, owned by its task
struct ProxyConnection {
    conn_id: u64,
    tunnel_id: String,
    local_addr: String,
    state: ProxyState,
    counters: Arc<ByteCounters>,
    token: CancellationToken,
}

impl ProxyConnection {
    fn set_state(&mut self, state: ProxyState) {
        debug!(
            "Proxy connection {}: {:?} -> {:?}",
            self.conn_id, self.state, state
        );
        self.state = state;
    }

    async fn run(
        mut self,
        connector: Arc<dyn Connector>,
        settings: Arc<RelaySettings>,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> ProxyReport {
        let result = self.relay(connector.as_ref(), &settings, &outbound).await;
        self.set_state(ProxyState::Closed);

        let report = ProxyReport {
            conn_id: self.conn_id,
            tunnel_id: self.tunnel_id,
            bytes_in: self.counters.bytes_in.load(Ordering::SeqCst),
            bytes_out: self.counters.bytes_out.load(Ordering::SeqCst),
            error: result.err().map(|e| e.to_string()),
        };
        debug!(
            "Proxy connection {} finished: in={}, out={}",
            report.conn_id, report.bytes_in, report.bytes_out
        );
        report
    }

    async fn relay(
        &mut self,
        connector: &dyn Connector,
        settings: &RelaySettings,
        outbound: &mpsc::UnboundedSender<Message>,
    ) -> Result<(), RelayError> {
        let token = self.token.clone();

        let local = tokio::select! {
            _ = token.cancelled() => return Err(RelayError::Cancelled),
            res = timeout(settings.connect_timeout, TcpStream::connect(&self.local_addr)) => {
                let res = match res {
                    Ok(res) => res,
                    Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
                };
                match res {
                    Ok(stream) => stream,
                    Err(e) => {
                        error!(
                            "Failed to connect to local service at {}: {}",
                            self.local_addr, e
                        );
                        let _ = outbound.send(Message::Error(ErrorMsg::new(
                            error_codes::LOCAL_UNREACHABLE,
                            format!("connection {}: {}", self.conn_id, e),
                        )));
                        return Err(RelayError::LocalUnreachable {
                            addr: self.local_addr.clone(),
                            source: e,
                        });
                    }
                }
            }
        };
        debug!("Connected to local service at {}", self.local_addr);

        let mut remote = tokio::select! {
            _ = token.cancelled() => return Err(RelayError::Cancelled),
            res = timeout(settings.connect_timeout, connector.connect(ChannelKind::Proxy)) => {
                res.map_err(|_| RelayError::Timeout("proxy channel connect"))??
            }
        };

        let register = MessageCodec::encode(&Message::RegProxy(RegProxy {
            conn_id: self.conn_id,
        }))?;
        tokio::select! {
            _ = token.cancelled() => return Err(RelayError::Cancelled),
            res = timeout(settings.io_timeout, remote.sink.send(register)) => {
                res.map_err(|_| RelayError::Timeout("RegProxy"))??
            }
        }

        self.set_state(ProxyState::Relaying);

        let (local_read, local_write) = local.into_split();
        let mut loops = JoinSet::new();
        loops.spawn(copy_to_local(
            remote.source,
            local_write,
            self.counters.clone(),
            token.clone(),
            settings.io_timeout,
        ));
        loops.spawn(copy_to_broker(
            local_read,
            remote.sink,
            self.counters.clone(),
            token.clone(),
            settings.io_timeout,
        ));

        let mut outcome = Ok(());
        let first = tokio::select! {
            res = loops.join_next() => res,
            _ = token.cancelled() => None,
        };
        if let Some(res) = first {
            outcome = flatten(res);
        }

        self.set_state(ProxyState::Closing);
        token.cancel();

        let rest = timeout(settings.linger, async {
            let mut rest = Ok(());
            while let Some(res) = loops.join_next().await {
                let res = flatten(res);
                if rest.is_ok() {
                    rest = res;
                }
            }
            rest
        })
        .await;

        match rest {
            Ok(rest) => outcome.and(rest),
            Err(_) => {
                loops.abort_all();
                outcome.and(Err(RelayError::LingerExpired))
            }
        }
    }
}

fn flatten(res: Result<Result<(), RelayError>, JoinError>) -> Result<(), RelayError> {
    res?
}

/// Broker frames to the local socket
async fn copy_to_local(
    mut source: Box<dyn FrameSource>,
    mut local: OwnedWriteHalf,
    counters: Arc<ByteCounters>,
    token: CancellationToken,
    io_timeout: Duration,
) -> Result<(), RelayError> {
    let result = async {
        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => break,
                frame = source.recv() => frame?,
            };
            let Some(data) = frame else {
                debug!("Broker closed proxy channel");
                break;
            };

            timeout(io_timeout, local.write_all(&data))
                .await
                .map_err(|_| RelayError::Timeout("local write"))??;
            counters
                .bytes_in
                .fetch_add(data.len() as u64, Ordering::SeqCst);
        }
        Ok::<(), RelayError>(())
    }
    .await;

    let _ = local.shutdown().await;
    result
}

/// Local socket bytes to the broker, one chunk per frame
async fn copy_to_broker(
    mut local: OwnedReadHalf,
    mut sink: Box<dyn FrameSink>,
    counters: Arc<ByteCounters>,
    token: CancellationToken,
    io_timeout: Duration,
) -> Result<(), RelayError> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let result = async {
        loop {
            let n = tokio::select! {
                _ = token.cancelled() => break,
                n = local.read(&mut buffer) => n?,
            };
            if n == 0 {
                debug!("Local socket closed");
                break;
            }

            timeout(io_timeout, sink.send(Bytes::copy_from_slice(&buffer[..n])))
                .await
                .map_err(|_| RelayError::Timeout("broker write"))??;
            counters.bytes_out.fetch_add(n as u64, Ordering::SeqCst);
        }
        Ok::<(), RelayError>(())
    }
    .await;

    let _ = timeout(io_timeout, sink.close()).await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelSpec;
    use crate::registry::TunnelRegistry;
    use tokio::net::TcpListener;
    use tunlink_proto::{NewTunnel, TunnelProtocol};
    use tunlink_transport::{memory_transport, FramedConnection, MemoryListener};

    const WAIT: Duration = Duration::from_secs(5);

    async fn echo_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        port
    }

    async fn active_table(port: u16) -> LeaseTable {
        let mut registry = TunnelRegistry::new(vec![TunnelSpec::new(TunnelProtocol::Tcp, port)]);
        registry.begin_generation(1).await;
        let req = registry.reconcile().await.remove(0);
        registry
            .apply_new_tunnel(&NewTunnel {
                req_id: req.req_id,
                tunnel_id: "tun1".to_string(),
                public_url: "tcp://relay.example.com:40001".to_string(),
                error: None,
            })
            .await;
        registry.table()
    }

    struct Harness {
        mux: ProxyMultiplexer,
        listener: MemoryListener,
        outbound: mpsc::UnboundedReceiver<Message>,
    }

    async fn harness(port: u16) -> Harness {
        let (connector, listener) = memory_transport();
        let (tx, outbound) = mpsc::unbounded_channel();
        let settings = RelaySettings {
            local_host: "127.0.0.1".to_string(),
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_secs(2),
            linger: Duration::from_millis(200),
        };
        let mux = ProxyMultiplexer::new(
            1,
            active_table(port).await,
            Arc::new(connector),
            settings,
            tx,
        );
        Harness {
            mux,
            listener,
            outbound,
        }
    }

    fn req(conn_id: u64) -> ReqProxy {
        ReqProxy {
            tunnel_id: "tun1".to_string(),
            conn_id,
        }
    }

    async fn accept_proxy(listener: &mut MemoryListener, conn_id: u64) -> FramedConnection {
        let accepted = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
        assert_eq!(accepted.kind, ChannelKind::Proxy);
        let mut conn = accepted.conn;
        let first = conn.source.recv().await.unwrap().unwrap();
        assert_eq!(
            MessageCodec::decode(&first).unwrap(),
            Message::RegProxy(RegProxy { conn_id })
        );
        conn
    }

    async fn read_exactly(conn: &mut FramedConnection, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let frame = timeout(WAIT, conn.source.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            out.extend_from_slice(&frame);
        }
        out
    }

    #[tokio::test]
    async fn test_relays_bytes_exactly() {
        let port = echo_server().await;
        let mut h = harness(port).await;

        assert_eq!(h.mux.on_req_proxy(req(42)).await, ProxyDecision::Started);
        let mut broker = accept_proxy(&mut h.listener, 42).await;

        let payload: Vec<u8> = (0..40_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in payload.chunks(4000) {
            broker.sink.send(Bytes::copy_from_slice(chunk)).await.unwrap();
        }
        let echoed = read_exactly(&mut broker, payload.len()).await;
        assert_eq!(echoed, payload);

        broker.sink.close().await.unwrap();
        let report = timeout(WAIT, h.mux.next_finished()).await.unwrap().unwrap();
        assert_eq!(report.conn_id, 42);
        assert_eq!(report.tunnel_id, "tun1");
        assert_eq!(report.bytes_in, payload.len() as u64);
        assert_eq!(report.bytes_out, payload.len() as u64);
        assert_eq!(report.error, None);
        assert!(!h.mux.has_live());
        assert_eq!(h.mux.snapshot().bytes_in, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_unknown_tunnel_is_rejected() {
        let port = echo_server().await;
        let mut h = harness(port).await;

        let decision = h
            .mux
            .on_req_proxy(ReqProxy {
                tunnel_id: "nope".to_string(),
                conn_id: 1,
            })
            .await;
        match decision {
            ProxyDecision::Rejected(err) => assert_eq!(err.code, error_codes::TUNNEL_NOT_FOUND),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(!h.mux.has_live());
        assert!(h.mux.next_finished().await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_conn_id_is_discarded() {
        let port = echo_server().await;
        let mut h = harness(port).await;

        assert_eq!(h.mux.on_req_proxy(req(7)).await, ProxyDecision::Started);
        assert_eq!(h.mux.on_req_proxy(req(7)).await, ProxyDecision::Duplicate);
        assert_eq!(h.mux.snapshot().active_connections, 1);
    }

    #[tokio::test]
    async fn test_local_unreachable_is_per_connection() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let mut h = harness(port).await;
        assert_eq!(h.mux.on_req_proxy(req(9)).await, ProxyDecision::Started);

        let report = timeout(WAIT, h.mux.next_finished()).await.unwrap().unwrap();
        assert_eq!(report.conn_id, 9);
        assert!(report.error.unwrap().contains("unreachable"));

        match h.outbound.recv().await.unwrap() {
            Message::Error(err) => assert_eq!(err.code, error_codes::LOCAL_UNREACHABLE),
            other => panic!("expected error message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connections_are_isolated() {
        let port = echo_server().await;
        let mut h = harness(port).await;

        h.mux.on_req_proxy(req(1)).await;
        let mut first = accept_proxy(&mut h.listener, 1).await;
        h.mux.on_req_proxy(req(2)).await;
        let mut second = accept_proxy(&mut h.listener, 2).await;

        first.sink.send(Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(read_exactly(&mut first, 3).await, b"one");
        first.sink.close().await.unwrap();

        let report = timeout(WAIT, h.mux.next_finished()).await.unwrap().unwrap();
        assert_eq!(report.conn_id, 1);
        assert_eq!(report.bytes_in, 3);

        second.sink.send(Bytes::from_static(b"second")).await.unwrap();
        assert_eq!(read_exactly(&mut second, 6).await, b"second");
        assert_eq!(h.mux.snapshot().active_connections, 1);

        let reports = h.mux.connection_lost().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].conn_id, 2);
        assert_eq!(reports[0].bytes_in, 6);
        assert_eq!(reports[0].bytes_out, 6);
    }

    #[tokio::test]
    async fn test_connection_lost_closes_broker_side() {
        let port = echo_server().await;
        let mut h = harness(port).await;

        h.mux.on_req_proxy(req(5)).await;
        let mut broker = accept_proxy(&mut h.listener, 5).await;
        broker.sink.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(read_exactly(&mut broker, 4).await, b"ping");

        let reports = timeout(WAIT, h.mux.connection_lost()).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert!(!h.mux.has_live());

        let end = timeout(WAIT, broker.source.recv()).await.unwrap().unwrap();
        assert!(end.is_none());
    }
}
