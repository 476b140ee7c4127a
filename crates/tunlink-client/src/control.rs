//! Control channel: one broker connection per generation
//!
//! ```text
//!  Disconnected ─▶ Connecting ─▶ Authenticating ─▶ Ready ─▶ Disconnected
//!                                                    │
//!                                                    └──▶ Draining ─▶ Disconnected
//! ```
//!
//! Outbound messages go through a single writer task fed by an unbounded
//! channel, so the dispatch loop, the heartbeat and the proxy tasks never
//! contend for the sink. The dispatch loop processes frames in arrival
//! order and hands `ReqProxy` to the [`ProxyMultiplexer`].

use crate::context::ClientContext;
use crate::error::ControlError;
use crate::events::ClientEvent;
use crate::proxy::{ProxyDecision, ProxyMultiplexer, ProxyReport, RelaySettings};
use crate::registry::{LeaseUpdate, TunnelRegistry};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use tunlink_proto::{Auth, AuthResp, Message, MessageCodec};
use tunlink_transport::{ChannelKind, FrameSink, FrameSource, FramedConnection};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Authenticating,
    Ready,
    Draining,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Authenticating => "authenticating",
            ChannelState::Ready => "ready",
            ChannelState::Draining => "draining",
        })
    }
}

/// How a generation ended
#[derive(Debug)]
pub enum GenerationOutcome {
    /// A graceful stop was requested
    Shutdown,
    Failed(ControlError),
}

/// Summary handed back to the supervisor
#[derive(Debug)]
pub struct GenerationReport {
    pub generation: u64,
    /// How long the generation stayed Ready, if it got there
    pub ready_for: Option<Duration>,
    pub outcome: GenerationOutcome,
}

/// Missed-pong accounting
#[derive(Debug)]
struct Heartbeat {
    limit: u32,
    missed: u32,
    outstanding: bool,
}

impl Heartbeat {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            missed: 0,
            outstanding: false,
        }
    }

    /// Called on every interval tick, before sending the next ping
    fn tick(&mut self) -> Result<(), ControlError> {
        if self.outstanding {
            self.missed += 1;
            debug!("Heartbeat missed ({}/{})", self.missed, self.limit);
            if self.missed >= self.limit {
                return Err(ControlError::HeartbeatTimeout(self.missed));
            }
        }
        self.outstanding = true;
        Ok(())
    }

    fn pong(&mut self) {
        self.missed = 0;
        self.outstanding = false;
    }
}

fn send(outbound: &mpsc::UnboundedSender<Message>, msg: Message) -> Result<(), ControlError> {
    outbound.send(msg).map_err(|_| ControlError::WriterStopped)
}

/// One control-channel generation
pub struct ControlChannel {
    ctx: Arc<ClientContext>,
    generation: u64,
    state: ChannelState,
    shutdown: CancellationToken,
}

impl ControlChannel {
    pub fn new(ctx: Arc<ClientContext>, generation: u64, shutdown: CancellationToken) -> Self {
        Self {
            ctx,
            generation,
            state: ChannelState::Disconnected,
            shutdown,
        }
    }

    fn transition(&mut self, next: ChannelState) {
        debug!(
            "Control channel (generation {}): {} -> {}",
            self.generation, self.state, next
        );
        self.state = next;
    }

    /// Run the generation to completion
    ///
    /// Returns only after the connection is closed and every proxy
    /// connection of this generation has been cancelled.
    pub async fn run(mut self, registry: &mut TunnelRegistry, token: &str) -> GenerationReport {
        let mut report = GenerationReport {
            generation: self.generation,
            ready_for: None,
            outcome: GenerationOutcome::Shutdown,
        };

        report.outcome = match self.establish(token).await {
            Ok(Some((conn, client_id))) => {
                let ready_at = Instant::now();
                let outcome = self.serve(conn, client_id, registry).await;
                report.ready_for = Some(ready_at.elapsed());
                outcome
            }
            Ok(None) => GenerationOutcome::Shutdown,
            Err(e) => GenerationOutcome::Failed(e),
        };

        self.transition(ChannelState::Disconnected);
        report
    }

    /// Connect and authenticate; `None` if shutdown was requested meanwhile
    async fn establish(
        &mut self,
        token: &str,
    ) -> Result<Option<(FramedConnection, String)>, ControlError> {
        let ctx = self.ctx.clone();
        let timeouts = &ctx.config.timeouts;

        self.transition(ChannelState::Connecting);
        let mut conn = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            res = timeout(timeouts.connect, ctx.connector.connect(ChannelKind::Control)) => {
                res.map_err(|_| ControlError::Timeout("connect", timeouts.connect))??
            }
        };
        debug!(
            "Control connection {} open to {}",
            conn.id,
            ctx.connector.describe()
        );

        self.transition(ChannelState::Authenticating);
        let auth = MessageCodec::encode(&Message::Auth(Auth::new(token)))?;
        timeout(timeouts.io, conn.sink.send(auth))
            .await
            .map_err(|_| ControlError::Timeout("Auth write", timeouts.io))??;

        let resp = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(None),
            res = timeout(timeouts.auth, read_auth_resp(&mut *conn.source)) => {
                res.map_err(|_| ControlError::Timeout("AuthResp", timeouts.auth))??
            }
        };

        if let Some(reason) = resp.error {
            warn!("Broker rejected authentication: {}", reason);
            let _ = conn.sink.close().await;
            return Err(ControlError::AuthRejected(reason));
        }

        Ok(Some((conn, resp.client_id)))
    }

    async fn serve(
        &mut self,
        conn: FramedConnection,
        client_id: String,
        registry: &mut TunnelRegistry,
    ) -> GenerationOutcome {
        let ctx = self.ctx.clone();
        let timeouts = ctx.config.timeouts.clone();
        let FramedConnection {
            id: conn_id,
            sink,
            mut source,
        } = conn;

        self.transition(ChannelState::Ready);
        info!(
            "Authenticated as {} on {} (generation {})",
            client_id, conn_id, self.generation
        );
        ctx.events.emit(ClientEvent::Connected {
            client_id,
            generation: self.generation,
        });

        let (outbound, rx) = mpsc::unbounded_channel();
        let mut writer = tokio::spawn(write_loop(sink, rx, timeouts.io));
        let mut writer_done = false;

        let mut mux = ProxyMultiplexer::new(
            self.generation,
            registry.table(),
            ctx.connector.clone(),
            RelaySettings::from_config(&ctx.config),
            outbound.clone(),
        );

        registry.begin_generation(self.generation).await;
        for req in registry.reconcile().await {
            // The writer cannot have stopped yet: it holds the receiver
            let _ = outbound.send(Message::ReqTunnel(req));
        }

        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(timeouts.missed_pongs);
        let mut ping_timer = interval_at(start + timeouts.heartbeat_interval, timeouts.heartbeat_interval);
        ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut housekeeping = interval_at(start + timeouts.snapshot, timeouts.snapshot);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_traffic = mux.snapshot();

        let result: Result<(), ControlError> = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break Ok(()),

                _ = ping_timer.tick() => {
                    if let Err(e) = heartbeat.tick() {
                        break Err(e);
                    }
                    if let Err(e) = send(&outbound, Message::ping()) {
                        break Err(e);
                    }
                }

                _ = housekeeping.tick() => {
                    let expired = registry.expired_requests(Instant::now(), timeouts.tunnel_request);
                    if let Some(req_id) = expired.first() {
                        break Err(ControlError::TunnelRequestTimeout(*req_id));
                    }
                    let snapshot = mux.snapshot();
                    if snapshot != last_traffic {
                        ctx.events.emit(ClientEvent::Traffic { snapshot });
                        last_traffic = snapshot;
                    }
                }

                frame = source.recv() => {
                    let frame = match frame {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break Err(ControlError::Closed),
                        Err(e) => break Err(e.into()),
                    };
                    let msg = match MessageCodec::decode(&frame) {
                        Ok(msg) => msg,
                        Err(e) => break Err(e.into()),
                    };
                    trace!("Received {}", msg.kind());
                    if let Err(e) = self
                        .dispatch(msg, registry, &mut mux, &outbound, &mut heartbeat)
                        .await
                    {
                        break Err(e);
                    }
                }

                Some(report) = mux.next_finished(), if mux.has_live() => {
                    self.proxy_closed(report);
                }

                res = &mut writer, if !writer_done => {
                    writer_done = true;
                    break Err(match res {
                        Ok(Err(e)) => e,
                        _ => ControlError::WriterStopped,
                    });
                }
            }
        };

        let outcome = match result {
            Ok(()) => {
                self.transition(ChannelState::Draining);
                for report in mux.drain(timeouts.drain_grace).await {
                    self.proxy_closed(report);
                }
                GenerationOutcome::Shutdown
            }
            Err(e) => {
                error!("Control channel failed: {}", e);
                for report in mux.connection_lost().await {
                    self.proxy_closed(report);
                }
                GenerationOutcome::Failed(e)
            }
        };

        registry.end_generation().await;

        // Dropping every sender lets the writer flush and close the sink
        drop(mux);
        drop(outbound);
        if !writer_done && timeout(timeouts.io, &mut writer).await.is_err() {
            warn!("Control writer did not finish, aborting");
            writer.abort();
        }
        drop(source);

        outcome
    }

    async fn dispatch(
        &mut self,
        msg: Message,
        registry: &mut TunnelRegistry,
        mux: &mut ProxyMultiplexer,
        outbound: &mpsc::UnboundedSender<Message>,
        heartbeat: &mut Heartbeat,
    ) -> Result<(), ControlError> {
        match msg {
            Message::Ping(_) => send(outbound, Message::pong())?,
            Message::Pong(_) => heartbeat.pong(),
            Message::NewTunnel(new_tunnel) => {
                let update = registry.apply_new_tunnel(&new_tunnel).await;
                self.publish(update);
            }
            Message::ReqProxy(req) => {
                if let ProxyDecision::Rejected(err) = mux.on_req_proxy(req).await {
                    send(outbound, Message::Error(err))?;
                }
            }
            Message::Error(err) => match err.req_id {
                Some(req_id) => {
                    let reason = format!("{}: {}", err.code, err.message);
                    let update = registry.apply_request_error(req_id, &reason).await;
                    self.publish(update);
                }
                None => warn!("Broker reported {}: {}", err.code, err.message),
            },
            Message::TunnelClosed(closed) => {
                let update = registry.revoke(&closed.tunnel_id, &closed.reason).await;
                self.publish(update);
            }
            Message::Auth(_) | Message::AuthResp(_) | Message::ReqTunnel(_) | Message::RegProxy(_) => {
                return Err(ControlError::Unexpected {
                    kind: msg.kind(),
                    state: self.state,
                });
            }
        }
        Ok(())
    }

    fn publish(&self, update: LeaseUpdate) {
        match update {
            LeaseUpdate::Activated {
                name,
                tunnel_id,
                public_url,
            } => self.ctx.events.emit(ClientEvent::TunnelActive {
                name,
                tunnel_id,
                public_url,
            }),
            LeaseUpdate::Failed { name, reason } => self
                .ctx
                .events
                .emit(ClientEvent::TunnelFailed { name, reason }),
            LeaseUpdate::Stale => {}
        }
    }

    fn proxy_closed(&self, report: ProxyReport) {
        self.ctx.events.emit(ClientEvent::ProxyClosed { report });
    }
}

async fn read_auth_resp(source: &mut dyn FrameSource) -> Result<AuthResp, ControlError> {
    let frame = source.recv().await?.ok_or(ControlError::Closed)?;
    match MessageCodec::decode(&frame)? {
        Message::AuthResp(resp) => Ok(resp),
        other => Err(ControlError::Unexpected {
            kind: other.kind(),
            state: ChannelState::Authenticating,
        }),
    }
}

async fn write_loop(
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::UnboundedReceiver<Message>,
    io_timeout: Duration,
) -> Result<(), ControlError> {
    while let Some(msg) = rx.recv().await {
        trace!("Sending {}", msg.kind());
        let frame = MessageCodec::encode(&msg)?;
        timeout(io_timeout, sink.send(frame))
            .await
            .map_err(|_| ControlError::Timeout("control write", io_timeout))??;
    }
    let _ = timeout(io_timeout, sink.close()).await;
    Ok(())
}
