//! Scripted broker for integration tests, speaking over the in-memory transport

#![allow(dead_code)]

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tunlink_client::{
    ClientConfig, ClientContext, ClientEvent, ReconnectConfig, StaticToken, Timeouts,
    TunnelClient, TunnelSpec,
};
use tunlink_proto::{Auth, AuthResp, Message, MessageCodec, NewTunnel, RegProxy, ReqTunnel};
use tunlink_transport::{
    memory_transport, ChannelKind, FramedConnection, MemoryConnector, MemoryListener,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn fast_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(1),
        auth: Duration::from_secs(1),
        heartbeat_interval: Duration::from_secs(30),
        missed_pongs: 3,
        tunnel_request: Duration::from_secs(5),
        drain_grace: Duration::from_millis(300),
        linger: Duration::from_millis(200),
        io: Duration::from_secs(2),
        snapshot: Duration::from_millis(50),
    }
}

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_backoff: Duration::from_millis(20),
        max_backoff: Duration::from_millis(100),
        multiplier: 2.0,
        jitter: 0.0,
        stability_window: Duration::from_secs(30),
        max_attempts: None,
    }
}

pub fn config(tunnels: Vec<TunnelSpec>) -> ClientConfig {
    let mut builder = ClientConfig::builder()
        .server_endpoint("memory")
        .local_host("127.0.0.1")
        .timeouts(fast_timeouts())
        .reconnect(fast_reconnect());
    for tunnel in tunnels {
        builder = builder.tunnel(tunnel);
    }
    builder.build().unwrap()
}

/// A running client wired to a fake broker
pub struct TestClient {
    pub client: TunnelClient,
    pub events: Events,
    pub broker: FakeBroker,
    pub connector: MemoryConnector,
}

pub fn start(config: ClientConfig, token: &str) -> TestClient {
    let (connector, listener) = memory_transport();
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = ClientContext::with_connector(
        config,
        Arc::new(StaticToken::new(token)),
        Arc::new(tx),
        Arc::new(connector.clone()),
    );
    TestClient {
        client: TunnelClient::start(ctx).unwrap(),
        events: Events { rx },
        broker: FakeBroker { listener },
        connector,
    }
}

/// Local service that echoes everything back
pub async fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    port
}

pub struct Events {
    rx: mpsc::UnboundedReceiver<ClientEvent>,
}

impl Events {
    /// Skip events until one matches
    pub async fn wait_for(&mut self, mut pred: impl FnMut(&ClientEvent) -> bool) -> ClientEvent {
        timeout(WAIT, async {
            loop {
                let event = self.rx.recv().await.expect("event stream ended");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    pub fn drain(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub struct FakeBroker {
    listener: MemoryListener,
}

impl FakeBroker {
    pub async fn accept(&mut self, kind: ChannelKind) -> BrokerConn {
        let accepted = timeout(WAIT, self.listener.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped");
        assert_eq!(accepted.kind, kind);
        BrokerConn {
            conn: accepted.conn,
            auto_pong: true,
        }
    }

    /// True if no connection arrives within `wait`
    pub async fn stays_quiet(&mut self, wait: Duration) -> bool {
        !matches!(timeout(wait, self.listener.accept()).await, Ok(Some(_)))
    }

    /// Accept a control channel and return the `Auth` it opened with
    pub async fn accept_control(&mut self) -> (BrokerConn, Auth) {
        let mut conn = self.accept(ChannelKind::Control).await;
        match conn.recv().await {
            Message::Auth(auth) => (conn, auth),
            other => panic!("expected Auth, got {:?}", other),
        }
    }

    /// Accept a control channel and let it in as `client_id`
    pub async fn handshake(&mut self, client_id: &str) -> BrokerConn {
        let (mut conn, _auth) = self.accept_control().await;
        conn.send(Message::AuthResp(AuthResp {
            client_id: client_id.to_string(),
            error: None,
        }))
        .await;
        conn
    }

    /// Accept a proxy channel and check its `RegProxy`
    pub async fn accept_proxy(&mut self, conn_id: u64) -> BrokerConn {
        let mut conn = self.accept(ChannelKind::Proxy).await;
        assert_eq!(conn.recv().await, Message::RegProxy(RegProxy { conn_id }));
        conn
    }
}

pub struct BrokerConn {
    conn: FramedConnection,
    /// Answer client pings instead of returning them
    pub auto_pong: bool,
}

impl BrokerConn {
    pub async fn send(&mut self, msg: Message) {
        let frame = MessageCodec::encode(&msg).unwrap();
        self.conn.sink.send(frame).await.unwrap();
    }

    pub async fn send_raw(&mut self, data: &[u8]) {
        self.conn
            .sink
            .send(Bytes::copy_from_slice(data))
            .await
            .unwrap();
    }

    pub async fn recv_raw(&mut self) -> Option<Bytes> {
        timeout(WAIT, self.conn.source.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
    }

    /// Next message from the client
    pub async fn recv(&mut self) -> Message {
        loop {
            let frame = self.recv_raw().await.expect("client closed the channel");
            let msg = MessageCodec::decode(&frame).unwrap();
            if self.auto_pong && msg == Message::ping() {
                self.send(Message::pong()).await;
                continue;
            }
            return msg;
        }
    }

    /// Collect `n` tunnel requests
    pub async fn recv_tunnel_requests(&mut self, n: usize) -> Vec<ReqTunnel> {
        let mut requests = Vec::new();
        while requests.len() < n {
            match self.recv().await {
                Message::ReqTunnel(req) => requests.push(req),
                other => panic!("expected ReqTunnel, got {:?}", other),
            }
        }
        requests
    }

    /// Answer a tunnel request successfully
    pub async fn grant(&mut self, req: &ReqTunnel, tunnel_id: &str) {
        self.send(Message::NewTunnel(NewTunnel {
            req_id: req.req_id,
            tunnel_id: tunnel_id.to_string(),
            public_url: format!("https://{}.example.com", tunnel_id),
            error: None,
        }))
        .await;
    }

    /// Read raw bytes until `len` have arrived
    pub async fn read_bytes(&mut self, len: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < len {
            let frame = self.recv_raw().await.expect("channel closed early");
            out.extend_from_slice(&frame);
        }
        out
    }

    /// Wait until the client closes the channel, skipping anything else
    pub async fn expect_closed(&mut self) {
        timeout(WAIT, async {
            while let Ok(Some(_)) = self.conn.source.recv().await {}
        })
        .await
        .expect("channel was not closed");
    }

    pub async fn close(&mut self) {
        let _ = self.conn.sink.close().await;
    }
}
