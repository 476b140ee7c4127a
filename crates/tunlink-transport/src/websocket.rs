//! WebSocket connector
//!
//! Each binary WebSocket message carries exactly one length-prefixed frame.
//! The control and proxy channels use fixed paths on the broker.

use crate::{
    ChannelKind, Connector, FrameSink, FrameSource, FramedConnection, TransportError,
    TransportResult,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use tunlink_proto::FrameCodec;
use url::Url;
use uuid::Uuid;

/// Broker path for the control channel
pub const CONTROL_PATH: &str = "/api/v1/ws/tunnel";
/// Broker path for proxy channels
pub const PROXY_PATH: &str = "/api/v1/ws/proxy";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Connects to a broker over `ws://` or `wss://`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    base: Url,
}

impl WebSocketConnector {
    /// Create a connector from a `ws://` or `wss://` URL; any path is replaced
    pub fn new(base: Url) -> TransportResult<Self> {
        match base.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported WebSocket scheme '{}'",
                    other
                )))
            }
        }
        if base.host_str().is_none() {
            return Err(TransportError::InvalidEndpoint(format!(
                "missing host in '{}'",
                base
            )));
        }
        Ok(Self { base })
    }

    /// URL used for the given channel kind
    pub fn url_for(&self, kind: ChannelKind) -> Url {
        let mut url = self.base.clone();
        url.set_path(match kind {
            ChannelKind::Control => CONTROL_PATH,
            ChannelKind::Proxy => PROXY_PATH,
        });
        url.set_query(None);
        url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, kind: ChannelKind) -> TransportResult<FramedConnection> {
        if self.base.scheme() == "wss" {
            ensure_crypto_provider();
        }

        let url = self.url_for(kind);
        debug!("Connecting to WebSocket: {}", url);

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))?;

        debug!("WebSocket connected ({:?})", kind);

        let (sink, source) = stream.split();
        Ok(FramedConnection {
            id: format!("ws-{}", Uuid::new_v4()),
            sink: Box::new(WsSink { inner: sink }),
            source: Box::new(WsSource { inner: source }),
        })
    }

    fn describe(&self) -> String {
        self.base.to_string()
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Bytes) -> TransportResult<()> {
        let data = FrameCodec::encode_frame(&frame)?;
        trace!("Sending {} bytes via WebSocket", data.len());

        self.inner
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }

    async fn close(&mut self) -> TransportResult<()> {
        debug!("Closing WebSocket connection");
        self.inner
            .close()
            .await
            .map_err(|e| TransportError::ConnectionError(e.to_string()))
    }
}

struct WsSource {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsSource {
    async fn recv(&mut self) -> TransportResult<Option<Bytes>> {
        loop {
            match self.inner.next().await {
                Some(Ok(Message::Binary(data))) => {
                    trace!("Received {} bytes via WebSocket", data.len());
                    return match FrameCodec::decode_exact(&data)? {
                        Some(body) => Ok(Some(body)),
                        None => Err(TransportError::ProtocolError(
                            "WebSocket message is not exactly one frame".to_string(),
                        )),
                    };
                }
                Some(Ok(Message::Close(_))) => {
                    debug!("WebSocket closed by remote");
                    return Ok(None);
                }
                // Pings are answered by tungstenite on the next read or write
                Some(Ok(msg)) => {
                    trace!("Ignoring WebSocket message type: {:?}", msg);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ConnectionError(e.to_string()));
                }
                None => {
                    debug!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_urls() {
        let connector =
            WebSocketConnector::new(Url::parse("wss://broker.example.com:8443/ignored").unwrap())
                .unwrap();

        assert_eq!(
            connector.url_for(ChannelKind::Control).as_str(),
            "wss://broker.example.com:8443/api/v1/ws/tunnel"
        );
        assert_eq!(
            connector.url_for(ChannelKind::Proxy).as_str(),
            "wss://broker.example.com:8443/api/v1/ws/proxy"
        );
    }

    #[test]
    fn test_rejects_non_websocket_scheme() {
        let err = WebSocketConnector::new(Url::parse("http://localhost:6400").unwrap()).unwrap_err();
        assert!(matches!(err, TransportError::InvalidEndpoint(_)));
    }
}
