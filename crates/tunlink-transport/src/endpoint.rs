//! Broker endpoint parsing

use crate::{Connector, TcpConnector, TransportError, TransportResult, WebSocketConnector};
use std::sync::Arc;
use url::Url;

/// A parsed broker endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// WebSocket broker (`ws://` or `wss://`)
    WebSocket(Url),
    /// Raw framed TCP broker, `host:port`
    Tcp(String),
}

fn is_local_host(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host == "localhost" || host == "127.0.0.1" || host == "::1"
}

fn parse_url(s: &str) -> TransportResult<Url> {
    Url::parse(s).map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", s, e)))
}

impl Endpoint {
    /// Parse an endpoint string
    ///
    /// Accepts `ws://`, `wss://`, `http://` (as `ws`), `https://` (as `wss`)
    /// and `tcp://host:port`. A bare `host:port` uses `ws` for loopback
    /// hosts and `wss` otherwise.
    pub fn parse(s: &str) -> TransportResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidEndpoint(
                "endpoint is empty".to_string(),
            ));
        }

        if let Some(addr) = s.strip_prefix("tcp://") {
            let addr = addr.trim_end_matches('/');
            match addr.rsplit_once(':') {
                Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                    return Ok(Endpoint::Tcp(addr.to_string()))
                }
                _ => {
                    return Err(TransportError::InvalidEndpoint(format!(
                        "expected tcp://host:port, got '{}'",
                        s
                    )))
                }
            }
        }

        let url = if let Some(rest) = s.strip_prefix("http://") {
            parse_url(&format!("ws://{}", rest))?
        } else if let Some(rest) = s.strip_prefix("https://") {
            parse_url(&format!("wss://{}", rest))?
        } else if s.starts_with("ws://") || s.starts_with("wss://") {
            parse_url(s)?
        } else if s.contains("://") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme in '{}'",
                s
            )));
        } else {
            let host = s.split(['/', ':']).next().unwrap_or_default();
            let host = if s.starts_with('[') {
                s.split(']').next().unwrap_or_default()
            } else {
                host
            };
            let scheme = if is_local_host(host) { "ws" } else { "wss" };
            parse_url(&format!("{}://{}", scheme, s))?
        };

        if url.host_str().is_none() {
            return Err(TransportError::InvalidEndpoint(format!(
                "missing host in '{}'",
                s
            )));
        }
        Ok(Endpoint::WebSocket(url))
    }

    /// Build the connector for this endpoint
    pub fn connector(&self) -> TransportResult<Arc<dyn Connector>> {
        Ok(match self {
            Endpoint::WebSocket(url) => Arc::new(WebSocketConnector::new(url.clone())?),
            Endpoint::Tcp(addr) => Arc::new(TcpConnector::new(addr.clone())),
        })
    }
}

/// Parse an endpoint string and build its connector
pub fn connector_for_endpoint(endpoint: &str) -> TransportResult<Arc<dyn Connector>> {
    Endpoint::parse(endpoint)?.connector()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ws(s: &str) -> String {
        match Endpoint::parse(s).unwrap() {
            Endpoint::WebSocket(url) => url.to_string(),
            other => panic!("expected websocket endpoint, got {:?}", other),
        }
    }

    #[test]
    fn test_bare_host_scheme_selection() {
        assert_eq!(ws("localhost:6400"), "ws://localhost:6400/");
        assert_eq!(ws("127.0.0.1:6400"), "ws://127.0.0.1:6400/");
        assert_eq!(ws("broker.example.com"), "wss://broker.example.com/");
        assert_eq!(ws("broker.example.com:8443"), "wss://broker.example.com:8443/");
    }

    #[test]
    fn test_http_schemes_map_to_websocket() {
        assert_eq!(ws("http://localhost:6400"), "ws://localhost:6400/");
        assert_eq!(ws("https://broker.example.com"), "wss://broker.example.com/");
        assert_eq!(ws("wss://broker.example.com:9000"), "wss://broker.example.com:9000/");
    }

    #[test]
    fn test_tcp_endpoint() {
        assert_eq!(
            Endpoint::parse("tcp://127.0.0.1:4443").unwrap(),
            Endpoint::Tcp("127.0.0.1:4443".to_string())
        );
        assert!(Endpoint::parse("tcp://127.0.0.1").is_err());
        assert!(Endpoint::parse("tcp://:99").is_err());
    }

    #[test]
    fn test_invalid_endpoints() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse("ftp://example.com").is_err());
    }

    #[test]
    fn test_connector_for_endpoint() {
        let connector = connector_for_endpoint("tcp://localhost:7000").unwrap();
        assert_eq!(connector.describe(), "tcp://localhost:7000");
    }
}
