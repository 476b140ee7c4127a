//! Control-channel message types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every message exchanged on a control or proxy channel.
///
/// Each variant wraps a payload struct so the payload can be encoded on its
/// own behind the one-byte type tag (see [`crate::codec::MessageCodec`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Auth(Auth),
    AuthResp(AuthResp),
    ReqTunnel(ReqTunnel),
    NewTunnel(NewTunnel),
    ReqProxy(ReqProxy),
    RegProxy(RegProxy),
    Ping(Ping),
    Pong(Pong),
    Error(ErrorMsg),
    TunnelClosed(TunnelClosed),
}

impl Message {
    /// Short variant name, used in logs and protocol-fault descriptions
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth(_) => "Auth",
            Message::AuthResp(_) => "AuthResp",
            Message::ReqTunnel(_) => "ReqTunnel",
            Message::NewTunnel(_) => "NewTunnel",
            Message::ReqProxy(_) => "ReqProxy",
            Message::RegProxy(_) => "RegProxy",
            Message::Ping(_) => "Ping",
            Message::Pong(_) => "Pong",
            Message::Error(_) => "Error",
            Message::TunnelClosed(_) => "TunnelClosed",
        }
    }

    pub fn ping() -> Self {
        Message::Ping(Ping {})
    }

    pub fn pong() -> Self {
        Message::Pong(Pong {})
    }
}

/// Client handshake, the first frame on every control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
    pub client_version: String,
    pub os: String,
    pub arch: String,
}

impl Auth {
    /// Build a handshake carrying this build's version and platform
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthResp {
    pub client_id: String,
    pub error: Option<String>,
}

/// Request for one public tunnel
///
/// `req_id` is generated by the client and echoed in the matching
/// [`NewTunnel`] (or in an [`ErrorMsg`] that rejects the request).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqTunnel {
    pub req_id: u64,
    pub protocol: TunnelProtocol,
    pub local_port: u16,
    pub subdomain: Option<String>,
    pub basic_auth: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTunnel {
    pub req_id: u64,
    pub tunnel_id: String,
    pub public_url: String,
    pub error: Option<String>,
}

/// Broker asks the client to open a proxy connection for `tunnel_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqProxy {
    pub tunnel_id: String,
    pub conn_id: u64,
}

/// First frame on a proxy channel, binding it to a `ReqProxy`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegProxy {
    pub conn_id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {}

/// Error report, in either direction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: String,
    pub message: String,
    /// Correlation id of the `ReqTunnel` this error answers, if any
    pub req_id: Option<u64>,
}

impl ErrorMsg {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            req_id: None,
        }
    }
}

/// Broker-initiated revocation of a single tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelClosed {
    pub tunnel_id: String,
    pub reason: String,
}

/// Error codes the client sends back to the broker
pub mod error_codes {
    /// `ReqProxy` named a tunnel that is unknown or not active
    pub const TUNNEL_NOT_FOUND: &str = "TUNNEL_NOT_FOUND";
    /// The local target for a proxy connection could not be reached
    pub const LOCAL_UNREACHABLE: &str = "LOCAL_UNREACHABLE";
}

/// Public tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelProtocol {
    Http,
    Https,
    Tcp,
}

impl TunnelProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelProtocol::Http => "http",
            TunnelProtocol::Https => "https",
            TunnelProtocol::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TunnelProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TunnelProtocol::Http),
            "https" => Ok(TunnelProtocol::Https),
            "tcp" => Ok(TunnelProtocol::Tcp),
            other => Err(format!("unsupported protocol: {}", other)),
        }
    }
}
