//! Client configuration

use crate::error::TunnelError;
use crate::reconnect::ReconnectConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tunlink_proto::TunnelProtocol;

/// Broker used when none is configured
pub const DEFAULT_SERVER_ENDPOINT: &str = "localhost:6400";

/// One desired tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Display name; defaults to `<protocol>-<port>`
    #[serde(default)]
    pub name: String,
    pub protocol: TunnelProtocol,
    pub local_port: u16,
    #[serde(default)]
    pub subdomain: Option<String>,
    /// `user:password` for broker-side basic auth
    #[serde(default)]
    pub basic_auth: Option<String>,
}

impl TunnelSpec {
    pub fn new(protocol: TunnelProtocol, local_port: u16) -> Self {
        Self {
            name: default_name(protocol, local_port),
            protocol,
            local_port,
            subdomain: None,
            basic_auth: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn subdomain(mut self, subdomain: impl Into<String>) -> Self {
        self.subdomain = Some(subdomain.into());
        self
    }

    pub fn basic_auth(mut self, credentials: impl Into<String>) -> Self {
        self.basic_auth = Some(credentials.into());
        self
    }
}

fn default_name(protocol: TunnelProtocol, local_port: u16) -> String {
    format!("{}-{}", protocol, local_port)
}

/// Timeouts and intervals used by the control loop and relays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Establishing a transport connection
    #[serde(with = "duration_ms")]
    pub connect: Duration,
    /// Waiting for `AuthResp`
    #[serde(with = "duration_ms")]
    pub auth: Duration,
    /// Interval between heartbeat pings
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before the channel is considered dead
    pub missed_pongs: u32,
    /// Waiting for the `NewTunnel` answering a `ReqTunnel`
    #[serde(with = "duration_ms")]
    pub tunnel_request: Duration,
    /// How long live proxy connections may finish during a graceful stop
    #[serde(with = "duration_ms")]
    pub drain_grace: Duration,
    /// How long a cancelled copy loop may take to finish its in-flight I/O
    #[serde(with = "duration_ms")]
    pub linger: Duration,
    /// Bound on every single network write
    #[serde(with = "duration_ms")]
    pub io: Duration,
    /// Interval between traffic snapshots
    #[serde(with = "duration_ms")]
    pub snapshot: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            auth: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(20),
            missed_pongs: 3,
            tunnel_request: Duration::from_secs(10),
            drain_grace: Duration::from_secs(5),
            linger: Duration::from_secs(2),
            io: Duration::from_secs(30),
            snapshot: Duration::from_secs(1),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server_endpoint: String,
    /// Host the local services listen on
    pub local_host: String,
    pub tunnels: Vec<TunnelSpec>,
    pub timeouts: Timeouts,
    pub reconnect: ReconnectConfig,
    /// Consecutive authentication rejections tolerated before giving up
    pub max_auth_failures: u32,
}

/// Helper module for serializing Duration as milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_endpoint: DEFAULT_SERVER_ENDPOINT.to_string(),
            local_host: "localhost".to_string(),
            tunnels: Vec::new(),
            timeouts: Timeouts::default(),
            reconnect: ReconnectConfig::default(),
            max_auth_failures: 3,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Parse a YAML document; missing fields take their defaults
    pub fn from_yaml(yaml: &str) -> Result<Self, TunnelError> {
        let mut config: ClientConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TunnelError::Config(format!("invalid YAML: {}", e)))?;
        config.fill_default_names();
        Ok(config)
    }

    /// Load a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, TunnelError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| TunnelError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml(&yaml)
    }

    fn fill_default_names(&mut self) {
        for tunnel in &mut self.tunnels {
            if tunnel.name.is_empty() {
                tunnel.name = default_name(tunnel.protocol, tunnel.local_port);
            }
        }
    }

    /// Check the configuration is usable by the supervisor
    pub fn validate(&self) -> Result<(), TunnelError> {
        let fail = |msg: String| Err(TunnelError::Config(msg));

        if self.server_endpoint.trim().is_empty() {
            return fail("server_endpoint is required".to_string());
        }
        if self.tunnels.is_empty() {
            return fail("at least one tunnel must be configured".to_string());
        }

        let mut names = HashSet::new();
        for tunnel in &self.tunnels {
            if tunnel.local_port == 0 {
                return fail(format!("tunnel '{}' has local_port 0", tunnel.name));
            }
            if !names.insert(tunnel.name.as_str()) {
                return fail(format!("duplicate tunnel name '{}'", tunnel.name));
            }
        }

        if self.timeouts.heartbeat_interval.is_zero() || self.timeouts.snapshot.is_zero() {
            return fail("heartbeat and snapshot intervals must be non-zero".to_string());
        }
        if self.timeouts.missed_pongs == 0 {
            return fail("missed_pongs must be at least 1".to_string());
        }
        if self.max_auth_failures == 0 {
            return fail("max_auth_failures must be at least 1".to_string());
        }
        let reconnect = &self.reconnect;
        if !reconnect.multiplier.is_finite() || reconnect.multiplier < 1.0 {
            return fail("reconnect.multiplier must be a finite number >= 1.0".to_string());
        }
        if !(0.0..=1.0).contains(&reconnect.jitter) {
            return fail("reconnect.jitter must be between 0.0 and 1.0".to_string());
        }
        if reconnect.initial_backoff > reconnect.max_backoff {
            return fail("reconnect.initial_backoff must not exceed max_backoff".to_string());
        }
        Ok(())
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn server_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.server_endpoint = endpoint.into();
        self
    }

    pub fn local_host(mut self, host: impl Into<String>) -> Self {
        self.config.local_host = host.into();
        self
    }

    pub fn tunnel(mut self, tunnel: TunnelSpec) -> Self {
        self.config.tunnels.push(tunnel);
        self
    }

    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.config.timeouts = timeouts;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.config.reconnect = reconnect;
        self
    }

    pub fn max_auth_failures(mut self, max: u32) -> Self {
        self.config.max_auth_failures = max;
        self
    }

    pub fn build(mut self) -> Result<ClientConfig, TunnelError> {
        self.config.fill_default_names();
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder()
            .server_endpoint("broker.example.com")
            .tunnel(TunnelSpec::new(TunnelProtocol::Http, 3000).subdomain("myapp"))
            .build()
            .unwrap();

        assert_eq!(config.server_endpoint, "broker.example.com");
        assert_eq!(config.tunnels.len(), 1);
        assert_eq!(config.tunnels[0].name, "http-3000");
        assert_eq!(config.timeouts.heartbeat_interval, Duration::from_secs(20));
        assert_eq!(config.max_auth_failures, 3);
    }

    #[test]
    fn test_config_builder_no_tunnels() {
        let result = ClientConfig::builder().build();
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_config_builder_duplicate_names() {
        let result = ClientConfig::builder()
            .tunnel(TunnelSpec::new(TunnelProtocol::Http, 3000))
            .tunnel(TunnelSpec::new(TunnelProtocol::Http, 3000))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_yaml_defaults_and_millis() {
        let config = ClientConfig::from_yaml(
            r#"
server_endpoint: "tcp://127.0.0.1:7000"
tunnels:
  - protocol: http
    local_port: 8080
    subdomain: web
  - name: ssh
    protocol: tcp
    local_port: 22
timeouts:
  heartbeat_interval: 500
reconnect:
  initial_backoff: 250
  max_attempts: 4
"#,
        )
        .unwrap();

        assert_eq!(config.tunnels[0].name, "http-8080");
        assert_eq!(config.tunnels[0].subdomain.as_deref(), Some("web"));
        assert_eq!(config.tunnels[1].name, "ssh");
        assert_eq!(config.timeouts.heartbeat_interval, Duration::from_millis(500));
        assert_eq!(config.timeouts.auth, Duration::from_secs(10));
        assert_eq!(config.reconnect.initial_backoff, Duration::from_millis(250));
        assert_eq!(config.reconnect.max_backoff, Duration::from_secs(60));
        assert_eq!(config.reconnect.max_attempts, Some(4));
        assert_eq!(config.local_host, "localhost");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_unusable_reconnect_settings() {
        let base = "tunnels:\n  - protocol: tcp\n    local_port: 22\nreconnect:\n";

        for bad in [
            "  multiplier: .nan",
            "  multiplier: .inf",
            "  jitter: .nan",
            "  jitter: 1.5",
            "  initial_backoff: 120000",
        ] {
            let config = ClientConfig::from_yaml(&format!("{}{}\n", base, bad)).unwrap();
            assert!(
                matches!(config.validate(), Err(TunnelError::Config(_))),
                "accepted {}",
                bad
            );
        }
    }

    #[test]
    fn test_huge_multiplier_is_valid_and_capped() {
        let config = ClientConfig::from_yaml(
            "tunnels:\n  - protocol: tcp\n    local_port: 22\nreconnect:\n  multiplier: 1.0e300\n  jitter: 0.0\n",
        )
        .unwrap();
        config.validate().unwrap();

        let mut backoff = crate::reconnect::Backoff::new(config.reconnect);
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay().unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_yaml_rejects_unknown_protocol() {
        let result = ClientConfig::from_yaml("tunnels:\n  - protocol: udp\n    local_port: 53\n");
        assert!(matches!(result, Err(TunnelError::Config(_))));
    }
}
