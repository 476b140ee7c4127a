//! Loading client configuration from YAML files

use std::io::Write;
use std::time::Duration;
use tunlink_client::{ClientConfig, TunnelError};
use tunlink_proto::TunnelProtocol;

#[test]
fn test_load_yaml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
server_endpoint: wss://broker.example.com
local_host: 127.0.0.1
max_auth_failures: 5
tunnels:
  - name: web
    protocol: https
    local_port: 3000
    subdomain: myapp
    basic_auth: "admin:secret"
  - protocol: tcp
    local_port: 5432
timeouts:
  connect: 2500
  drain_grace: 1000
reconnect:
  max_backoff: 30000
  jitter: 0.1
"#
    )
    .unwrap();

    let config = ClientConfig::load(file.path()).unwrap();
    config.validate().unwrap();

    assert_eq!(config.server_endpoint, "wss://broker.example.com");
    assert_eq!(config.local_host, "127.0.0.1");
    assert_eq!(config.max_auth_failures, 5);

    assert_eq!(config.tunnels.len(), 2);
    assert_eq!(config.tunnels[0].name, "web");
    assert_eq!(config.tunnels[0].protocol, TunnelProtocol::Https);
    assert_eq!(config.tunnels[0].basic_auth.as_deref(), Some("admin:secret"));
    assert_eq!(config.tunnels[1].name, "tcp-5432");

    assert_eq!(config.timeouts.connect, Duration::from_millis(2500));
    assert_eq!(config.timeouts.drain_grace, Duration::from_secs(1));
    assert_eq!(config.timeouts.missed_pongs, 3);
    assert_eq!(config.reconnect.max_backoff, Duration::from_secs(30));
    assert_eq!(config.reconnect.initial_backoff, Duration::from_secs(1));
    assert!((config.reconnect.jitter - 0.1).abs() < f64::EPSILON);
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = ClientConfig::load(dir.path().join("absent.yaml"));
    assert!(matches!(result, Err(TunnelError::Config(_))));
}

#[test]
fn test_file_without_tunnels_fails_validation() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "server_endpoint: localhost:6400").unwrap();

    let config = ClientConfig::load(file.path()).unwrap();
    assert!(config.validate().is_err());
}
