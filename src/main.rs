//! tunlink CLI - expose local services through a tunnel broker
//!
//! Keeps a control channel open, registers the requested tunnels and
//! reconnects automatically when the connection drops.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunlink_client::{
    ClientConfig, ClientContext, StaticToken, TracingSink, TunnelClient, TunnelSpec,
};
use tunlink_proto::TunnelProtocol;

/// tunlink - Expose local services through a tunnel broker
#[derive(Parser, Debug)]
#[command(name = "tunlink")]
#[command(about = "tunlink - Expose local services through a tunnel broker")]
#[command(version)]
#[command(long_about = r#"
Connect to a tunnel broker and expose one or more local ports on public
URLs. Tunnels are restored automatically after every reconnect.

EXAMPLES:
  # Expose a local web server
  tunlink --token $TOKEN --http 3000 --subdomain myapp

  # Expose several services from a config file
  tunlink --config tunlink.yaml

ENVIRONMENT VARIABLES:
  TUNLINK_SERVER_ENDPOINT  Broker address (default localhost:6400)
  TUNLINK_AUTH_TOKEN       Authentication token
  TUNLINK_LOG_LEVEL        Log level (RUST_LOG takes precedence)
"#)]
struct Cli {
    /// Broker address (host:port, ws://, wss:// or tcp://)
    #[arg(long, env = "TUNLINK_SERVER_ENDPOINT")]
    server: Option<String>,

    /// Authentication token
    #[arg(long, env = "TUNLINK_AUTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TUNLINK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// YAML configuration file; command-line values override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Expose a local port over HTTP (repeatable)
    #[arg(long, value_name = "PORT")]
    http: Vec<u16>,

    /// Expose a local port over HTTPS (repeatable)
    #[arg(long, value_name = "PORT")]
    https: Vec<u16>,

    /// Expose a local port as a raw TCP tunnel (repeatable)
    #[arg(long, value_name = "PORT")]
    tcp: Vec<u16>,

    /// Requested subdomain for the first HTTP/HTTPS tunnel
    #[arg(long)]
    subdomain: Option<String>,

    /// Host the local services listen on
    #[arg(long)]
    local_host: Option<String>,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Merge the config file (if any) with command-line values
fn build_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = match &cli.config {
        Some(path) => ClientConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(server) = &cli.server {
        config.server_endpoint = server.clone();
    }
    if let Some(host) = &cli.local_host {
        config.local_host = host.clone();
    }

    let mut subdomain = cli.subdomain.clone();
    let ad_hoc = cli
        .http
        .iter()
        .map(|port| (TunnelProtocol::Http, *port))
        .chain(cli.https.iter().map(|port| (TunnelProtocol::Https, *port)))
        .chain(cli.tcp.iter().map(|port| (TunnelProtocol::Tcp, *port)));
    for (protocol, port) in ad_hoc {
        let mut spec = TunnelSpec::new(protocol, port);
        if protocol != TunnelProtocol::Tcp {
            spec.subdomain = subdomain.take();
        }
        config.tunnels.push(spec);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(&cli.log_level);

    let config = build_config(&cli)?;

    info!("tunlink starting...");
    info!("Broker: {}", config.server_endpoint);
    for tunnel in &config.tunnels {
        info!(
            "Tunnel {}: {} -> {}:{}",
            tunnel.name, tunnel.protocol, config.local_host, tunnel.local_port
        );
    }

    let token = StaticToken::new(cli.token.clone().unwrap_or_default());
    let ctx = ClientContext::new(config, Arc::new(token), Arc::new(TracingSink))
        .context("Failed to set up client")?;
    let client = TunnelClient::start(ctx).context("Failed to start tunnel client")?;

    // Ctrl+C drains live connections before exiting
    let shutdown = client.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down...");
            shutdown.cancel();
        }
    });

    match client.wait().await {
        Ok(()) => {
            info!("tunlink stopped");
            Ok(())
        }
        Err(e) => {
            error!("Tunnel client failed: {}", e);
            Err(e).context("Tunnel client failed")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ad_hoc_tunnels() {
        let cli = Cli::parse_from([
            "tunlink",
            "--server",
            "broker.example.com",
            "--http",
            "3000",
            "--tcp",
            "22",
            "--subdomain",
            "myapp",
        ]);
        let config = build_config(&cli).unwrap();

        assert_eq!(config.server_endpoint, "broker.example.com");
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0].protocol, TunnelProtocol::Http);
        assert_eq!(config.tunnels[0].subdomain.as_deref(), Some("myapp"));
        assert_eq!(config.tunnels[1].protocol, TunnelProtocol::Tcp);
        assert_eq!(config.tunnels[1].subdomain, None);
    }

    #[test]
    fn test_no_tunnels_is_an_error() {
        let cli = Cli::parse_from(["tunlink", "--server", "localhost:6400"]);
        assert!(build_config(&cli).is_err());
    }
}
