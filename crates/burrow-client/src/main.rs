//! burrow CLI
//!
//! Expose a local HTTP server through a burrow tunnel server.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_client::events::{ConnectionState, TunnelEvent};
use burrow_client::{ConfigStore, EventBus, SupervisorOptions};

/// Expose a local HTTP server through a burrow tunnel
#[derive(Parser, Debug)]
#[command(name = "burrow", version)]
#[command(about = "Expose a local HTTP server through a burrow tunnel")]
struct Cli {
    /// Local port to forward to
    #[arg(short, long)]
    port: u16,

    /// Request a specific subdomain
    #[arg(short, long)]
    subdomain: Option<String>,

    /// Tunnel server URL, e.g. https://tunnel.example.com
    #[arg(long, env = "BURROW_SERVER")]
    server: Option<String>,

    /// API key; falls back to the config file
    #[arg(long, env = "BURROW_API_KEY")]
    api_key: Option<String>,

    /// Config file path
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();
}

fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".config/burrow/config.json"),
        None => PathBuf::from("burrow.json"),
    }
}

/// Subscribe to core events and narrate them; dashboards would hang off the
/// same bus.
fn spawn_event_logger(events: &EventBus, server_host: String) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match event {
                TunnelEvent::ConnectionState(ConnectionState::Connected { subdomain }) => {
                    info!("tunnel ready: https://{}.{}", subdomain, server_host);
                }
                TunnelEvent::ConnectionState(ConnectionState::Disconnected) => {
                    warn!("tunnel disconnected");
                }
                TunnelEvent::ConnectionState(ConnectionState::Connecting) => {}
                TunnelEvent::RequestStarted {
                    method, path, kind, ..
                } => {
                    info!("{} {} [{}]", method, path, kind.as_str());
                }
                TunnelEvent::RequestTimed { duration_ms, .. } => {
                    info!("completed in {} ms", duration_ms);
                }
                TunnelEvent::RequestCompleted { .. } | TunnelEvent::StreamProgress { .. } => {}
            }
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    if let Some(subdomain) = &cli.subdomain {
        if !burrow_proto::subdomain::is_valid(subdomain) {
            bail!(
                "invalid subdomain '{}': only lowercase letters, digits and hyphens are allowed",
                subdomain
            );
        }
    }

    let config_path = cli.config.unwrap_or_else(default_config_path);
    let store = Arc::new(ConfigStore::load(&config_path).context("failed to load config")?);
    let config = store.config();

    let server_url = cli
        .server
        .or(config.server_url)
        .context("no server URL configured; pass --server or set serverUrl in the config file")?;
    let api_key = cli
        .api_key
        .or(config.api_key)
        .context("no API key configured; pass --api-key or set apiKey in the config file")?;

    let initial_subdomain = cli
        .subdomain
        .clone()
        .or_else(|| store.subdomain_for(cli.port));

    let server_host = url::Url::parse(&server_url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| server_url.clone());

    let events = EventBus::default();
    spawn_event_logger(&events, server_host);

    info!(port = cli.port, %server_url, "starting tunnel");
    let options = SupervisorOptions {
        server_url,
        api_key,
        local_port: cli.port,
        initial_subdomain,
        store: Some(store),
    };

    tokio::select! {
        result = burrow_client::supervisor::run(options, events.clone()) => {
            result.context("tunnel failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }

    Ok(())
}
