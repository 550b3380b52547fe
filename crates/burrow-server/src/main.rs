//! burrow-server binary
//!
//! Binds the public port, serves the tunnel surface and tears everything down
//! cleanly on SIGINT: a short grace period for in-flight requests, then every
//! tunnel is closed and the sticky cache flushed.

use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_server::{api, config::ServerConfig, AppState};

/// How long in-flight requests get to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let config = ServerConfig::from_env().context("invalid server configuration")?;
    let port = config.port;
    let base_domain = config.base_domain.clone();
    let state = AppState::new(config);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("failed to bind port {}", port))?;
    info!(port, %base_domain, "tunnel server listening");

    let app = api::router(state.clone());
    tokio::select! {
        result = async { axum::serve(listener, app).await } => {
            result.context("server error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            let deadline = Instant::now() + SHUTDOWN_GRACE;
            while state.registry.has_pending_requests() && Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            state.registry.shutdown_all("server shutting down");
            if let Err(e) = state.cache.flush() {
                warn!(error = %e, "failed to flush subdomain cache");
            }
        }
    }

    Ok(())
}
