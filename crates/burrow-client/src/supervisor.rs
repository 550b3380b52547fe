//! Reconnect supervisor
//!
//! The first dial is load-bearing: if it fails the process reports the error
//! and exits. Once a session has been open, the supervisor reconnects forever
//! with exponential backoff, always carrying the last observed subdomain so
//! the public URL survives.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backoff::Backoff;
use crate::config::ConfigStore;
use crate::events::{ConnectionState, EventBus, TunnelEvent};
use crate::session::{self, SessionError, SessionOptions};

pub struct SupervisorOptions {
    pub server_url: String,
    pub api_key: String,
    pub local_port: u16,
    /// From `--subdomain` or the config file's `portSubdomains` map.
    pub initial_subdomain: Option<String>,
    pub store: Option<Arc<ConfigStore>>,
}

/// Run sessions until the process is stopped. Only an initial connection
/// failure returns an error.
pub async fn run(options: SupervisorOptions, events: EventBus) -> Result<(), SessionError> {
    let mut backoff = Backoff::default();
    let mut sticky = options.initial_subdomain.clone();
    let mut connected_once = false;

    loop {
        events.emit(TunnelEvent::ConnectionState(ConnectionState::Connecting));
        let session_options = SessionOptions {
            server_url: options.server_url.clone(),
            api_key: options.api_key.clone(),
            local_port: options.local_port,
            subdomain: sticky.clone(),
            store: options.store.clone(),
        };

        match session::run(&session_options, events.clone()).await {
            Ok(close) => {
                connected_once = true;
                backoff.reset();
                if let Some(subdomain) = close.subdomain {
                    sticky = Some(subdomain);
                }
                warn!("control channel lost; reconnecting");
            }
            Err(e) if !connected_once => return Err(e),
            Err(e) => {
                warn!(error = %e, "reconnect attempt failed");
            }
        }

        backoff.wait().await;
        info!(attempt = backoff.attempt(), "reconnecting");
    }
}
