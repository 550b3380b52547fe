//! Public edge endpoint for burrow tunnels
//!
//! One axum server carries the whole surface: the `/__tunnel__/*` endpoints
//! (health, key verification, status, the authenticated control-channel
//! upgrade) and a fallback that dispatches every other request to the tunnel
//! matching its subdomain.

pub mod allocator;
pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod passthrough;

use std::sync::Arc;

use burrow_control::TunnelRegistry;

use crate::cache::SubdomainCache;
use crate::config::ServerConfig;

/// Shared state behind every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: Arc<TunnelRegistry>,
    pub cache: Arc<SubdomainCache>,
}

impl AppState {
    /// Build the process state; loads the sticky cache and spawns its writer.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let cache = SubdomainCache::open(&config.cache_path);
        Arc::new(Self {
            config,
            registry: Arc::new(TunnelRegistry::new()),
            cache,
        })
    }
}
