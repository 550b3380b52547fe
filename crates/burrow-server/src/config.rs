//! Server configuration from the environment

use std::env;
use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_PORT: u16 = 3100;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Everything the server needs to run.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Pre-shared key clients must present on the control handshake.
    pub api_key: String,
    /// Wildcard base domain, e.g. `tunnel.example.com`.
    pub base_domain: String,
    /// TCP port the server binds.
    pub port: u16,
    /// Where the sticky subdomain cache is persisted.
    pub cache_path: PathBuf,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = require("API_KEY")?;
        let base_domain = require("BASE_DOMAIN")?;

        let port = match env::var("TUNNEL_PORT") {
            Ok(value) => value.parse().map_err(|_| ConfigError::Invalid {
                name: "TUNNEL_PORT",
                value,
            })?,
            Err(_) => DEFAULT_PORT,
        };

        let cache_path = env::var("SUBDOMAIN_CACHE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("subdomains.json"));

        Ok(Self {
            api_key,
            base_domain,
            port,
            cache_path,
        })
    }
}

fn require(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name)),
    }
}
