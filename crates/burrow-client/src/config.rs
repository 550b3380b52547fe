//! On-disk client configuration

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-user configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    pub server_url: Option<String>,
    pub api_key: Option<String>,
    /// Client-side half of the sticky subdomain policy; the server cache is
    /// authoritative on conflict.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub port_subdomains: HashMap<u16, String>,
}

/// Loads the config once and persists sticky-subdomain updates.
pub struct ConfigStore {
    path: PathBuf,
    config: Mutex<ClientConfig>,
}

impl ConfigStore {
    /// A missing file is an empty config; a malformed one is an error the
    /// user should see.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => ClientConfig::default(),
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.clone(),
                    source,
                })
            }
        };
        Ok(Self {
            path,
            config: Mutex::new(config),
        })
    }

    pub fn config(&self) -> ClientConfig {
        self.config.lock().unwrap().clone()
    }

    pub fn subdomain_for(&self, port: u16) -> Option<String> {
        self.config
            .lock()
            .unwrap()
            .port_subdomains
            .get(&port)
            .cloned()
    }

    /// Record the subdomain the server assigned for `port`. Persistence is
    /// best-effort; a write failure never interrupts the tunnel.
    pub fn remember_subdomain(&self, port: u16, subdomain: &str) {
        {
            let mut config = self.config.lock().unwrap();
            if config.port_subdomains.get(&port).map(String::as_str) == Some(subdomain) {
                return;
            }
            config
                .port_subdomains
                .insert(port, subdomain.to_string());
        }
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "failed to persist subdomain mapping");
        } else {
            debug!(port, subdomain, "subdomain mapping saved");
        }
    }

    fn save(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(&self.config.lock().unwrap().clone())?;
        std::fs::write(&self.path, json)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::load(dir.path().join("nope.json")).unwrap();
        let config = store.config();
        assert!(config.server_url.is_none());
        assert!(config.port_subdomains.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "serverUrl": "https://tunnel.example.com",
                "apiKey": "secret",
                "portSubdomains": {"3000": "brave-fox-abcd"}
            }"#,
        )
        .unwrap();

        let store = ConfigStore::load(&path).unwrap();
        let config = store.config();
        assert_eq!(
            config.server_url.as_deref(),
            Some("https://tunnel.example.com")
        );
        assert_eq!(config.api_key.as_deref(), Some("secret"));
        assert_eq!(store.subdomain_for(3000).as_deref(), Some("brave-fox-abcd"));
        assert_eq!(store.subdomain_for(4000), None);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{ nope").unwrap();
        assert!(matches!(
            ConfigStore::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_remember_subdomain_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let store = ConfigStore::load(&path).unwrap();
        store.remember_subdomain(3000, "brave-fox-abcd");

        let reloaded = ConfigStore::load(&path).unwrap();
        assert_eq!(
            reloaded.subdomain_for(3000).as_deref(),
            Some("brave-fox-abcd")
        );
    }
}
