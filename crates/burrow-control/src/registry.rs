//! Process-wide tunnel registry
//!
//! Maps subdomains to live tunnels. Read-mostly: lookups take a read lock,
//! register/unregister take the write lock. Eviction policy (same-key
//! reconnects, key conflicts) lives in the caller; the registry itself only
//! refuses duplicate subdomains.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info};

use crate::tunnel::Tunnel;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("subdomain '{0}' is already registered")]
    SubdomainTaken(String),
}

/// Registry of live tunnels keyed by subdomain.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, Arc<Tunnel>>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh tunnel. Fails if the subdomain is taken.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        let mut tunnels = self.tunnels.write().unwrap();
        let subdomain = tunnel.subdomain().to_string();
        if tunnels.contains_key(&subdomain) {
            return Err(RegistryError::SubdomainTaken(subdomain));
        }
        info!(%subdomain, "tunnel registered");
        tunnels.insert(subdomain, tunnel);
        Ok(())
    }

    pub fn get(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        self.tunnels.read().unwrap().get(subdomain).cloned()
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.tunnels.read().unwrap().contains_key(subdomain)
    }

    /// Remove and tear down a tunnel by subdomain.
    pub fn unregister(&self, subdomain: &str) -> Option<Arc<Tunnel>> {
        let removed = self.tunnels.write().unwrap().remove(subdomain);
        match &removed {
            Some(tunnel) => {
                tunnel.shutdown("tunnel disconnected");
                info!(%subdomain, "tunnel unregistered");
            }
            None => debug!(%subdomain, "unregister for unknown subdomain"),
        }
        removed
    }

    /// Remove `tunnel` only if it is still the one registered under its
    /// subdomain. A control loop whose tunnel was already evicted by a
    /// reconnect must not tear down its replacement.
    pub fn unregister_exact(&self, tunnel: &Arc<Tunnel>) -> bool {
        let mut tunnels = self.tunnels.write().unwrap();
        match tunnels.get(tunnel.subdomain()) {
            Some(current) if Arc::ptr_eq(current, tunnel) => {
                tunnels.remove(tunnel.subdomain());
                drop(tunnels);
                tunnel.shutdown("tunnel disconnected");
                info!(subdomain = %tunnel.subdomain(), "tunnel unregistered");
                true
            }
            _ => false,
        }
    }

    pub fn subdomains(&self) -> Vec<String> {
        self.tunnels.read().unwrap().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<Arc<Tunnel>> {
        self.tunnels.read().unwrap().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tunnels.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.read().unwrap().is_empty()
    }

    /// Whether any tunnel still has a request in flight; used by the
    /// shutdown grace period.
    pub fn has_pending_requests(&self) -> bool {
        self.tunnels
            .read()
            .unwrap()
            .values()
            .any(|t| t.pending_requests() > 0)
    }

    /// Tear down every tunnel (process shutdown).
    pub fn shutdown_all(&self, reason: &str) {
        let drained: Vec<_> = {
            let mut tunnels = self.tunnels.write().unwrap();
            tunnels.drain().collect()
        };
        for (subdomain, tunnel) in drained {
            debug!(%subdomain, "closing tunnel for shutdown");
            tunnel.close(1001, reason);
            tunnel.shutdown(reason);
        }
    }
}
