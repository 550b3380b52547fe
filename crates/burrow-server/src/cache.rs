//! Sticky subdomain cache
//!
//! Remembers `(apiKey, localPort) -> subdomain` across reconnects so a client
//! keeps its public URL. Keys are `sha256(apiKey)[0..8]:port` so the file
//! never contains the key itself. Writes are debounced and go through a
//! temp-file-and-rename so a crash can never leave torn JSON behind.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const WRITE_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    mappings: HashMap<String, String>,
}

/// Process-wide sticky subdomain cache backed by one JSON file.
pub struct SubdomainCache {
    path: PathBuf,
    mappings: Mutex<HashMap<String, String>>,
    dirty: mpsc::UnboundedSender<()>,
}

impl SubdomainCache {
    /// Load the cache (an absent or unreadable file starts empty) and spawn
    /// the debounced writer task.
    pub fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        let mappings = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheFile>(&bytes) {
                Ok(file) => file.mappings,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "subdomain cache unreadable; starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "subdomain cache unreadable; starting empty");
                HashMap::new()
            }
        };

        let (dirty, rx) = mpsc::unbounded_channel();
        let cache = Arc::new(Self {
            path,
            mappings: Mutex::new(mappings),
            dirty,
        });
        tokio::spawn(writer_task(Arc::downgrade(&cache), rx));
        cache
    }

    fn key(api_key: &str, port: u16) -> String {
        let digest = format!("{:x}", Sha256::digest(api_key.as_bytes()));
        format!("{}:{}", &digest[..8], port)
    }

    /// The subdomain previously registered for this key/port pair, if any.
    pub fn lookup(&self, api_key: &str, port: u16) -> Option<String> {
        self.mappings
            .lock()
            .unwrap()
            .get(&Self::key(api_key, port))
            .cloned()
    }

    /// Whether some other key/port pair has already claimed `subdomain`.
    pub fn reserved_by_other(&self, api_key: &str, port: u16, subdomain: &str) -> bool {
        let own = Self::key(api_key, port);
        self.mappings
            .lock()
            .unwrap()
            .iter()
            .any(|(key, value)| value == subdomain && *key != own)
    }

    /// Write-through after a successful registration. Any stale entry still
    /// pointing at `subdomain` under another key is dropped so a subdomain is
    /// reserved by at most one pair.
    pub fn insert(&self, api_key: &str, port: u16, subdomain: &str) {
        let own = Self::key(api_key, port);
        {
            let mut mappings = self.mappings.lock().unwrap();
            mappings.retain(|key, value| value != subdomain || *key == own);
            mappings.insert(own, subdomain.to_string());
        }
        let _ = self.dirty.send(());
    }

    /// Force the current state to disk, bypassing the debounce.
    pub fn flush(&self) -> io::Result<()> {
        self.write_snapshot()
    }

    fn write_snapshot(&self) -> io::Result<()> {
        let snapshot = CacheFile {
            mappings: self.mappings.lock().unwrap().clone(),
        };
        let json = serde_json::to_vec_pretty(&snapshot)?;

        let dir = self.path.parent().filter(|p| !p.as_os_str().is_empty());
        let mut tmp = tempfile::NamedTempFile::new_in(dir.unwrap_or(Path::new(".")))?;
        tmp.write_all(&json)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        debug!(path = %self.path.display(), entries = snapshot.mappings.len(), "subdomain cache written");
        Ok(())
    }
}

async fn writer_task(cache: Weak<SubdomainCache>, mut rx: mpsc::UnboundedReceiver<()>) {
    while rx.recv().await.is_some() {
        tokio::time::sleep(WRITE_DEBOUNCE).await;
        // Coalesce every notification that arrived during the debounce.
        while rx.try_recv().is_ok() {}
        let Some(cache) = cache.upgrade() else { break };
        if let Err(e) = cache.write_snapshot() {
            warn!(path = %cache.path.display(), error = %e, "failed to write subdomain cache");
        }
    }
}
