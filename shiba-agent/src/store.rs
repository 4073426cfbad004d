//! The authoritative peer store: an in-memory [`PeerMap`] guarded by a
//! single mutex, mirrored to disk for crash recovery.

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::cluster::ClusterClient;
use crate::error::PeerStoreError;
use crate::model::{Peer, PeerMap};

/// File name of the persisted peer map, placed in the OS temp directory.
pub const NODE_MAP_FILENAME: &str = "shiba-node-map";

pub struct PeerStore {
    map: Mutex<PeerMap>,
    path: PathBuf,
}

impl PeerStore {
    pub fn new() -> Self {
        PeerStore {
            map: Mutex::new(PeerMap::new()),
            path: std::env::temp_dir().join(NODE_MAP_FILENAME),
        }
    }

    #[cfg(test)]
    pub fn with_path(path: PathBuf) -> Self {
        PeerStore {
            map: Mutex::new(PeerMap::new()),
            path,
        }
    }

    /// A detached deep copy of the current map, safe to hand to a
    /// reconciler without holding the lock during kernel I/O.
    pub fn snapshot(&self) -> PeerMap {
        self.map.lock().unwrap().clone()
    }

    /// Atomically swap in a new map. Callers build the replacement by
    /// snapshot + edit, never by mutating in place.
    pub fn replace(&self, new_map: PeerMap) {
        *self.map.lock().unwrap() = new_map;
    }

    /// Serialize the current map to the on-disk file (mode 0600 on
    /// unix), truncating any existing contents. Errors are logged and
    /// swallowed — persistence is an optimization, never load-bearing.
    pub fn persist(&self) {
        let snapshot = self.snapshot();
        if let Err(e) = self.try_persist(&snapshot) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to persist node map");
        }
    }

    fn try_persist(&self, map: &PeerMap) -> Result<(), PeerStoreError> {
        let json = serde_json::to_vec_pretty(map).map_err(PeerStoreError::Serialize)?;
        write_file_mode_0600(&self.path, &json).map_err(|source| PeerStoreError::Open {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// At boot: read the cached file if present, validate each entry
    /// against the live cluster view, and replace the in-memory map with
    /// whatever survives. If the file is absent the map stays empty. If
    /// the cluster client GET fails wholesale, the entire cache is
    /// discarded rather than retried with partial data.
    pub async fn load_and_validate(&self, client: &dyn ClusterClient, api_timeout: Duration) {
        let loaded = match self.read_cached_map() {
            Ok(Some(map)) => map,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read cached node map, starting empty");
                return;
            }
        };

        let mut validated = PeerMap::new();
        for (name, cached) in loaded {
            match client.get_node(&name, api_timeout).await {
                Ok(node) => {
                    if cached_peer_still_matches(&cached, &node) {
                        validated.insert(name, cached);
                    } else {
                        tracing::info!(peer = %name, "cached peer no longer matches live node, dropping");
                    }
                }
                Err(crate::error::ClusterError::NotFound(_)) => {
                    tracing::info!(peer = %name, "cached peer no longer exists, dropping");
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "cache validation GET failed, discarding entire cache"
                    );
                    self.replace(PeerMap::new());
                    return;
                }
            }
        }
        self.replace(validated);
    }

    fn read_cached_map(&self) -> Result<Option<PeerMap>, PeerStoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PeerStoreError::Open {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        let map: PeerMap = serde_json::from_slice(&bytes).map_err(|source| PeerStoreError::Deserialize {
            path: self.path.display().to_string(),
            source,
        })?;
        Ok(Some(map))
    }
}

impl Default for PeerStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Compare a cached peer against the live node: name, endpoint (by
/// bytes), and canonical subnet set must all still match.
fn cached_peer_still_matches(cached: &Peer, live: &crate::cluster::Node) -> bool {
    let Some(live_endpoint) = live.find_internal_ipv6() else {
        return false;
    };
    if cached.name != live.name || cached.endpoint != live_endpoint {
        return false;
    }
    match crate::model::parse_subnets(live.raw_pod_cidrs()) {
        Ok(live_subnets) => cached.subnets == live_subnets,
        Err(_) => false,
    }
}

#[cfg(unix)]
fn write_file_mode_0600(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(true)
        .write(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)
}

#[cfg(not(unix))]
fn write_file_mode_0600(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    std::fs::write(path, bytes)
}
