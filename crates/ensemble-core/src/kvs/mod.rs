#[cfg(feature = "consul-kvs")]
pub mod consul;
#[cfg(feature = "consul-kvs")]
pub use consul::{ConsulKvs, ConsulKvsConfig};

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::EnsembleError;

/// A stored value together with its version token.
///
/// The version token is what `cas_put` compares against; `0` means
/// "the key must not exist yet".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: u64,
}

/// A node known to the store's catalog, with its advertised address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogNode {
    pub name: String,
    pub address: String,
}

/// Handle for a held distributed lock. Dropping the handle releases it.
pub trait HeldLock: Send + Sync {
    fn key(&self) -> &str;
}

/// Client-side view of the coordination store.
///
/// One handle is shared by the queue, the journal, the registry and the
/// operations; tests substitute [`MemoryKvs`].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, EnsembleError>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EnsembleError>;

    async fn delete(&self, key: &str) -> Result<(), EnsembleError>;

    /// All entries whose key starts with `prefix`, in key order.
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, EnsembleError>;

    /// Conditional put: succeeds only when the stored version still matches
    /// `version`. Returns `false` when another writer got there first.
    async fn cas_put(
        &self,
        key: &str,
        value: Vec<u8>,
        version: u64,
    ) -> Result<bool, EnsembleError>;

    /// Acquire the named distributed lock, waiting as long as it takes.
    async fn lock(&self, key: &str) -> Result<Box<dyn HeldLock>, EnsembleError>;

    /// Node catalog, consulted once at startup to resolve our own address.
    async fn catalog_nodes(&self) -> Result<Vec<CatalogNode>, EnsembleError>;
}

pub type DynKvStore = Arc<dyn KvStore>;

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    version: u64,
}

/// In-memory store for tests and offline runs.
///
/// Versions are drawn from a single monotonic clock so CAS semantics match
/// a real store; locks are per-key mutexes shared by every handle clone.
pub struct MemoryKvs {
    entries: DashMap<String, Stored>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    catalog: DashMap<String, String>,
    clock: AtomicU64,
}

impl MemoryKvs {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            catalog: DashMap::new(),
            clock: AtomicU64::new(0),
        }
    }

    /// Seed the node catalog, which a real store would populate itself.
    pub fn add_catalog_node(&self, name: impl Into<String>, address: impl Into<String>) {
        self.catalog.insert(name.into(), address.into());
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock_cell(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

impl Default for MemoryKvs {
    fn default() -> Self {
        Self::new()
    }
}

struct MemoryLock {
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl HeldLock for MemoryLock {
    fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl KvStore for MemoryKvs {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, EnsembleError> {
        Ok(self.entries.get(key).map(|stored| KvEntry {
            key: key.to_string(),
            value: stored.value.clone(),
            version: stored.version,
        }))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), EnsembleError> {
        let version = self.next_version();
        self.entries
            .insert(key.to_string(), Stored { value, version });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), EnsembleError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, EnsembleError> {
        let mut entries: Vec<KvEntry> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| KvEntry {
                key: entry.key().clone(),
                value: entry.value().value.clone(),
                version: entry.value().version,
            })
            .collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    async fn cas_put(
        &self,
        key: &str,
        value: Vec<u8>,
        version: u64,
    ) -> Result<bool, EnsembleError> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().version != version {
                    return Ok(false);
                }
                let next = self.next_version();
                occupied.insert(Stored {
                    value,
                    version: next,
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if version != 0 {
                    return Ok(false);
                }
                let next = self.next_version();
                vacant.insert(Stored {
                    value,
                    version: next,
                });
                Ok(true)
            }
        }
    }

    async fn lock(&self, key: &str) -> Result<Box<dyn HeldLock>, EnsembleError> {
        let cell = self.lock_cell(key);
        let guard = cell.lock_owned().await;
        Ok(Box::new(MemoryLock {
            key: key.to_string(),
            _guard: guard,
        }))
    }

    async fn catalog_nodes(&self) -> Result<Vec<CatalogNode>, EnsembleError> {
        let mut nodes: Vec<CatalogNode> = self
            .catalog
            .iter()
            .map(|entry| CatalogNode {
                name: entry.key().clone(),
                address: entry.value().clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(nodes)
    }
}
