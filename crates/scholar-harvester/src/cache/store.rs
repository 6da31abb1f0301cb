//! Cache backends.

use std::path::{Path, PathBuf};

use moka::future::Cache;

use super::{CacheEntry, CacheNamespace, Fingerprint};
use crate::error::{HarvestError, HarvestResult};
use crate::storage::write_atomic;

type Key = (CacheNamespace, Fingerprint);

/// Where cache entries live. One entry per `(namespace, fingerprint)`; the last
/// writer wins.
#[async_trait::async_trait]
pub trait CacheStore: Send + Sync {
    /// Current entry, if any.
    async fn load(&self, namespace: CacheNamespace, fingerprint: &Fingerprint) -> Option<CacheEntry>;

    /// Replace the entry for `entry.fingerprint`.
    async fn save(&self, namespace: CacheNamespace, entry: &CacheEntry) -> HarvestResult<()>;
}

/// Process-local store. No capacity bound.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    entries: Cache<Key, CacheEntry>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: Cache::builder().build() }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CacheStore for MemoryStore {
    async fn load(&self, namespace: CacheNamespace, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries.get(&(namespace, fingerprint.clone())).await
    }

    async fn save(&self, namespace: CacheNamespace, entry: &CacheEntry) -> HarvestResult<()> {
        self.entries.insert((namespace, entry.fingerprint.clone()), entry.clone()).await;
        Ok(())
    }
}

/// One JSON file per entry under `<dir>/<namespace>/<fingerprint>.json`, fronted
/// by an in-memory map.
///
/// Files are replaced atomically. A file that cannot be parsed is treated as a miss.
#[derive(Debug, Clone)]
pub struct DiskStore {
    dir: PathBuf,
    front: MemoryStore,
}

impl DiskStore {
    /// Store rooted at `dir`. Directories are created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), front: MemoryStore::new() }
    }

    /// Root directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, namespace: CacheNamespace, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(namespace.as_str()).join(format!("{fingerprint}.json"))
    }

    async fn read_file(path: &Path) -> HarvestResult<Option<CacheEntry>> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HarvestError::storage(path, e)),
        }
    }
}

#[async_trait::async_trait]
impl CacheStore for DiskStore {
    async fn load(&self, namespace: CacheNamespace, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        if let Some(entry) = self.front.load(namespace, fingerprint).await {
            return Some(entry);
        }

        let path = self.path_for(namespace, fingerprint);
        match Self::read_file(&path).await {
            Ok(Some(entry)) => {
                self.front.entries.insert((namespace, fingerprint.clone()), entry.clone()).await;
                Some(entry)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "unreadable cache entry, treating as miss");
                None
            }
        }
    }

    async fn save(&self, namespace: CacheNamespace, entry: &CacheEntry) -> HarvestResult<()> {
        let path = self.path_for(namespace, &entry.fingerprint);
        let bytes = serde_json::to_vec(entry)?;
        write_atomic(&path, &bytes).await?;
        self.front.save(namespace, entry).await
    }
}
