use crate::layout::StoreLayout;
use crate::{atomic_write, StoreError};
use rpkg_schema::{TreeDigest, UpstreamLock};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub lock: UpstreamLock,
    pub tree_digest: TreeDigest,
    pub fetched_at: String,
}

/// Maps pinned upstream locks to the tree that was fetched for them.
///
/// Keyed by [`UpstreamLock::cache_key`], so repeated fetches of the same
/// commit or digest resolve to the same stored tree.
#[derive(Debug, Clone)]
pub struct UpstreamCache {
    layout: StoreLayout,
}

impl UpstreamCache {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn get(&self, lock: &UpstreamLock) -> Result<Option<CacheEntry>, StoreError> {
        let path = self.layout.upstream_dir().join(lock.cache_key());
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        let entry: CacheEntry = serde_json::from_str(&content)?;
        if entry.lock.cache_key() != lock.cache_key() {
            return Err(StoreError::Corrupt {
                entry: lock.cache_key(),
                reason: format!("cache entry holds {}", entry.lock.describe()),
            });
        }
        Ok(Some(entry))
    }

    pub fn put(&self, lock: &UpstreamLock, tree_digest: &TreeDigest) -> Result<(), StoreError> {
        let entry = CacheEntry {
            lock: lock.clone(),
            tree_digest: tree_digest.clone(),
            fetched_at: chrono::Utc::now().to_rfc3339(),
        };
        let dir = self.layout.upstream_dir();
        let content = serde_json::to_string_pretty(&entry)?;
        atomic_write(&dir, &dir.join(lock.cache_key()), content.as_bytes())
    }

    pub fn remove(&self, lock: &UpstreamLock) -> Result<(), StoreError> {
        let path = self.layout.upstream_dir().join(lock.cache_key());
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<CacheEntry>, StoreError> {
        let dir = self.layout.upstream_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().is_some_and(|n| n.starts_with('.')) {
                continue;
            }
            let content = fs::read_to_string(entry.path())?;
            match serde_json::from_str::<CacheEntry>(&content) {
                Ok(cached) => entries.push(cached),
                Err(e) => tracing::warn!("skipping corrupted upstream cache entry {name:?}: {e}"),
            }
        }
        entries.sort_by(|a, b| a.tree_digest.cmp(&b.tree_digest));
        Ok(entries)
    }
}
