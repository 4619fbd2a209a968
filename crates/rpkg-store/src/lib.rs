//! Content-addressable object store, revision records and upstream cache for rpkg.
//!
//! This crate provides the storage layer: an `ObjectStore` backed by blake3
//! hashing with atomic writes (file contents and tree manifests),
//! `RevisionStore` for checksummed package revision records, `UpstreamCache`
//! mapping pinned upstream locks to fetched trees, `StoreLayout` for directory
//! structure management, and `GarbageCollector` for orphan cleanup.

pub mod cache;
pub mod gc;
pub mod layout;
pub mod objects;
pub mod revisions;

pub use cache::{CacheEntry, UpstreamCache};
pub use gc::{GarbageCollector, GcReport};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use objects::ObjectStore;
pub use revisions::RevisionStore;

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee a rename survives a crash until the parent
/// directory itself has been synced.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `data` to `dest` via a synced temp file in `dir` and an atomic rename.
pub(crate) fn atomic_write(dir: &Path, dest: &Path, data: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for '{hash}': expected {expected}, got {actual}")]
    IntegrityFailure {
        hash: String,
        expected: String,
        actual: String,
    },
    #[error("object not found: {0}")]
    ObjectNotFound(String),
    #[error("package revision not found: {0}")]
    RevisionNotFound(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt store entry '{entry}': {reason}")]
    Corrupt { entry: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_revision_not_found() {
        let e = StoreError::RevisionNotFound("blueprint-abc".to_owned());
        assert!(e.to_string().contains("blueprint-abc"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 7,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('7'));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            hash: "h".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("f");
        atomic_write(dir.path(), &dest, b"one").unwrap();
        atomic_write(dir.path(), &dest, b"two").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"two");
    }
}
