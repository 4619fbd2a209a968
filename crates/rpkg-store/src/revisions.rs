use crate::layout::StoreLayout;
use crate::{atomic_write, StoreError};
use rpkg_schema::PackageRevision;
use std::fs;

/// Checksum over the record content, excluding the checksum field itself.
fn compute_checksum(rev: &PackageRevision) -> Result<String, StoreError> {
    let mut copy = rev.clone();
    copy.checksum = None;
    let json = serde_json::to_string_pretty(&copy)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

/// Package revision records, one JSON file per revision name.
///
/// `put` is the single commit point of every engine operation: the record is
/// sealed with a blake3 checksum and replaced atomically, so readers see
/// either the previous record or the new one.
#[derive(Debug, Clone)]
pub struct RevisionStore {
    layout: StoreLayout,
}

impl RevisionStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn put(&self, rev: &PackageRevision) -> Result<(), StoreError> {
        let dir = self.layout.revisions_dir();
        let dest = dir.join(rev.name.as_str());

        let mut sealed = rev.clone();
        sealed.checksum = Some(compute_checksum(rev)?);
        let content = serde_json::to_string_pretty(&sealed)?;

        atomic_write(&dir, &dest, content.as_bytes())
    }

    pub fn get(&self, name: &str) -> Result<PackageRevision, StoreError> {
        let path = self.layout.revisions_dir().join(name);
        if name.is_empty() || name.contains('/') || !path.is_file() {
            return Err(StoreError::RevisionNotFound(name.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let rev: PackageRevision = serde_json::from_str(&content)?;

        if let Some(ref expected) = rev.checksum {
            let actual = compute_checksum(&rev)?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    hash: name.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(rev)
    }

    pub fn exists(&self, name: &str) -> bool {
        !name.is_empty() && self.layout.revisions_dir().join(name).is_file()
    }

    pub fn remove(&self, name: &str) -> Result<(), StoreError> {
        let path = self.layout.revisions_dir().join(name);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    /// All readable records, sorted by name. Corrupt records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<PackageRevision>, StoreError> {
        let dir = self.layout.revisions_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name();
                let name_str = name.to_str().unwrap_or("");
                if name_str.is_empty() || name_str.starts_with('.') {
                    continue;
                }
                match self.get(name_str) {
                    Ok(rev) => results.push(rev),
                    Err(e) => {
                        tracing::warn!("skipping corrupted revision record '{name_str}': {e}");
                    }
                }
            }
        }
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(results)
    }
}
