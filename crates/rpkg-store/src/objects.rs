use crate::layout::StoreLayout;
use crate::{atomic_write, StoreError};
use rpkg_schema::{ObjectHash, PackageTree, TreeDigest, TreeManifest};
use std::fs;
use std::path::PathBuf;

/// Content-addressable object store backed by blake3 hashing.
///
/// Objects live at `objects/<first two hex chars>/<hash>`. Writes are atomic
/// via `NamedTempFile`, and reads verify integrity by recomputing the hash.
/// Package trees are stored as a manifest object plus one object per file,
/// so identical files are shared across revisions.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    layout: StoreLayout,
}

impl ObjectStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        let fan = &hash[..2.min(hash.len())];
        self.layout.objects_dir().join(fan).join(hash)
    }

    /// Store data and return its blake3 hash. Idempotent: existing objects are skipped.
    pub fn put(&self, data: &[u8]) -> Result<ObjectHash, StoreError> {
        let hash = blake3::hash(data).to_hex().to_string();
        let dest = self.object_path(&hash);

        if dest.exists() {
            return Ok(ObjectHash::new(hash));
        }

        let dir = self.layout.objects_dir().join(&hash[..2]);
        fs::create_dir_all(&dir)?;
        atomic_write(&dir, &dest, data)?;

        Ok(ObjectHash::new(hash))
    }

    /// Retrieve data by hash, verifying integrity on read.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.object_path(hash);
        if !path.exists() {
            return Err(StoreError::ObjectNotFound(hash.to_owned()));
        }
        let data = fs::read(&path)?;

        let actual = blake3::hash(&data);
        let actual_hex = actual.to_hex();
        if actual_hex.as_str() != hash {
            return Err(StoreError::IntegrityFailure {
                hash: hash.to_owned(),
                expected: hash.to_owned(),
                actual: actual_hex.to_string(),
            });
        }

        Ok(data)
    }

    pub fn exists(&self, hash: &str) -> bool {
        self.object_path(hash).exists()
    }

    pub fn remove(&self, hash: &str) -> Result<(), StoreError> {
        let path = self.object_path(hash);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.layout.objects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut hashes = Vec::new();
        for fan in fs::read_dir(dir)? {
            let fan = fan?;
            if !fan.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(fan.path())? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    if !name.starts_with('.') {
                        hashes.push(name.to_owned());
                    }
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }

    /// Store every file of `tree` and its manifest. The returned digest is
    /// the manifest's object hash.
    pub fn put_tree(&self, tree: &PackageTree) -> Result<TreeDigest, StoreError> {
        for (_, contents) in tree.iter() {
            self.put(contents.as_bytes())?;
        }
        let manifest = tree.manifest();
        let hash = self.put(&manifest.to_bytes())?;
        Ok(TreeDigest::new(hash.into_inner()))
    }

    pub fn get_manifest(&self, digest: &TreeDigest) -> Result<TreeManifest, StoreError> {
        let bytes = self.get(digest)?;
        TreeManifest::parse(&bytes).map_err(|e| StoreError::Corrupt {
            entry: digest.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn get_tree(&self, digest: &TreeDigest) -> Result<PackageTree, StoreError> {
        let manifest = self.get_manifest(digest)?;
        let mut tree = PackageTree::new();
        for (path, hash) in &manifest.entries {
            let bytes = self.get(hash)?;
            let contents = String::from_utf8(bytes).map_err(|_| StoreError::Corrupt {
                entry: path.clone(),
                reason: "file contents are not UTF-8".to_owned(),
            })?;
            tree.insert(path.clone(), contents)
                .map_err(|e| StoreError::Corrupt {
                    entry: path.clone(),
                    reason: e.to_string(),
                })?;
        }
        Ok(tree)
    }
}
