//! In-memory package file trees and their canonical digest.
//!
//! A tree digest is the blake3 hash of the tree's canonical manifest: one
//! `path\0<blake3 of contents>\n` line per file, sorted by path. Two trees
//! have the same digest iff they are byte-identical.

use crate::types::{ObjectHash, TreeDigest};
use crate::{validate_path, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageTree {
    files: BTreeMap<String, String>,
}

impl PackageTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_files<I, P, C>(files: I) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = (P, C)>,
        P: Into<String>,
        C: Into<String>,
    {
        let mut tree = Self::new();
        for (path, contents) in files {
            tree.insert(path, contents)?;
        }
        Ok(tree)
    }

    /// Insert or replace a file, returning the previous contents.
    pub fn insert(
        &mut self,
        path: impl Into<String>,
        contents: impl Into<String>,
    ) -> Result<Option<String>, ValidationError> {
        let path = path.into();
        validate_path(&path)?;
        Ok(self.files.insert(path, contents.into()))
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.files.remove(path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    /// Files under `dir`, with the `dir/` prefix stripped. `""` is the whole tree.
    pub fn subtree(&self, dir: &str) -> PackageTree {
        if dir.is_empty() {
            return self.clone();
        }
        let prefix = format!("{dir}/");
        let files = self
            .files
            .iter()
            .filter_map(|(path, contents)| {
                path.strip_prefix(&prefix)
                    .map(|rest| (rest.to_owned(), contents.clone()))
            })
            .collect();
        PackageTree { files }
    }

    /// Whether `path` lies inside the subpackage directory `dir`.
    pub fn in_scope(path: &str, dir: &str) -> bool {
        dir.is_empty()
            || path
                .strip_prefix(dir)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    pub fn manifest(&self) -> TreeManifest {
        TreeManifest {
            entries: self
                .files
                .iter()
                .map(|(path, contents)| {
                    (
                        path.clone(),
                        ObjectHash::new(blake3::hash(contents.as_bytes()).to_hex().to_string()),
                    )
                })
                .collect(),
        }
    }

    pub fn digest(&self) -> TreeDigest {
        self.manifest().digest()
    }
}

/// Path → content hash listing of a tree; the unit stored for each tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeManifest {
    pub entries: BTreeMap<String, ObjectHash>,
}

impl TreeManifest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (path, hash) in &self.entries {
            out.extend_from_slice(path.as_bytes());
            out.push(0);
            out.extend_from_slice(hash.as_bytes());
            out.push(b'\n');
        }
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, ValidationError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| ValidationError::Invalid("tree manifest is not UTF-8".to_owned()))?;
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let (path, hash) = line.split_once('\0').ok_or_else(|| {
                ValidationError::Invalid(format!("malformed tree manifest line: {line:?}"))
            })?;
            validate_path(path)?;
            entries.insert(path.to_owned(), ObjectHash::new(hash));
        }
        Ok(Self { entries })
    }

    pub fn digest(&self) -> TreeDigest {
        TreeDigest::new(blake3::hash(&self.to_bytes()).to_hex().to_string())
    }
}
