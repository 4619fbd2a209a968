//! Reconciliation of local edits with new upstream content.
//!
//! `resource-merge` is a three-way merge of (original upstream, new upstream,
//! local). Manifest files are merged per resource, keyed on
//! `(apiVersion, kind, namespace, name)`, and within a resource per field.
//! Every other file is merged whole. When both sides changed the same field
//! the local value is kept and a note is recorded; an upstream deletion of
//! something that was modified locally is a conflict.

use crate::CoreError;
use rpkg_schema::{
    is_manifest_path, parse_manifests, render_manifests, MergeStrategy, PackageTree, Resource,
    ResourceId, ValidationError,
};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeConflict {
    /// Upstream deleted a resource that was modified locally.
    ResourceDeleted { id: ResourceId, path: String },
    /// Upstream deleted a file that was modified locally.
    FileDeleted { path: String },
    /// Upstream and local changed the same file differently.
    FileDiverged { path: String },
}

impl fmt::Display for MergeConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeConflict::ResourceDeleted { id, path } => {
                write!(f, "{id} in {path} was deleted upstream but modified locally")
            }
            MergeConflict::FileDeleted { path } => {
                write!(f, "{path} was deleted upstream but modified locally")
            }
            MergeConflict::FileDiverged { path } => {
                write!(f, "{path} was changed both upstream and locally")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub tree: PackageTree,
    /// Places where a local change was kept over a competing upstream change.
    pub notes: Vec<String>,
}

impl MergeOutcome {
    fn replaced(tree: &PackageTree) -> Self {
        Self {
            tree: tree.clone(),
            notes: Vec::new(),
        }
    }
}

/// Merge `upstream` into `local`, both descended from `original`.
///
/// On conflict nothing is produced; the error lists every conflict found.
pub fn merge_trees(
    strategy: MergeStrategy,
    original: &PackageTree,
    upstream: &PackageTree,
    local: &PackageTree,
) -> Result<MergeOutcome, CoreError> {
    match strategy {
        MergeStrategy::ForceDeleteReplace => Ok(MergeOutcome::replaced(upstream)),
        MergeStrategy::FastForward => {
            if local != original {
                let changed = changed_paths(original, local);
                return Err(CoreError::Conflict(format!(
                    "fast-forward update refused: local revision has changes in {}",
                    changed.join(", ")
                )));
            }
            Ok(MergeOutcome::replaced(upstream))
        }
        MergeStrategy::ResourceMerge => resource_merge(original, upstream, local),
    }
}

fn changed_paths(a: &PackageTree, b: &PackageTree) -> Vec<String> {
    let paths: BTreeSet<&str> = a.paths().chain(b.paths()).collect();
    paths
        .into_iter()
        .filter(|path| a.get(path) != b.get(path))
        .map(str::to_owned)
        .collect()
}

/// Parsed manifest files of one tree.
#[derive(Default)]
struct Indexed {
    files: BTreeMap<String, Vec<Resource>>,
    by_id: BTreeMap<ResourceId, Value>,
}

impl Indexed {
    fn build(tree: &PackageTree, resource_paths: &BTreeSet<String>) -> Result<Self, CoreError> {
        let mut indexed = Indexed::default();
        for path in resource_paths {
            let Some(contents) = tree.get(path) else {
                continue;
            };
            let resources = parse_manifests(path, contents)?;
            for resource in &resources {
                let id = resource.id();
                if indexed.by_id.insert(id.clone(), resource.value.clone()).is_some() {
                    return Err(ValidationError::Invalid(format!(
                        "duplicate resource {id} (second copy in {path})"
                    ))
                    .into());
                }
            }
            indexed.files.insert(path.clone(), resources);
        }
        Ok(indexed)
    }
}

/// Manifest paths that parse into at least one resource in every tree holding them.
fn resource_paths(trees: [&PackageTree; 3]) -> BTreeSet<String> {
    let candidates: BTreeSet<&str> = trees
        .iter()
        .flat_map(|tree| tree.paths())
        .filter(|path| is_manifest_path(path))
        .collect();
    candidates
        .into_iter()
        .filter(|path| {
            trees.iter().all(|tree| match tree.get(path) {
                None => true,
                Some(contents) => parse_manifests(path, contents).is_ok_and(|r| !r.is_empty()),
            })
        })
        .map(str::to_owned)
        .collect()
}

fn resource_merge(
    original: &PackageTree,
    upstream: &PackageTree,
    local: &PackageTree,
) -> Result<MergeOutcome, CoreError> {
    let resource_paths = resource_paths([original, upstream, local]);
    let mut conflicts = Vec::new();
    let mut notes = Vec::new();
    let mut tree = PackageTree::new();

    // Whole-file merge for everything that is not a resource file.
    let all_paths: BTreeSet<&str> = original
        .paths()
        .chain(upstream.paths())
        .chain(local.paths())
        .filter(|path| !resource_paths.contains(*path))
        .collect();
    for path in all_paths {
        let (o, u, l) = (original.get(path), upstream.get(path), local.get(path));
        let merged = if u == o || l == u {
            l
        } else if l == o {
            u
        } else {
            match (u, l) {
                (None, Some(_)) => {
                    conflicts.push(MergeConflict::FileDeleted {
                        path: path.to_owned(),
                    });
                    continue;
                }
                (Some(_), None) => {
                    notes.push(format!("{path}: kept local deletion over upstream change"));
                    None
                }
                _ => {
                    conflicts.push(MergeConflict::FileDiverged {
                        path: path.to_owned(),
                    });
                    continue;
                }
            }
        };
        if let Some(contents) = merged {
            tree.insert(path, contents)?;
        }
    }

    let o = Indexed::build(original, &resource_paths)?;
    let u = Indexed::build(upstream, &resource_paths)?;
    let l = Indexed::build(local, &resource_paths)?;

    let ids: BTreeSet<&ResourceId> = o.by_id.keys().chain(u.by_id.keys()).chain(l.by_id.keys()).collect();
    let mut merged: BTreeMap<ResourceId, Value> = BTreeMap::new();
    for id in ids {
        let (ov, uv, lv) = (o.by_id.get(id), u.by_id.get(id), l.by_id.get(id));
        if uv.is_none() && ov.is_some() && lv.is_some() && lv != ov {
            let path = locate(&l, id).unwrap_or_default();
            conflicts.push(MergeConflict::ResourceDeleted {
                id: id.clone(),
                path,
            });
            continue;
        }
        let label = id.to_string();
        if let Some(value) = merge_field(ov, uv, lv, &label, &mut notes) {
            merged.insert(id.clone(), value);
        }
    }

    if !conflicts.is_empty() {
        return Err(CoreError::MergeConflict(conflicts));
    }

    // Local files keep their resources in local order; upstream additions go
    // to the file upstream keeps them in.
    let mut placed: BTreeSet<ResourceId> = BTreeSet::new();
    let mut output: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (path, resources) in &l.files {
        let docs = output.entry(path.clone()).or_default();
        for resource in resources {
            let id = resource.id();
            if let Some(value) = merged.get(&id) {
                docs.push(value.clone());
                placed.insert(id);
            }
        }
    }
    for (path, resources) in &u.files {
        for resource in resources {
            let id = resource.id();
            if placed.contains(&id) {
                continue;
            }
            if let Some(value) = merged.get(&id) {
                output.entry(path.clone()).or_default().push(value.clone());
                placed.insert(id);
            }
        }
    }

    for (path, docs) in output {
        if docs.is_empty() {
            continue;
        }
        let contents = if same_documents(l.files.get(&path), &docs) {
            local.get(&path).map(str::to_owned)
        } else if same_documents(u.files.get(&path), &docs) {
            upstream.get(&path).map(str::to_owned)
        } else {
            None
        };
        let contents = match contents {
            Some(text) => text,
            None => render_manifests(&docs)?,
        };
        tree.insert(path, contents)?;
    }

    debug!(
        "resource-merge: {} files, {} notes",
        tree.len(),
        notes.len()
    );
    Ok(MergeOutcome { tree, notes })
}

fn locate(indexed: &Indexed, id: &ResourceId) -> Option<String> {
    indexed.files.iter().find_map(|(path, resources)| {
        resources
            .iter()
            .any(|r| &r.id() == id)
            .then(|| path.clone())
    })
}

fn same_documents(resources: Option<&Vec<Resource>>, docs: &[Value]) -> bool {
    resources.is_some_and(|resources| {
        resources.len() == docs.len() && resources.iter().zip(docs).all(|(r, d)| &r.value == d)
    })
}

/// Three-way merge of one optional value. `None` means absent.
fn merge_field(
    original: Option<&Value>,
    upstream: Option<&Value>,
    local: Option<&Value>,
    label: &str,
    notes: &mut Vec<String>,
) -> Option<Value> {
    if upstream == original || upstream == local {
        return local.cloned();
    }
    if local == original {
        return upstream.cloned();
    }
    match (upstream, local) {
        (Some(u), Some(l)) => Some(merge_value(original, u, l, label, notes)),
        (None, Some(l)) => {
            notes.push(format!("{label}: kept local value, removed upstream"));
            Some(l.clone())
        }
        (Some(_), None) => {
            notes.push(format!("{label}: kept local removal over upstream change"));
            None
        }
        (None, None) => None,
    }
}

/// Both sides changed a present value. Mappings merge key by key; anything
/// else keeps the local value.
fn merge_value(
    original: Option<&Value>,
    upstream: &Value,
    local: &Value,
    label: &str,
    notes: &mut Vec<String>,
) -> Value {
    let (Value::Mapping(u), Value::Mapping(l)) = (upstream, local) else {
        notes.push(format!("{label}: kept local value over upstream change"));
        return local.clone();
    };
    let empty = Mapping::new();
    let o = original.and_then(Value::as_mapping).unwrap_or(&empty);

    let mut keys: Vec<&Value> = l.keys().collect();
    for key in u.keys().chain(o.keys()) {
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut out = Mapping::new();
    for key in keys {
        let child_label = match key.as_str() {
            Some(k) => format!("{label}.{k}"),
            None => format!("{label}.?"),
        };
        if let Some(value) = merge_field(o.get(key), u.get(key), l.get(key), &child_label, notes) {
            out.insert(key.clone(), value);
        }
    }
    Value::Mapping(out)
}
