//! Package revision, task, upstream and resource types for rpkg.
//!
//! This crate defines the schema layer: the `PackageRevision` record and its
//! lifecycle states, the `Task` sum type with its wire validation,
//! `UpstreamPackage`/`UpstreamLock` references, KRM resource parsing
//! (`Resource`, `ResourceId`), the `PackageTree` file tree with its canonical
//! digest, and the `Kptfile` scaffold written by `init`.

pub mod kptfile;
pub mod resource;
pub mod revision;
pub mod task;
pub mod tree;
pub mod types;
pub mod upstream;

pub use kptfile::{readme, Kptfile, KptfileInfo, KptfileMetadata, KPTFILE, LOCAL_CONFIG_ANNOTATION};
pub use resource::{
    is_manifest_path, parse_manifests, render_manifests, Resource, ResourceError, ResourceId,
};
pub use revision::{
    revision_name, validate_identity, FunctionCall, Lifecycle, PackageRevision,
    PackageRevisionSpec, PackageRevisionStatus, ParentReference, RevisionKey, SupersededTask,
    TaskRecord,
};
pub use task::{
    FunctionEvalTaskSpec, FunctionRef, MergeStrategy, PackageCloneTaskSpec, PackageEditTaskSpec,
    PackageInitTaskSpec, PackagePatchTaskSpec, PackageUpdateTaskSpec, PatchSpec, PatchType,
    Selector, Task, TaskType,
};
pub use tree::{PackageTree, TreeManifest};
pub use types::{ObjectHash, RevisionName, TreeDigest};
pub use upstream::{
    image_repository, normalize_dir, parse_clone_source, GitLock, GitPackage, OciLock, OciPackage, OriginType,
    PackageRevisionRef, RevisionLock, SecretRef, UpstreamLock, UpstreamPackage,
};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{union} must have exactly one populated variant, found {populated}")]
    VariantCount { union: &'static str, populated: usize },
    #[error("{union} type '{kind}' does not match the populated variant")]
    TypeMismatch { union: &'static str, kind: String },
    #[error("unknown {union} type '{kind}'")]
    UnknownType { union: &'static str, kind: String },
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("'{first}' and '{second}' are mutually exclusive")]
    MutuallyExclusive {
        first: &'static str,
        second: &'static str,
    },
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: &'static str },
    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("{0}")]
    Invalid(String),
}

/// Check that `path` is a clean, relative, forward-slash path inside a package.
pub fn validate_path(path: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidPath {
        path: path.to_owned(),
        reason,
    };
    if path.is_empty() {
        return Err(invalid("path is empty"));
    }
    if path.starts_with('/') {
        return Err(invalid("path must be relative"));
    }
    if path.contains(['\\', '\0', '\n']) {
        return Err(invalid("path contains a forbidden character"));
    }
    for component in path.split('/') {
        match component {
            "" => return Err(invalid("path has an empty component")),
            "." | ".." => return Err(invalid("path must not contain '.' or '..'")),
            _ => {}
        }
    }
    Ok(())
}

/// Normalize a subpackage directory: `""`, `"."` and `"/"` mean the package root.
pub fn normalize_subpackage(subpackage: &str) -> Result<String, ValidationError> {
    let trimmed = subpackage.trim_matches('/');
    if trimmed.is_empty() || trimmed == "." {
        return Ok(String::new());
    }
    validate_path(trimmed)?;
    Ok(trimmed.to_owned())
}

/// Join a subpackage directory and a file name.
pub fn join_path(dir: &str, file: &str) -> String {
    if dir.is_empty() {
        file.to_owned()
    } else {
        format!("{dir}/{file}")
    }
}
