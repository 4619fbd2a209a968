//! The persisted package revision record.

use crate::task::{Selector, Task, TaskType};
use crate::types::{RevisionName, TreeDigest};
use crate::upstream::UpstreamLock;
use crate::ValidationError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Draft,
    Proposed,
    Published,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lifecycle::Draft => write!(f, "Draft"),
            Lifecycle::Proposed => write!(f, "Proposed"),
            Lifecycle::Published => write!(f, "Published"),
        }
    }
}

/// `(repository, package, revision)`: the globally unique identity of a revision.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionKey {
    pub repository: String,
    pub package: String,
    pub revision: String,
}

impl RevisionKey {
    pub fn new(
        repository: impl Into<String>,
        package: impl Into<String>,
        revision: impl Into<String>,
    ) -> Self {
        Self {
            repository: repository.into(),
            package: package.into(),
            revision: revision.into(),
        }
    }

    pub fn name(&self) -> RevisionName {
        revision_name(&self.repository, &self.package, &self.revision)
    }
}

impl fmt::Display for RevisionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.repository, self.package, self.revision)
    }
}

/// Derive the store-wide revision name: `<repository>-<40 hex chars>`.
pub fn revision_name(repository: &str, package: &str, revision: &str) -> RevisionName {
    let mut hasher = blake3::Hasher::new();
    hasher.update(repository.as_bytes());
    hasher.update(b"/");
    hasher.update(package.as_bytes());
    hasher.update(b"/");
    hasher.update(revision.as_bytes());
    let hex = hasher.finalize().to_hex();
    RevisionName::new(format!("{repository}-{}", &hex[..40]))
}

fn validate_segment(name: &str, what: &'static str) -> Result<(), ValidationError> {
    if name.is_empty() || name.len() > 63 {
        return Err(ValidationError::InvalidName {
            name: name.to_owned(),
            reason: what,
        });
    }
    let valid = name
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && name.bytes().next().is_some_and(|b| b.is_ascii_alphanumeric());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            name: name.to_owned(),
            reason: what,
        })
    }
}

/// Validate the identity triple. Package names may be nested (`a/b`).
pub fn validate_identity(key: &RevisionKey) -> Result<(), ValidationError> {
    validate_segment(
        &key.repository,
        "repository must be 1-63 characters of [a-zA-Z0-9_.-]",
    )?;
    for segment in key.package.split('/') {
        validate_segment(
            segment,
            "package path segments must be 1-63 characters of [a-zA-Z0-9_.-]",
        )?;
    }
    validate_segment(
        &key.revision,
        "revision must be 1-63 characters of [a-zA-Z0-9_.-]",
    )
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentReference {
    pub name: RevisionName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionSpec {
    pub package_name: String,
    pub revision: String,
    pub repository: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentReference>,
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevisionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_lock: Option<UpstreamLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_by: Option<String>,
    #[serde(
        default,
        rename = "publishTimestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub published_at: Option<String>,
    #[serde(default)]
    pub deployment: bool,
}

/// The function invocation an eval task resolved to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    pub function: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub selector: Selector,
    #[serde(default)]
    pub subpackage: String,
    #[serde(default)]
    pub include_meta_resources: bool,
    #[serde(default)]
    pub enable_network: bool,
    /// Number of resources handed to the function; zero means it was not invoked.
    pub selected: usize,
}

/// Replay record for one task: what it pinned and what it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<UpstreamLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionCall>,
    pub tree_digest: TreeDigest,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// A task that was replaced by an amendment of the last task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SupersededTask {
    pub task: Task,
    pub superseded_at: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageRevision {
    pub name: RevisionName,
    pub spec: PackageRevisionSpec,
    #[serde(default)]
    pub status: PackageRevisionStatus,
    /// Optimistic concurrency token, bumped on every committed change.
    pub resource_version: u64,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    pub tree_digest: TreeDigest,
    /// One record per entry in `spec.tasks`, same order.
    #[serde(default)]
    pub task_records: Vec<TaskRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub superseded: Vec<SupersededTask>,
    /// blake3 checksum for integrity verification. `None` for unsealed records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl PackageRevision {
    pub fn key(&self) -> RevisionKey {
        RevisionKey::new(
            self.spec.repository.clone(),
            self.spec.package_name.clone(),
            self.spec.revision.clone(),
        )
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.spec.lifecycle
    }

    pub fn tasks(&self) -> &[Task] {
        &self.spec.tasks
    }

    pub fn last_task(&self) -> Option<&Task> {
        self.spec.tasks.last()
    }

    pub fn upstream_lock(&self) -> Option<&UpstreamLock> {
        self.status.upstream_lock.as_ref()
    }
}
