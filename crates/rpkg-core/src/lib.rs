//! Core orchestration engine for rpkg package revisions.
//!
//! This crate ties together the schema, store, upstream resolution and
//! function runtime into the `Engine`: the central API for creating package
//! revisions (init, clone, copy), mutating Drafts through appended tasks
//! (push, eval, update), moving them through the Draft → Proposed → Published
//! lifecycle, and re-deriving their content by locked replay. It also hosts
//! the merge engine, function targeting, per-revision locking and engine
//! configuration.

pub mod concurrency;
pub mod config;
pub mod engine;
pub mod lifecycle;
pub mod merge;
pub mod patch;
pub mod replay;
pub mod resolver;
pub mod targeting;

pub use concurrency::{install_signal_handler, shutdown_requested, CancelToken, StoreLock};
pub use config::{EmptySelection, EngineConfig, EvalConfig, RetryConfig, TimeoutConfig};
pub use engine::{Engine, ReplayReport, RevisionFilter};
pub use lifecycle::validate_transition;
pub use merge::{merge_trees, MergeConflict, MergeOutcome};
pub use patch::{apply_patches, diff_trees};
pub use replay::{Replayer, TaskLog};
pub use resolver::Resolver;
pub use targeting::{matches, select_resources, Selection};

use rpkg_schema::{Lifecycle, ResourceError, ValidationError};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid resource: {0}")]
    Resource(#[from] ResourceError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("invalid lifecycle transition for {name}: {from} -> {to}")]
    InvalidTransition {
        name: String,
        from: Lifecycle,
        to: Lifecycle,
    },
    #[error("revision {name} is {lifecycle}; content can only change while Draft")]
    NotDraft { name: String, lifecycle: Lifecycle },
    #[error("stale resource version for {name}: presented {presented}, current {current}")]
    StaleVersion {
        name: String,
        presented: u64,
        current: u64,
    },
    #[error("package revision already exists: {0}")]
    AlreadyExists(String),
    #[error("{0}")]
    Conflict(String),
    #[error("update blocked by {} merge conflict(s): {}", .0.len(), format_conflicts(.0))]
    MergeConflict(Vec<MergeConflict>),
    #[error("patch of '{file}' failed: {reason}")]
    Patch { file: String, reason: String },
    #[error("replay drift in {name} at task {position} ({task}): recorded {recorded}, derived {derived}")]
    Drift {
        name: String,
        position: usize,
        task: String,
        recorded: String,
        derived: String,
    },
    #[error("{0}")]
    Upstream(#[from] rpkg_remote::UpstreamError),
    #[error("{0}")]
    Execution(#[from] rpkg_runtime::ExecutionError),
    #[error("package revision not found: {0}")]
    NotFound(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("store error: {0}")]
    Store(#[from] rpkg_store::StoreError),
    #[error("lock error: {0}")]
    Lock(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_conflicts(conflicts: &[MergeConflict]) -> String {
    conflicts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Coarse classification of a [`CoreError`], stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Upstream,
    Execution,
    NotFound,
    Cancelled,
    Store,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Execution => "execution",
            ErrorKind::NotFound => "not-found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Store => "store",
        };
        f.write_str(s)
    }
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) | CoreError::Resource(_) | CoreError::Config(_) => {
                ErrorKind::Validation
            }
            CoreError::InvalidTransition { .. }
            | CoreError::NotDraft { .. }
            | CoreError::StaleVersion { .. }
            | CoreError::AlreadyExists(_)
            | CoreError::Conflict(_)
            | CoreError::MergeConflict(_)
            | CoreError::Patch { .. }
            | CoreError::Drift { .. } => ErrorKind::Conflict,
            CoreError::Upstream(_) => ErrorKind::Upstream,
            CoreError::Execution(_) => ErrorKind::Execution,
            CoreError::NotFound(_) | CoreError::Store(rpkg_store::StoreError::RevisionNotFound(_)) => {
                ErrorKind::NotFound
            }
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::Store(_)
            | CoreError::Lock(_)
            | CoreError::Io(_) => ErrorKind::Store,
        }
    }

    /// Only transient upstream failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Upstream(e) if e.is_retryable())
    }
}
