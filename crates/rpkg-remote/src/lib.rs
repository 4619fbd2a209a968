//! Upstream package resolution for rpkg.
//!
//! This crate defines the contract every upstream source must satisfy
//! (`UpstreamFetcher`: reference → pinned tree + lock, or a typed
//! `UpstreamError`), a git fetcher driving the `git` CLI, an in-memory
//! fetcher for tests and embedding, credential configuration, and the retry
//! and timeout helpers applied around network-bound fetches.

pub mod config;
pub mod git;
pub mod memory;
pub mod retry;

pub use config::{Credentials, GitCredential};
pub use git::{classify_git_error, GitCliFetcher};
pub use memory::MemoryFetcher;
pub use retry::{call_with_timeout, retry, RetryFailure, RetryPolicy};

use rpkg_schema::{PackageTree, UpstreamLock, UpstreamPackage};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UpstreamError {
    #[error("upstream not found: {0}")]
    NotFound(String),
    #[error("upstream authentication failed: {0}")]
    AuthFailed(String),
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    #[error("invalid upstream reference: {0}")]
    InvalidReference(String),
}

impl UpstreamError {
    /// Only transient failures are retried; everything else fails fast.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UpstreamError::Unreachable(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            UpstreamError::NotFound(_) => "NotFound",
            UpstreamError::AuthFailed(_) => "AuthFailed",
            UpstreamError::Unreachable(_) => "Unreachable",
            UpstreamError::InvalidReference(_) => "InvalidReference",
        }
    }
}

/// Content fetched for an upstream reference, pinned by its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fetched {
    pub tree: PackageTree,
    pub lock: UpstreamLock,
}

/// Trait for upstream sources (git repositories, OCI registries).
///
/// Implementations must be idempotent for pinned content: fetching the same
/// lock twice yields byte-identical trees.
pub trait UpstreamFetcher: Send + Sync {
    /// Resolve a possibly-moving reference (branch, tag) to pinned content.
    fn fetch(&self, upstream: &UpstreamPackage) -> Result<Fetched, UpstreamError>;

    /// Re-fetch exactly the content a previous fetch pinned.
    fn fetch_locked(&self, lock: &UpstreamLock) -> Result<PackageTree, UpstreamError>;
}
