//! Resolution of upstream references to pinned, stored content.

use crate::concurrency::CancelToken;
use crate::CoreError;
use rpkg_remote::{
    call_with_timeout, retry, Fetched, RetryFailure, RetryPolicy, UpstreamError, UpstreamFetcher,
};
use rpkg_schema::{
    OriginType, PackageTree, RevisionLock, TreeDigest, UpstreamLock, UpstreamPackage,
};
use rpkg_store::{ObjectStore, RevisionStore, StoreError, StoreLayout, UpstreamCache};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Turns an `UpstreamPackage` into a stored tree plus the lock that pins it.
///
/// Git and OCI sources go through their fetcher under the configured timeout
/// and retry policy; internal references are read from the revision store.
/// Every fetched tree is written to the object store and indexed by its lock,
/// so re-fetching pinned content is served locally.
pub struct Resolver {
    git: Option<Arc<dyn UpstreamFetcher>>,
    oci: Option<Arc<dyn UpstreamFetcher>>,
    objects: ObjectStore,
    revisions: RevisionStore,
    cache: UpstreamCache,
    policy: RetryPolicy,
    timeout: Duration,
}

impl Resolver {
    pub fn new(layout: &StoreLayout) -> Self {
        Self {
            git: None,
            oci: None,
            objects: ObjectStore::new(layout.clone()),
            revisions: RevisionStore::new(layout.clone()),
            cache: UpstreamCache::new(layout.clone()),
            policy: RetryPolicy::default(),
            timeout: Duration::from_secs(120),
        }
    }

    #[must_use]
    pub fn with_git(mut self, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        self.git = Some(fetcher);
        self
    }

    #[must_use]
    pub fn with_oci(mut self, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        self.oci = Some(fetcher);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn fetcher(&self, origin: OriginType) -> Result<Arc<dyn UpstreamFetcher>, UpstreamError> {
        let fetcher = match origin {
            OriginType::Git => self.git.clone(),
            OriginType::Oci => self.oci.clone(),
            OriginType::Revision => None,
        };
        fetcher.ok_or_else(|| {
            UpstreamError::InvalidReference(format!("no {origin} client is configured"))
        })
    }

    /// Run a network call under the timeout, retrying `Unreachable` failures.
    fn remote<T, F>(&self, what: &str, cancel: &CancelToken, op: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: Fn() -> Result<T, UpstreamError> + Clone + Send + 'static,
    {
        let timeout = self.timeout;
        retry(&self.policy, what, || cancel.is_cancelled(), |attempt| {
            debug!("{what}: attempt {attempt}");
            call_with_timeout(timeout, what, op.clone())
        })
        .map_err(|failure| match failure {
            RetryFailure::Cancelled => CoreError::Cancelled,
            RetryFailure::Failed { error, attempts } => {
                if attempts > 1 {
                    warn!("{what}: giving up after {attempts} attempts: {error}");
                }
                CoreError::Upstream(error)
            }
        })
    }

    /// Resolve a possibly-moving reference and store what it points at.
    pub fn resolve(
        &self,
        upstream: &UpstreamPackage,
        cancel: &CancelToken,
    ) -> Result<Fetched, CoreError> {
        upstream.validate()?;
        cancel.check()?;
        let what = upstream.describe();
        info!("resolving {what}");

        if let UpstreamPackage::Revision(reference) = upstream {
            let source = self.revisions.get(&reference.name).map_err(|e| match e {
                StoreError::RevisionNotFound(name) => {
                    CoreError::Upstream(UpstreamError::NotFound(format!("package revision {name}")))
                }
                other => CoreError::Store(other),
            })?;
            let tree = self.objects.get_tree(&source.tree_digest)?;
            return Ok(Fetched {
                tree,
                lock: UpstreamLock::Revision(RevisionLock {
                    name: source.name,
                    digest: source.tree_digest,
                }),
            });
        }

        let fetcher = self.fetcher(upstream.origin_type())?;
        let request = upstream.clone();
        let fetched = self.remote(&format!("fetch {what}"), cancel, move || {
            fetcher.fetch(&request)
        })?;
        cancel.check()?;
        let digest = self.store(&fetched.lock, &fetched.tree)?;
        debug!("{what} resolved to {} (tree {digest})", fetched.lock.describe());
        Ok(fetched)
    }

    /// Fetch exactly the content `lock` pins, from the local index when possible.
    pub fn fetch_locked(
        &self,
        lock: &UpstreamLock,
        cancel: &CancelToken,
    ) -> Result<PackageTree, CoreError> {
        cancel.check()?;
        if let Some(entry) = self.cache.get(lock)? {
            match self.objects.get_tree(&entry.tree_digest) {
                Ok(tree) => return Ok(tree),
                Err(e) => warn!("cached tree for {} unreadable, refetching: {e}", lock.describe()),
            }
        }

        if let UpstreamLock::Revision(rev) = lock {
            return self.objects.get_tree(&rev.digest).map_err(|e| match e {
                StoreError::ObjectNotFound(_) => CoreError::Upstream(UpstreamError::NotFound(
                    format!("content of {} is no longer stored", lock.describe()),
                )),
                other => CoreError::Store(other),
            });
        }

        let fetcher = self.fetcher(lock.origin_type())?;
        let pinned = lock.clone();
        let what = format!("fetch {}", lock.describe());
        let tree = self.remote(&what, cancel, move || fetcher.fetch_locked(&pinned))?;
        cancel.check()?;
        self.store(lock, &tree)?;
        Ok(tree)
    }

    fn store(&self, lock: &UpstreamLock, tree: &PackageTree) -> Result<TreeDigest, CoreError> {
        let digest = self.objects.put_tree(tree)?;
        self.cache.put(lock, &digest)?;
        Ok(digest)
    }
}
