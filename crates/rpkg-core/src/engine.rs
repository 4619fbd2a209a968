use crate::concurrency::{CancelToken, StoreLock};
use crate::config::EngineConfig;
use crate::lifecycle::{require_draft, validate_transition};
use crate::patch::diff_trees;
use crate::replay::{Mode, ReplayContext, Replayer, TaskLog};
use crate::resolver::Resolver;
use crate::CoreError;
use rpkg_remote::{GitCliFetcher, UpstreamFetcher};
use rpkg_runtime::{BuiltinRunner, FunctionRunner};
use rpkg_schema::{
    validate_identity, Lifecycle, MergeStrategy, PackageCloneTaskSpec, PackageEditTaskSpec,
    PackageInitTaskSpec, PackageRevision, PackageRevisionRef, PackageRevisionSpec,
    PackageRevisionStatus, PackageTree, PackageUpdateTaskSpec, ParentReference, RevisionKey,
    RevisionName, Task, TreeDigest, UpstreamPackage, ValidationError,
};
use rpkg_store::{GarbageCollector, GcReport, ObjectStore, RevisionStore, StoreError, StoreLayout};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub const PROPOSED_BY_ANNOTATION: &str = "proposedBy";
pub const PROPOSED_AT_ANNOTATION: &str = "proposedAt";

/// Central orchestration engine for package revisions.
///
/// Every operation on a revision runs under that revision's exclusive lock
/// file; mutations additionally hold the store's GC lock shared. A mutation
/// presents the `resource_version` it last observed and is rejected if the
/// record has moved on. The revision record is written last, so an operation
/// that fails or is cancelled leaves the previous state in place.
pub struct Engine {
    layout: StoreLayout,
    objects: ObjectStore,
    revisions: RevisionStore,
    resolver: Resolver,
    runner: Arc<dyn FunctionRunner>,
    config: EngineConfig,
    cancel: CancelToken,
}

/// Outcome of a locked re-derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub name: RevisionName,
    pub tasks: usize,
    pub tree_digest: TreeDigest,
    pub files: usize,
}

/// `package` and `revision` match by substring, `repository` exactly.
#[derive(Debug, Clone, Default)]
pub struct RevisionFilter {
    pub package: Option<String>,
    pub revision: Option<String>,
    pub repository: Option<String>,
}

impl RevisionFilter {
    pub fn matches(&self, rev: &PackageRevision) -> bool {
        self.package
            .as_deref()
            .is_none_or(|p| rev.spec.package_name.contains(p))
            && self
                .revision
                .as_deref()
                .is_none_or(|r| rev.spec.revision.contains(r))
            && self
                .repository
                .as_deref()
                .is_none_or(|r| rev.spec.repository == r)
    }
}

struct WriteGuard {
    _gc: StoreLock,
    _revision: StoreLock,
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn check_version(rev: &PackageRevision, presented: u64) -> Result<(), CoreError> {
    if rev.resource_version == presented {
        Ok(())
    } else {
        Err(CoreError::StaleVersion {
            name: rev.name.to_string(),
            presented,
            current: rev.resource_version,
        })
    }
}

impl Engine {
    /// Create an engine rooted at `store_root` with the default configuration,
    /// the git CLI fetcher and the builtin function runner.
    pub fn new(store_root: impl Into<PathBuf>) -> Self {
        let layout = StoreLayout::new(store_root);
        let config = EngineConfig::default();
        let git = GitCliFetcher::new(layout.store_dir().join("scratch"))
            .with_timeout(config.timeouts.fetch());
        let resolver = Resolver::new(&layout)
            .with_git(Arc::new(git))
            .with_retry(config.retry.policy())
            .with_timeout(config.timeouts.fetch());
        Self {
            objects: ObjectStore::new(layout.clone()),
            revisions: RevisionStore::new(layout.clone()),
            resolver,
            runner: Arc::new(BuiltinRunner::new()),
            config,
            cancel: CancelToken::new(),
            layout,
        }
    }

    #[must_use]
    pub fn with_git(mut self, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        self.resolver = self.resolver.with_git(fetcher);
        self
    }

    #[must_use]
    pub fn with_oci(mut self, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        self.resolver = self.resolver.with_oci(fetcher);
        self
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn FunctionRunner>) -> Self {
        self.runner = runner;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.resolver = self
            .resolver
            .with_retry(config.retry.policy())
            .with_timeout(config.timeouts.fetch());
        self.config = config;
        self
    }

    /// Token checked between pipeline steps; cancelling it aborts in-flight
    /// operations before they commit.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store_layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn replayer(&self) -> Replayer<'_> {
        Replayer {
            resolver: &self.resolver,
            runner: self.runner.clone(),
            objects: &self.objects,
            revisions: &self.revisions,
            config: &self.config,
            cancel: &self.cancel,
        }
    }

    fn write_guard(&self, name: &str) -> Result<WriteGuard, CoreError> {
        self.layout.initialize()?;
        let gc = StoreLock::acquire_shared(&self.layout.gc_lock())?;
        let revision = StoreLock::acquire(&self.layout.revision_lock(name))?;
        Ok(WriteGuard {
            _gc: gc,
            _revision: revision,
        })
    }

    fn load(&self, name: &str) -> Result<PackageRevision, CoreError> {
        self.revisions.get(name).map_err(|e| match e {
            StoreError::RevisionNotFound(name) => CoreError::NotFound(name),
            other => CoreError::Store(other),
        })
    }

    /// Load a Draft for mutation, checking the presented version.
    fn load_draft(&self, name: &str, version: u64) -> Result<PackageRevision, CoreError> {
        let rev = self.load(name)?;
        check_version(&rev, version)?;
        require_draft(name, rev.lifecycle())?;
        Ok(rev)
    }

    fn commit(&self, rev: &mut PackageRevision) -> Result<(), CoreError> {
        self.cancel.check()?;
        rev.resource_version += 1;
        rev.updated_at = now();
        self.revisions.put(rev)?;
        debug!(
            "committed {} at version {} (tree {})",
            rev.name, rev.resource_version, rev.tree_digest
        );
        Ok(())
    }

    /// Apply `task` fresh on top of `rev`'s current content and append it.
    fn apply_and_append(&self, rev: &mut PackageRevision, task: Task) -> Result<(), CoreError> {
        let key = rev.key();
        let tree = self.objects.get_tree(&rev.tree_digest)?;
        let ctx = ReplayContext {
            key: &key,
            prior_tasks: rev.tasks(),
            prior_records: &rev.task_records,
        };
        let applied = self.replayer().apply(&ctx, &tree, &task, Mode::Fresh)?;
        self.objects.put_tree(&applied.tree)?;
        TaskLog::new(rev).append(task, applied.record);
        Ok(())
    }

    fn create(
        &self,
        key: &RevisionKey,
        task: Task,
        parent: Option<ParentReference>,
    ) -> Result<PackageRevision, CoreError> {
        validate_identity(key)?;
        task.validate()?;
        let name = key.name();
        let _guard = self.write_guard(&name)?;
        if self.revisions.exists(&name) {
            return Err(CoreError::AlreadyExists(name.to_string()));
        }

        let empty = self.objects.put_tree(&PackageTree::new())?;
        let created = now();
        let mut rev = PackageRevision {
            name: name.clone(),
            spec: PackageRevisionSpec {
                package_name: key.package.clone(),
                revision: key.revision.clone(),
                repository: key.repository.clone(),
                parent,
                lifecycle: Lifecycle::Draft,
                tasks: Vec::new(),
            },
            status: PackageRevisionStatus {
                deployment: self.config.is_deployment_repository(&key.repository),
                ..PackageRevisionStatus::default()
            },
            resource_version: 0,
            created_at: created.clone(),
            updated_at: created,
            annotations: BTreeMap::new(),
            tree_digest: empty,
            task_records: Vec::new(),
            superseded: Vec::new(),
            checksum: None,
        };
        self.apply_and_append(&mut rev, task)?;
        self.commit(&mut rev)?;
        info!("created {name} ({key})");
        Ok(rev)
    }

    /// Create a Draft scaffolded by an Init task.
    pub fn init(
        &self,
        key: &RevisionKey,
        spec: PackageInitTaskSpec,
    ) -> Result<PackageRevision, CoreError> {
        info!("init {key}");
        self.create(key, Task::Init(spec), None)
    }

    /// Create a Draft whose content is cloned from `upstream`.
    pub fn clone_package(
        &self,
        key: &RevisionKey,
        upstream: UpstreamPackage,
        strategy: MergeStrategy,
    ) -> Result<PackageRevision, CoreError> {
        info!("clone {} into {key}", upstream.describe());
        let parent = match &upstream {
            UpstreamPackage::Revision(reference) => Some(ParentReference {
                name: reference.name.clone(),
            }),
            _ => None,
        };
        self.create(
            key,
            Task::Clone(PackageCloneTaskSpec { upstream, strategy }),
            parent,
        )
    }

    /// Create a Draft holding a copy of an existing revision's content.
    pub fn copy(&self, source: &str, key: &RevisionKey) -> Result<PackageRevision, CoreError> {
        info!("copy {source} into {key}");
        let task = Task::Edit(PackageEditTaskSpec {
            source: PackageRevisionRef {
                name: RevisionName::new(source),
            },
        });
        self.create(key, task, None)
    }

    /// Replace a Draft's content with `tree`, recorded as a Patch task.
    ///
    /// A trailing Patch task is superseded rather than followed by another.
    pub fn push(
        &self,
        name: &str,
        tree: &PackageTree,
        version: u64,
    ) -> Result<PackageRevision, CoreError> {
        info!("push {name}");
        let _guard = self.write_guard(name)?;
        let mut rev = self.load_draft(name, version)?;
        let current = self.objects.get_tree(&rev.tree_digest)?;
        let Some(patch) = diff_trees(&current, tree) else {
            debug!("{name}: pushed content is unchanged");
            return Ok(rev);
        };

        if matches!(rev.last_task(), Some(Task::Patch(_))) {
            let base = match TaskLog::new(&mut rev).base_of_last() {
                Some(digest) => self.objects.get_tree(&digest)?,
                None => PackageTree::new(),
            };
            if let Some(rebased) = diff_trees(&base, tree) {
                self.supersede(&mut rev, &base, Task::Patch(rebased))?;
            } else {
                self.apply_and_append(&mut rev, Task::Patch(patch))?;
            }
        } else {
            self.apply_and_append(&mut rev, Task::Patch(patch))?;
        }

        if rev.tree_digest != tree.digest() {
            return Err(CoreError::Conflict(format!(
                "recorded patch for {name} does not reproduce the pushed content"
            )));
        }
        self.commit(&mut rev)?;
        Ok(rev)
    }

    /// Current content of a revision.
    pub fn pull(&self, name: &str) -> Result<PackageTree, CoreError> {
        let _lock = StoreLock::acquire(&self.layout.revision_lock(name))?;
        let rev = self.load(name)?;
        Ok(self.objects.get_tree(&rev.tree_digest)?)
    }

    pub fn propose(
        &self,
        name: &str,
        version: u64,
        actor: &str,
    ) -> Result<PackageRevision, CoreError> {
        info!("propose {name}");
        self.transition(name, version, Lifecycle::Proposed, |rev| {
            rev.annotations
                .insert(PROPOSED_BY_ANNOTATION.to_owned(), actor.to_owned());
            rev.annotations
                .insert(PROPOSED_AT_ANNOTATION.to_owned(), now());
        })
    }

    pub fn approve(
        &self,
        name: &str,
        version: u64,
        actor: &str,
    ) -> Result<PackageRevision, CoreError> {
        info!("approve {name}");
        self.transition(name, version, Lifecycle::Published, |rev| {
            rev.status.published_by = Some(actor.to_owned());
            rev.status.published_at = Some(now());
        })
    }

    pub fn reject(
        &self,
        name: &str,
        version: u64,
        actor: &str,
    ) -> Result<PackageRevision, CoreError> {
        info!("reject {name} by {actor}");
        self.transition(name, version, Lifecycle::Draft, |rev| {
            rev.annotations.remove(PROPOSED_BY_ANNOTATION);
            rev.annotations.remove(PROPOSED_AT_ANNOTATION);
        })
    }

    fn transition(
        &self,
        name: &str,
        version: u64,
        to: Lifecycle,
        stamp: impl FnOnce(&mut PackageRevision),
    ) -> Result<PackageRevision, CoreError> {
        let _guard = self.write_guard(name)?;
        let mut rev = self.load(name)?;
        check_version(&rev, version)?;
        validate_transition(name, rev.lifecycle(), to)?;
        rev.spec.lifecycle = to;
        stamp(&mut rev);
        self.commit(&mut rev)?;
        Ok(rev)
    }

    pub fn get(&self, name: &str) -> Result<PackageRevision, CoreError> {
        self.load(name)
    }

    pub fn list(&self, filter: &RevisionFilter) -> Result<Vec<PackageRevision>, CoreError> {
        Ok(self
            .revisions
            .list()?
            .into_iter()
            .filter(|rev| filter.matches(rev))
            .collect())
    }

    /// Remove a revision record. Its content stays in the object store until
    /// the next collection.
    pub fn delete(&self, name: &str, version: Option<u64>) -> Result<(), CoreError> {
        info!("delete {name}");
        let _guard = self.write_guard(name)?;
        let rev = self.load(name)?;
        if let Some(version) = version {
            check_version(&rev, version)?;
        }
        self.cancel.check()?;
        self.revisions.remove(name)?;
        Ok(())
    }

    /// Append a task to a Draft and apply it.
    pub fn append_task(
        &self,
        name: &str,
        task: Task,
        version: u64,
    ) -> Result<PackageRevision, CoreError> {
        info!("append {} task to {name}", task.task_type());
        task.validate()?;
        let _guard = self.write_guard(name)?;
        let mut rev = self.load_draft(name, version)?;
        self.apply_and_append(&mut rev, task)?;
        self.commit(&mut rev)?;
        Ok(rev)
    }

    /// Replace a Draft's last task with `task`, which must be of the same type.
    pub fn amend_last_task(
        &self,
        name: &str,
        task: Task,
        version: u64,
    ) -> Result<PackageRevision, CoreError> {
        info!("amend last task of {name}");
        task.validate()?;
        let _guard = self.write_guard(name)?;
        let mut rev = self.load_draft(name, version)?;
        match rev.last_task() {
            None => return Err(CoreError::Conflict(format!("{name} has no task to amend"))),
            Some(last) if last.task_type() != task.task_type() => {
                return Err(CoreError::Conflict(format!(
                    "last task of {name} is {}, cannot amend it with a {} task",
                    last.task_type(),
                    task.task_type()
                )));
            }
            Some(_) => {}
        }
        let base = match TaskLog::new(&mut rev).base_of_last() {
            Some(digest) => self.objects.get_tree(&digest)?,
            None => PackageTree::new(),
        };
        self.supersede(&mut rev, &base, task)?;
        self.commit(&mut rev)?;
        Ok(rev)
    }

    fn supersede(
        &self,
        rev: &mut PackageRevision,
        base: &PackageTree,
        task: Task,
    ) -> Result<(), CoreError> {
        let key = rev.key();
        let prior = rev.tasks().len().saturating_sub(1);
        let ctx = ReplayContext {
            key: &key,
            prior_tasks: &rev.spec.tasks[..prior],
            prior_records: &rev.task_records[..prior.min(rev.task_records.len())],
        };
        let applied = self.replayer().apply(&ctx, base, &task, Mode::Fresh)?;
        self.objects.put_tree(&applied.tree)?;
        TaskLog::new(rev).supersede_last(task, applied.record)
    }

    /// Merge new upstream content into a Draft.
    ///
    /// Without `upstream`, the source of the most recent clone or update is
    /// re-resolved. An explicit `upstream` may move to another ref but must
    /// name the same source as the current lock. Without `strategy`, the
    /// clone's strategy applies.
    /// Conflicts block the update and leave the Draft unchanged.
    pub fn update(
        &self,
        name: &str,
        upstream: Option<UpstreamPackage>,
        strategy: Option<MergeStrategy>,
        version: u64,
    ) -> Result<PackageRevision, CoreError> {
        info!("update {name}");
        let _guard = self.write_guard(name)?;
        let mut rev = self.load_draft(name, version)?;
        let upstream = match upstream {
            Some(upstream) => {
                if let Some(lock) = rev.upstream_lock() {
                    if !lock.same_source(&upstream) {
                        return Err(ValidationError::Invalid(format!(
                            "{name} tracks {}; an update cannot switch it to {}",
                            lock.describe(),
                            upstream.describe()
                        ))
                        .into());
                    }
                }
                upstream
            }
            None => rev
                .tasks()
                .iter()
                .rev()
                .find_map(Task::upstream)
                .cloned()
                .ok_or_else(|| {
                    ValidationError::Invalid(format!("{name} was not cloned from an upstream"))
                })?,
        };
        let task = Task::Update(PackageUpdateTaskSpec { upstream, strategy });
        task.validate()?;
        self.apply_and_append(&mut rev, task)?;
        self.commit(&mut rev)?;
        Ok(rev)
    }

    /// Re-derive a revision from its task list using the recorded locks and
    /// verify the result against the recorded digests.
    pub fn replay(&self, name: &str) -> Result<ReplayReport, CoreError> {
        info!("replay {name}");
        let _guard = self.write_guard(name)?;
        let rev = self.load(name)?;
        let tree = self.replayer().replay_locked(&rev)?;
        Ok(ReplayReport {
            name: rev.name,
            tasks: rev.spec.tasks.len(),
            tree_digest: rev.tree_digest,
            files: tree.len(),
        })
    }

    /// Collect objects unreachable from any revision or upstream cache entry.
    pub fn gc(&self, dry_run: bool, prune_cache: bool) -> Result<GcReport, CoreError> {
        info!("running garbage collection (dry_run={dry_run}, prune_cache={prune_cache})");
        self.layout.initialize()?;
        let _lock = StoreLock::acquire(&self.layout.gc_lock())?;
        let gc = GarbageCollector::new(self.layout.clone());
        let cancel = self.cancel.clone();
        Ok(gc.collect_with_cancel(dry_run, prune_cache, move || cancel.is_cancelled())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_matches_substrings_and_exact_repository() {
        let engine_dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(engine_dir.path());
        let key = RevisionKey::new("blueprints", "apps/web", "v1");
        let rev = engine
            .init(&key, PackageInitTaskSpec::default())
            .unwrap();

        let by_package = RevisionFilter {
            package: Some("web".to_owned()),
            ..RevisionFilter::default()
        };
        assert!(by_package.matches(&rev));

        let wrong_repo = RevisionFilter {
            repository: Some("blue".to_owned()),
            ..RevisionFilter::default()
        };
        assert!(!wrong_repo.matches(&rev));
        assert_eq!(engine.list(&by_package).unwrap().len(), 1);
        assert!(engine.list(&wrong_repo).unwrap().is_empty());
    }

    #[test]
    fn version_check_reports_both_versions() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());
        let key = RevisionKey::new("blueprints", "web", "v1");
        let rev = engine.init(&key, PackageInitTaskSpec::default()).unwrap();
        assert_eq!(rev.resource_version, 1);

        let err = engine.propose(&rev.name, 7, "alice").unwrap_err();
        assert!(matches!(
            err,
            CoreError::StaleVersion {
                presented: 7,
                current: 1,
                ..
            }
        ));
    }
}
