//! Derivation of package content from an ordered task list.
//!
//! Each task transforms the tree produced by its predecessor, starting from
//! an empty tree. Applying a task *fresh* resolves moving references (branch,
//! tag, source revision) and records what they resolved to; applying it
//! *locked* reuses the recorded lock, so re-deriving a revision reproduces
//! the recorded digests or fails with a drift error.

use crate::concurrency::CancelToken;
use crate::config::{EmptySelection, EngineConfig};
use crate::merge::merge_trees;
use crate::patch::apply_patches;
use crate::resolver::Resolver;
use crate::targeting::{select_resources, Selection};
use crate::CoreError;
use rpkg_runtime::{run_with_timeout, FunctionRequest, FunctionResponse, FunctionRunner};
use rpkg_schema::{
    join_path, normalize_subpackage, parse_manifests, readme, render_manifests,
    FunctionCall, FunctionEvalTaskSpec, Kptfile, MergeStrategy, PackageInitTaskSpec,
    PackageRevision, PackageTree, RevisionKey, RevisionLock, SupersededTask, Task, TaskRecord,
    TaskType, TreeDigest, UpstreamLock, UpstreamPackage, ValidationError, KPTFILE,
};
use rpkg_store::{ObjectStore, RevisionStore, StoreError};
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// The task list of a revision as an append-only log.
///
/// The only rewrite allowed is [`TaskLog::supersede_last`], which replaces the
/// final task with one of the same type and keeps the replaced task in the
/// revision's `superseded` history.
pub struct TaskLog<'a> {
    revision: &'a mut PackageRevision,
}

impl<'a> TaskLog<'a> {
    pub fn new(revision: &'a mut PackageRevision) -> Self {
        Self { revision }
    }

    pub fn len(&self) -> usize {
        self.revision.spec.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revision.spec.tasks.is_empty()
    }

    /// Digest of the tree the last task was applied to; `None` for the empty tree.
    pub fn base_of_last(&self) -> Option<TreeDigest> {
        let records = &self.revision.task_records;
        records
            .len()
            .checked_sub(2)
            .and_then(|i| records.get(i))
            .map(|record| record.tree_digest.clone())
    }

    pub fn append(&mut self, task: Task, record: TaskRecord) {
        self.revision.spec.tasks.push(task);
        self.revision.task_records.push(record);
        self.refresh();
    }

    pub fn supersede_last(&mut self, task: Task, record: TaskRecord) -> Result<(), CoreError> {
        let name = self.revision.name.to_string();
        let Some(last) = self.revision.spec.tasks.last() else {
            return Err(CoreError::Conflict(format!(
                "{name} has no task to amend"
            )));
        };
        if last.task_type() != task.task_type() {
            return Err(CoreError::Conflict(format!(
                "last task of {name} is {}, cannot amend it with a {} task",
                last.task_type(),
                task.task_type()
            )));
        }
        let position = self.revision.spec.tasks.len() - 1;
        let replaced = std::mem::replace(&mut self.revision.spec.tasks[position], task);
        self.revision.task_records.truncate(position);
        self.revision.task_records.push(record);
        self.revision.superseded.push(SupersededTask {
            task: replaced,
            superseded_at: chrono::Utc::now().to_rfc3339(),
            position,
        });
        self.refresh();
        Ok(())
    }

    /// Recompute the derived status fields from the task records.
    fn refresh(&mut self) {
        if let Some(record) = self.revision.task_records.last() {
            self.revision.tree_digest = record.tree_digest.clone();
        }
        self.revision.status.upstream_lock = self
            .revision
            .task_records
            .iter()
            .rev()
            .find(|record| matches!(record.task_type, TaskType::Clone | TaskType::Update))
            .and_then(|record| record.lock.clone());
    }
}

/// How a task is applied.
#[derive(Debug, Clone, Copy)]
pub enum Mode<'r> {
    /// Resolve moving references now.
    Fresh,
    /// Reproduce the recorded result.
    Locked(&'r TaskRecord),
}

/// Everything before the task being applied.
#[derive(Debug, Clone, Copy)]
pub struct ReplayContext<'r> {
    pub key: &'r RevisionKey,
    pub prior_tasks: &'r [Task],
    pub prior_records: &'r [TaskRecord],
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub tree: PackageTree,
    pub record: TaskRecord,
}

pub struct Replayer<'e> {
    pub(crate) resolver: &'e Resolver,
    pub(crate) runner: Arc<dyn FunctionRunner>,
    pub(crate) objects: &'e ObjectStore,
    pub(crate) revisions: &'e RevisionStore,
    pub(crate) config: &'e EngineConfig,
    pub(crate) cancel: &'e CancelToken,
}

fn record(task_type: TaskType, tree: &PackageTree) -> TaskRecord {
    TaskRecord {
        task_type,
        lock: None,
        function: None,
        tree_digest: tree.digest(),
        warnings: Vec::new(),
    }
}

fn recorded_lock<'r>(mode: Mode<'r>, what: TaskType) -> Result<Option<&'r UpstreamLock>, CoreError> {
    match mode {
        Mode::Fresh => Ok(None),
        Mode::Locked(record) => record.lock.as_ref().map(Some).ok_or_else(|| {
            CoreError::Store(StoreError::Corrupt {
                entry: format!("{what} task record"),
                reason: "no upstream lock was recorded".to_owned(),
            })
        }),
    }
}

impl Replayer<'_> {
    pub fn apply(
        &self,
        ctx: &ReplayContext<'_>,
        tree: &PackageTree,
        task: &Task,
        mode: Mode<'_>,
    ) -> Result<Applied, CoreError> {
        self.cancel.check()?;
        task.validate()?;
        debug!("applying {} task to {}", task.task_type(), ctx.key);
        match task {
            Task::Init(spec) => self.init(ctx, tree, spec),
            Task::Clone(spec) => {
                let (tree, lock) = self.fetch(&spec.upstream, mode, TaskType::Clone)?;
                let mut rec = record(TaskType::Clone, &tree);
                rec.lock = Some(lock);
                Ok(Applied { tree, record: rec })
            }
            Task::Patch(spec) => {
                let tree = apply_patches(tree, spec)?;
                let rec = record(TaskType::Patch, &tree);
                Ok(Applied { tree, record: rec })
            }
            Task::Edit(spec) => {
                let (tree, lock) = match recorded_lock(mode, TaskType::Edit)? {
                    Some(lock) => (self.resolver.fetch_locked(lock, self.cancel)?, lock.clone()),
                    None => self.read_source(&spec.source.name)?,
                };
                let mut rec = record(TaskType::Edit, &tree);
                rec.lock = Some(lock);
                Ok(Applied { tree, record: rec })
            }
            Task::Eval(spec) => self.eval(tree, spec),
            Task::Update(spec) => {
                let strategy = spec
                    .strategy
                    .unwrap_or_else(|| inherited_strategy(ctx.prior_tasks));
                let previous = ctx
                    .prior_records
                    .iter()
                    .rev()
                    .find(|r| matches!(r.task_type, TaskType::Clone | TaskType::Update))
                    .and_then(|r| r.lock.as_ref())
                    .ok_or_else(|| {
                        ValidationError::Invalid(format!(
                            "{} has no clone to update from",
                            ctx.key
                        ))
                    })?;
                let original = self.resolver.fetch_locked(previous, self.cancel)?;
                let (upstream, lock) = self.fetch(&spec.upstream, mode, TaskType::Update)?;
                let outcome = merge_trees(strategy, &original, &upstream, tree)?;
                for note in &outcome.notes {
                    debug!("update of {}: {note}", ctx.key);
                }
                let mut rec = record(TaskType::Update, &outcome.tree);
                rec.lock = Some(lock);
                rec.warnings = outcome.notes;
                Ok(Applied {
                    tree: outcome.tree,
                    record: rec,
                })
            }
        }
    }

    fn fetch(
        &self,
        upstream: &UpstreamPackage,
        mode: Mode<'_>,
        what: TaskType,
    ) -> Result<(PackageTree, UpstreamLock), CoreError> {
        match recorded_lock(mode, what)? {
            Some(lock) => Ok((self.resolver.fetch_locked(lock, self.cancel)?, lock.clone())),
            None => {
                let fetched = self.resolver.resolve(upstream, self.cancel)?;
                Ok((fetched.tree, fetched.lock))
            }
        }
    }

    fn read_source(&self, name: &str) -> Result<(PackageTree, UpstreamLock), CoreError> {
        let source = self.revisions.get(name).map_err(|e| match e {
            StoreError::RevisionNotFound(name) => CoreError::NotFound(name),
            other => CoreError::Store(other),
        })?;
        let tree = self.objects.get_tree(&source.tree_digest)?;
        let lock = UpstreamLock::Revision(RevisionLock {
            name: source.name,
            digest: source.tree_digest,
        });
        Ok((tree, lock))
    }

    fn init(
        &self,
        ctx: &ReplayContext<'_>,
        tree: &PackageTree,
        spec: &PackageInitTaskSpec,
    ) -> Result<Applied, CoreError> {
        let subpackage = normalize_subpackage(&spec.subpackage)?;
        let kptfile_path = join_path(&subpackage, KPTFILE);
        if tree.contains(&kptfile_path) {
            return Err(CoreError::Conflict(format!(
                "{kptfile_path} already exists in {}",
                ctx.key
            )));
        }
        let scope = if subpackage.is_empty() {
            ctx.key.package.as_str()
        } else {
            subpackage.as_str()
        };
        let name = scope.rsplit('/').next().unwrap_or(scope);

        let kptfile = Kptfile::new(name, &spec.description, &spec.keywords, &spec.site);
        let mut out = tree.clone();
        out.insert(
            kptfile_path,
            kptfile
                .to_yaml()
                .map_err(|e| ValidationError::Invalid(format!("cannot render Kptfile: {e}")))?,
        )?;
        let readme_path = join_path(&subpackage, "README.md");
        if !out.contains(&readme_path) {
            out.insert(readme_path, readme(name, &spec.description))?;
        }
        let rec = record(TaskType::Init, &out);
        Ok(Applied {
            tree: out,
            record: rec,
        })
    }

    fn eval(&self, tree: &PackageTree, spec: &FunctionEvalTaskSpec) -> Result<Applied, CoreError> {
        let selection = select_resources(tree, spec)?;
        let function = spec.function_id();
        let config = spec.resolved_config();
        let call = FunctionCall {
            function: function.clone(),
            config: config.clone(),
            selector: spec.selector.clone(),
            subpackage: selection.subpackage.clone(),
            include_meta_resources: spec.include_meta_resources,
            enable_network: spec.enable_network,
            selected: selection.items.len(),
        };

        if selection.items.is_empty() {
            let message = format!(
                "function {function} selected no resources (match {}, {} scanned)",
                spec.selector, selection.scanned
            );
            if self.config.eval.empty_selection == EmptySelection::Fail {
                return Err(ValidationError::Invalid(message).into());
            }
            warn!("{message}; tree unchanged");
            let mut rec = record(TaskType::Eval, tree);
            rec.function = Some(call);
            rec.warnings.push(message);
            return Ok(Applied {
                tree: tree.clone(),
                record: rec,
            });
        }

        let config = config
            .map(|c| serde_yaml::to_value(&c))
            .transpose()
            .map_err(|e| ValidationError::Invalid(format!("function config: {e}")))?;
        let request = FunctionRequest {
            function,
            config,
            selector: spec.selector.clone(),
            enable_network: spec.enable_network,
            items: selection.items.clone(),
        };
        let response = run_with_timeout(
            self.runner.clone(),
            request,
            self.config.timeouts.function(),
        )?;
        self.cancel.check()?;
        for line in &response.results {
            debug!("{}: {line}", call.function);
        }

        let out = write_back(tree, &selection, response)?;
        let mut rec = record(TaskType::Eval, &out);
        rec.function = Some(call);
        Ok(Applied {
            tree: out,
            record: rec,
        })
    }

    /// Re-derive `revision` from scratch using its recorded locks, checking
    /// each intermediate digest against the record.
    pub fn replay_locked(&self, revision: &PackageRevision) -> Result<PackageTree, CoreError> {
        let key = revision.key();
        let tasks = revision.tasks();
        let records = &revision.task_records;
        if records.len() != tasks.len() {
            return Err(CoreError::Store(StoreError::Corrupt {
                entry: revision.name.to_string(),
                reason: format!("{} tasks but {} task records", tasks.len(), records.len()),
            }));
        }

        let mut tree = PackageTree::new();
        for (position, (task, recorded)) in tasks.iter().zip(records).enumerate() {
            let ctx = ReplayContext {
                key: &key,
                prior_tasks: &tasks[..position],
                prior_records: &records[..position],
            };
            let applied = self.apply(&ctx, &tree, task, Mode::Locked(recorded))?;
            if applied.record.tree_digest != recorded.tree_digest {
                return Err(CoreError::Drift {
                    name: revision.name.to_string(),
                    position,
                    task: task.task_type().to_string(),
                    recorded: recorded.tree_digest.to_string(),
                    derived: applied.record.tree_digest.to_string(),
                });
            }
            tree = applied.tree;
        }

        let derived = tree.digest();
        if derived != revision.tree_digest {
            return Err(CoreError::Drift {
                name: revision.name.to_string(),
                position: tasks.len(),
                task: "result".to_owned(),
                recorded: revision.tree_digest.to_string(),
                derived: derived.to_string(),
            });
        }
        Ok(tree)
    }
}

/// Strategy of the most recent clone; the default if there is none.
fn inherited_strategy(prior_tasks: &[Task]) -> MergeStrategy {
    prior_tasks
        .iter()
        .rev()
        .find_map(|task| match task {
            Task::Clone(spec) => Some(spec.strategy),
            _ => None,
        })
        .unwrap_or_default()
}

/// Write function output back into the files its input came from.
///
/// Outputs keep their input's `(path, index)`; inputs missing from the output
/// are deleted; outputs at an unknown position are appended to their `path`,
/// or to a file named after the resource inside the subpackage.
fn write_back(
    tree: &PackageTree,
    selection: &Selection,
    response: FunctionResponse,
) -> Result<PackageTree, CoreError> {
    let inputs: BTreeSet<(String, usize)> = selection
        .items
        .iter()
        .map(|r| (r.path.clone(), r.index))
        .collect();

    let mut replaced: BTreeMap<(String, usize), Value> = BTreeMap::new();
    let mut added: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for item in response.items {
        let position = (item.path.clone(), item.index);
        if inputs.contains(&position) {
            replaced.insert(position, item.value);
            continue;
        }
        let path = if item.path.is_empty() {
            join_path(
                &selection.subpackage,
                &format!("{}_{}.yaml", item.kind().to_lowercase(), item.name()),
            )
        } else {
            item.path.clone()
        };
        added.entry(path).or_default().push(item.value);
    }

    let touched: BTreeSet<String> = inputs
        .iter()
        .map(|(path, _)| path.clone())
        .chain(added.keys().cloned())
        .collect();

    let mut out = tree.clone();
    for path in touched {
        let existing = match tree.get(&path) {
            Some(contents) => parse_manifests(&path, contents)?,
            None => Vec::new(),
        };
        let mut docs: Vec<Value> = Vec::with_capacity(existing.len());
        for resource in &existing {
            let position = (path.clone(), resource.index);
            if inputs.contains(&position) {
                if let Some(value) = replaced.remove(&position) {
                    docs.push(value);
                }
            } else {
                docs.push(resource.value.clone());
            }
        }
        if let Some(new_docs) = added.remove(&path) {
            docs.extend(new_docs);
        }

        let unchanged = existing.len() == docs.len()
            && existing.iter().zip(&docs).all(|(r, d)| &r.value == d);
        if unchanged {
            continue;
        }
        if docs.is_empty() {
            out.remove(&path);
        } else {
            out.insert(path.as_str(), render_manifests(&docs)?)?;
        }
    }
    Ok(out)
}
