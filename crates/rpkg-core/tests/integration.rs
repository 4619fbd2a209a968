use rpkg_core::{CoreError, EmptySelection, Engine, EngineConfig, ErrorKind, RevisionFilter};
use rpkg_remote::{MemoryFetcher, UpstreamError};
use rpkg_runtime::mock::MOCK_ANNOTATION;
use rpkg_runtime::{ExecutionCause, MockRunner};
use rpkg_schema::{
    parse_manifests, FunctionEvalTaskSpec, GitPackage, Kptfile, Lifecycle, MergeStrategy,
    PackageInitTaskSpec, PackageRevision, PackageRevisionRef, PackageTree, RevisionKey,
    RevisionName, Selector, Task, TaskType, UpstreamLock, UpstreamPackage,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;

const REPO: &str = "https://example.com/blueprints.git";

const CONFIGMAP_V1: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: v1
";

const CONFIGMAP_V2: &str = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  mode: v2
";

fn fast_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 2;
    config
}

fn key(package: &str, revision: &str) -> RevisionKey {
    RevisionKey::new("blueprints", package, revision)
}

fn git(git_ref: &str) -> UpstreamPackage {
    UpstreamPackage::Git(GitPackage {
        repo: REPO.to_owned(),
        git_ref: git_ref.to_owned(),
        directory: "/".to_owned(),
        secret_ref: None,
    })
}

fn files(entries: &[(&str, &str)]) -> PackageTree {
    PackageTree::from_files(entries.iter().copied()).unwrap()
}

fn init(engine: &Engine, package: &str) -> PackageRevision {
    engine
        .init(
            &key(package, "v1"),
            PackageInitTaskSpec {
                description: "sample".to_owned(),
                ..PackageInitTaskSpec::default()
            },
        )
        .unwrap()
}

fn yaml_field<'a>(value: &'a serde_yaml::Value, path: &[&str]) -> Option<&'a str> {
    let mut current = value;
    for segment in path {
        current = current.get(*segment)?;
    }
    current.as_str()
}

#[test]
fn init_scaffolds_kptfile_and_readme() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "apps/web");

    assert_eq!(rev.lifecycle(), Lifecycle::Draft);
    assert_eq!(rev.resource_version, 1);
    assert_eq!(rev.tasks().len(), 1);
    assert_eq!(rev.task_records[0].task_type, TaskType::Init);

    let tree = engine.pull(&rev.name).unwrap();
    let kptfile = Kptfile::from_yaml(tree.get("Kptfile").unwrap()).unwrap();
    assert_eq!(kptfile.metadata.name, "web");
    assert!(tree.get("README.md").unwrap().contains("sample"));
    assert_eq!(tree.digest(), rev.tree_digest);
}

#[test]
fn creating_an_existing_revision_fails() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    init(&engine, "web");
    let err = engine
        .init(&key("web", "v1"), PackageInitTaskSpec::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::AlreadyExists(_)));
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn invalid_identity_is_a_validation_error() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let err = engine
        .init(&key("web", "-v1"), PackageInitTaskSpec::default())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(engine.list(&RevisionFilter::default()).unwrap().is_empty());
}

#[test]
fn lifecycle_walks_draft_proposed_published() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");

    let proposed = engine.propose(&rev.name, 1, "alice").unwrap();
    assert_eq!(proposed.lifecycle(), Lifecycle::Proposed);
    assert_eq!(proposed.resource_version, 2);
    assert_eq!(proposed.annotations.get("proposedBy").map(String::as_str), Some("alice"));
    assert_eq!(proposed.tree_digest, rev.tree_digest);

    // Content is frozen outside Draft.
    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert("extra.txt", "x\n").unwrap();
    let err = engine.push(&rev.name, &tree, 2).unwrap_err();
    assert!(matches!(err, CoreError::NotDraft { .. }));

    let rejected = engine.reject(&rev.name, 2, "bob").unwrap();
    assert_eq!(rejected.lifecycle(), Lifecycle::Draft);
    assert!(rejected.annotations.is_empty());

    engine.propose(&rev.name, 3, "alice").unwrap();
    let published = engine.approve(&rev.name, 4, "bob").unwrap();
    assert_eq!(published.lifecycle(), Lifecycle::Published);
    assert_eq!(published.status.published_by.as_deref(), Some("bob"));
    assert!(published.status.published_at.is_some());

    let err = engine.propose(&rev.name, 5, "alice").unwrap_err();
    assert!(matches!(
        err,
        CoreError::InvalidTransition {
            from: Lifecycle::Published,
            to: Lifecycle::Proposed,
            ..
        }
    ));
}

#[test]
fn approve_requires_proposed() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");
    let err = engine.approve(&rev.name, 1, "bob").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(engine.get(&rev.name).unwrap().lifecycle(), Lifecycle::Draft);
}

#[test]
fn stale_version_applies_nothing() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");
    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert("app.yaml", CONFIGMAP_V1).unwrap();

    let err = engine.push(&rev.name, &tree, 0).unwrap_err();
    assert!(matches!(
        err,
        CoreError::StaleVersion {
            presented: 0,
            current: 1,
            ..
        }
    ));
    let after = engine.get(&rev.name).unwrap();
    assert_eq!(after.resource_version, 1);
    assert_eq!(after.tasks().len(), 1);
}

#[test]
fn push_records_a_patch_and_supersedes_a_trailing_one() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");

    let mut first = engine.pull(&rev.name).unwrap();
    first.insert("app.yaml", CONFIGMAP_V1).unwrap();
    let rev = engine.push(&rev.name, &first, 1).unwrap();
    assert_eq!(rev.tasks().len(), 2);
    assert!(matches!(rev.last_task(), Some(Task::Patch(_))));

    let mut second = first.clone();
    second.insert("app.yaml", CONFIGMAP_V2).unwrap();
    second.insert("notes.txt", "hello\n").unwrap();
    let rev = engine.push(&rev.name, &second, 2).unwrap();
    assert_eq!(rev.tasks().len(), 2, "trailing patch was superseded");
    assert_eq!(rev.superseded.len(), 1);
    assert_eq!(rev.superseded[0].position, 1);
    assert_eq!(engine.pull(&rev.name).unwrap(), second);

    // Pushing identical content is a no-op.
    let same = engine.push(&rev.name, &second, 3).unwrap();
    assert_eq!(same.resource_version, 3);

    let report = engine.replay(&rev.name).unwrap();
    assert_eq!(report.tree_digest, second.digest());
}

#[test]
fn clone_pins_the_commit_and_replay_is_locked() {
    let store = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryFetcher::new());
    let commit = remote.publish_git(REPO, "main", files(&[("app.yaml", CONFIGMAP_V1)]));
    let engine = Engine::new(store.path())
        .with_git(remote.clone())
        .with_config(fast_config());

    let rev = engine
        .clone_package(&key("web", "v1"), git("main"), MergeStrategy::ResourceMerge)
        .unwrap();
    match rev.upstream_lock() {
        Some(UpstreamLock::Git(lock)) => assert_eq!(lock.commit, commit),
        other => panic!("unexpected lock {other:?}"),
    }
    assert!(rev.spec.parent.is_none());

    remote.publish_git(REPO, "main", files(&[("app.yaml", CONFIGMAP_V2)]));
    let report = engine.replay(&rev.name).unwrap();
    assert_eq!(report.tree_digest, rev.tree_digest);
    assert_eq!(report.tasks, 1);
    assert_eq!(remote.fetch_count(), 1, "locked replay is served from the store");
}

#[test]
fn unreachable_upstream_is_retried_through_the_engine() {
    let store = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryFetcher::new());
    remote.publish_git(REPO, "main", files(&[("app.yaml", CONFIGMAP_V1)]));
    remote.fail_next_n(&UpstreamError::Unreachable("connection reset".to_owned()), 2);
    let engine = Engine::new(store.path())
        .with_git(remote.clone())
        .with_config(fast_config());

    engine
        .clone_package(&key("web", "v1"), git("main"), MergeStrategy::default())
        .unwrap();
    assert_eq!(remote.fetch_count(), 3);
}

#[test]
fn missing_upstream_fails_without_creating_a_revision() {
    let store = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryFetcher::new());
    let engine = Engine::new(store.path())
        .with_git(remote.clone())
        .with_config(fast_config());

    let err = engine
        .clone_package(&key("web", "v1"), git("main"), MergeStrategy::default())
        .unwrap_err();
    assert!(matches!(err, CoreError::Upstream(UpstreamError::NotFound(_))));
    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert_eq!(remote.fetch_count(), 1, "not found is not retried");
    assert!(engine.list(&RevisionFilter::default()).unwrap().is_empty());
}

#[test]
fn update_merges_upstream_changes_with_local_edits() {
    let store = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryFetcher::new());
    remote.publish_git(
        REPO,
        "main",
        files(&[("app.yaml", CONFIGMAP_V1), ("README.md", "upstream\n")]),
    );
    let engine = Engine::new(store.path())
        .with_git(remote.clone())
        .with_config(fast_config());
    let rev = engine
        .clone_package(&key("web", "v1"), git("main"), MergeStrategy::ResourceMerge)
        .unwrap();

    let mut local = engine.pull(&rev.name).unwrap();
    local
        .insert(
            "app.yaml",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n  labels:\n    team: web\ndata:\n  mode: v1\n",
        )
        .unwrap();
    local.insert("local.txt", "mine\n").unwrap();
    let rev = engine.push(&rev.name, &local, 1).unwrap();

    remote.publish_git(
        REPO,
        "main",
        files(&[("app.yaml", CONFIGMAP_V2), ("README.md", "upstream\n")]),
    );
    let updated = engine.update(&rev.name, None, None, 2).unwrap();
    assert_eq!(updated.tasks().len(), 3);
    assert_eq!(updated.task_records[2].task_type, TaskType::Update);

    let tree = engine.pull(&updated.name).unwrap();
    let docs = parse_manifests("app.yaml", tree.get("app.yaml").unwrap()).unwrap();
    assert_eq!(docs.len(), 1);
    assert_eq!(yaml_field(&docs[0].value, &["data", "mode"]), Some("v2"));
    assert_eq!(
        yaml_field(&docs[0].value, &["metadata", "labels", "team"]),
        Some("web")
    );
    assert_eq!(tree.get("local.txt"), Some("mine\n"));

    match (rev.upstream_lock(), updated.upstream_lock()) {
        (Some(UpstreamLock::Git(before)), Some(UpstreamLock::Git(after))) => {
            assert_ne!(before.commit, after.commit);
        }
        other => panic!("unexpected locks {other:?}"),
    }

    let report = engine.replay(&updated.name).unwrap();
    assert_eq!(report.tree_digest, updated.tree_digest);
}

#[test]
fn update_conflict_blocks_and_leaves_the_draft_unchanged() {
    let store = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryFetcher::new());
    remote.publish_git(
        REPO,
        "main",
        files(&[("app.yaml", CONFIGMAP_V1), ("README.md", "upstream\n")]),
    );
    let engine = Engine::new(store.path())
        .with_git(remote.clone())
        .with_config(fast_config());
    let rev = engine
        .clone_package(&key("web", "v1"), git("main"), MergeStrategy::ResourceMerge)
        .unwrap();

    let mut local = engine.pull(&rev.name).unwrap();
    local.insert("app.yaml", CONFIGMAP_V2).unwrap();
    let rev = engine.push(&rev.name, &local, 1).unwrap();

    // Upstream deletes the resource the Draft modified.
    remote.publish_git(REPO, "main", files(&[("README.md", "upstream\n")]));
    let err = engine.update(&rev.name, None, None, 2).unwrap_err();
    match &err {
        CoreError::MergeConflict(conflicts) => assert_eq!(conflicts.len(), 1),
        other => panic!("expected a merge conflict, got {other}"),
    }
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let after = engine.get(&rev.name).unwrap();
    assert_eq!(after.resource_version, 2);
    assert_eq!(after.tree_digest, rev.tree_digest);
}

#[test]
fn fast_forward_inherited_from_clone_rejects_local_changes() {
    let store = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryFetcher::new());
    remote.publish_git(REPO, "main", files(&[("app.yaml", CONFIGMAP_V1)]));
    let engine = Engine::new(store.path())
        .with_git(remote.clone())
        .with_config(fast_config());
    let rev = engine
        .clone_package(&key("web", "v1"), git("main"), MergeStrategy::FastForward)
        .unwrap();

    let mut local = engine.pull(&rev.name).unwrap();
    local.insert("local.txt", "mine\n").unwrap();
    let rev = engine.push(&rev.name, &local, 1).unwrap();

    remote.publish_git(REPO, "main", files(&[("app.yaml", CONFIGMAP_V2)]));
    let err = engine.update(&rev.name, None, None, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // An explicit strategy overrides the inherited one.
    let replaced = engine
        .update(&rev.name, None, Some(MergeStrategy::ForceDeleteReplace), 2)
        .unwrap();
    let tree = engine.pull(&replaced.name).unwrap();
    assert_eq!(tree, files(&[("app.yaml", CONFIGMAP_V2)]));
}

#[test]
fn update_cannot_switch_to_another_source() {
    let store = tempfile::tempdir().unwrap();
    let remote = Arc::new(MemoryFetcher::new());
    remote.publish_git(REPO, "main", files(&[("app.yaml", CONFIGMAP_V1)]));
    remote.publish_git(
        "https://example.com/elsewhere.git",
        "main",
        files(&[("app.yaml", CONFIGMAP_V2)]),
    );
    let engine = Engine::new(store.path())
        .with_git(remote.clone())
        .with_config(fast_config());
    let rev = engine
        .clone_package(&key("web", "v1"), git("main"), MergeStrategy::ResourceMerge)
        .unwrap();

    let elsewhere = UpstreamPackage::Git(GitPackage {
        repo: "https://example.com/elsewhere.git".to_owned(),
        git_ref: "main".to_owned(),
        directory: "/".to_owned(),
        secret_ref: None,
    });
    let err = engine
        .update(&rev.name, Some(elsewhere), None, 1)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(engine.get(&rev.name).unwrap().resource_version, 1);

    remote.publish_git(REPO, "v2", files(&[("app.yaml", CONFIGMAP_V2)]));
    let moved = engine.update(&rev.name, Some(git("v2")), None, 1).unwrap();
    let tree = engine.pull(&moved.name).unwrap();
    let docs = parse_manifests("app.yaml", tree.get("app.yaml").unwrap()).unwrap();
    assert_eq!(yaml_field(&docs[0].value, &["data", "mode"]), Some("v2"));
}

#[test]
fn update_without_clone_is_rejected() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");
    let err = engine.update(&rev.name, None, None, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[test]
fn clone_from_revision_sets_parent_and_copy_duplicates_content() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let base = init(&engine, "base");

    let upstream = UpstreamPackage::Revision(PackageRevisionRef {
        name: base.name.clone(),
    });
    let derived = engine
        .clone_package(&key("derived", "v1"), upstream, MergeStrategy::default())
        .unwrap();
    assert_eq!(
        derived.spec.parent.as_ref().map(|p| p.name.clone()),
        Some(base.name.clone())
    );
    assert_eq!(derived.tree_digest, base.tree_digest);

    let copy = engine.copy(&base.name, &key("base", "v2")).unwrap();
    assert_eq!(copy.tree_digest, base.tree_digest);
    assert!(matches!(copy.last_task(), Some(Task::Edit(_))));
    assert!(copy.spec.parent.is_none());

    let err = engine
        .copy("blueprints-missing", &key("base", "v3"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn eval_annotates_only_selected_resources() {
    let store = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let engine = Engine::new(store.path()).with_runner(runner.clone());
    let rev = init(&engine, "web");

    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert(
        "app.yaml",
        format!("{CONFIGMAP_V1}---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: token\n"),
    )
    .unwrap();
    let rev = engine.push(&rev.name, &tree, 1).unwrap();

    let eval = Task::Eval(FunctionEvalTaskSpec {
        image: "gcr.io/kpt-fn/annotate:v1".to_owned(),
        selector: Selector {
            kind: "ConfigMap".to_owned(),
            ..Selector::default()
        },
        ..FunctionEvalTaskSpec::default()
    });
    let rev = engine.append_task(&rev.name, eval, 2).unwrap();
    assert_eq!(runner.call_count(), 1);
    assert_eq!(runner.requests()[0].items.len(), 1);

    let record = rev.task_records.last().unwrap();
    let call = record.function.as_ref().unwrap();
    assert_eq!(call.selected, 1);
    assert_eq!(call.function, "gcr.io/kpt-fn/annotate:v1");

    let tree = engine.pull(&rev.name).unwrap();
    let docs = parse_manifests("app.yaml", tree.get("app.yaml").unwrap()).unwrap();
    assert_eq!(docs[0].annotation(MOCK_ANNOTATION), Some("annotate"));
    assert_eq!(docs[1].annotation(MOCK_ANNOTATION), None);
    assert!(!tree.get("Kptfile").unwrap().contains(MOCK_ANNOTATION));
}

#[test]
fn eval_with_no_matches_warns_and_skips_the_function() {
    let store = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let engine = Engine::new(store.path()).with_runner(runner.clone());
    let rev = init(&engine, "web");

    let eval = Task::Eval(FunctionEvalTaskSpec {
        image: "gcr.io/kpt-fn/annotate:v1".to_owned(),
        selector: Selector {
            kind: "Deployment".to_owned(),
            ..Selector::default()
        },
        ..FunctionEvalTaskSpec::default()
    });
    let after = engine.append_task(&rev.name, eval, 1).unwrap();
    assert_eq!(runner.call_count(), 0);
    assert_eq!(after.tree_digest, rev.tree_digest);
    assert_eq!(after.task_records[1].warnings.len(), 1);
}

#[test]
fn eval_with_no_matches_can_be_an_error() {
    let store = tempfile::tempdir().unwrap();
    let mut config = EngineConfig::default();
    config.eval.empty_selection = EmptySelection::Fail;
    let engine = Engine::new(store.path())
        .with_runner(Arc::new(MockRunner::new()))
        .with_config(config);
    let rev = init(&engine, "web");

    let eval = Task::Eval(FunctionEvalTaskSpec {
        image: "gcr.io/kpt-fn/annotate:v1".to_owned(),
        selector: Selector {
            kind: "Deployment".to_owned(),
            ..Selector::default()
        },
        ..FunctionEvalTaskSpec::default()
    });
    let err = engine.append_task(&rev.name, eval, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(engine.get(&rev.name).unwrap().resource_version, 1);
}

#[test]
fn failing_function_is_an_execution_error() {
    let store = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let engine = Engine::new(store.path()).with_runner(runner.clone());
    let rev = init(&engine, "web");
    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert("app.yaml", CONFIGMAP_V1).unwrap();
    let rev = engine.push(&rev.name, &tree, 1).unwrap();

    runner.fail_next(ExecutionCause::NonZeroExit {
        code: 1,
        stderr: "boom".to_owned(),
    });
    let eval = Task::Eval(FunctionEvalTaskSpec {
        image: "gcr.io/kpt-fn/annotate:v1".to_owned(),
        ..FunctionEvalTaskSpec::default()
    });
    let err = engine.append_task(&rev.name, eval, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("annotate"));
    assert_eq!(engine.get(&rev.name).unwrap().tasks().len(), 2);
}

#[test]
fn builtin_set_namespace_rewrites_namespaced_resources() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");
    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert("app.yaml", CONFIGMAP_V1).unwrap();
    let rev = engine.push(&rev.name, &tree, 1).unwrap();

    let eval = Task::Eval(FunctionEvalTaskSpec {
        image: "gcr.io/kpt-fn/set-namespace:v0.4.1".to_owned(),
        config_map: BTreeMap::from([("namespace".to_owned(), "prod".to_owned())]),
        ..FunctionEvalTaskSpec::default()
    });
    let rev = engine.append_task(&rev.name, eval, 2).unwrap();
    let tree = engine.pull(&rev.name).unwrap();
    let docs = parse_manifests("app.yaml", tree.get("app.yaml").unwrap()).unwrap();
    assert_eq!(docs[0].namespace(), "prod");

    let report = engine.replay(&rev.name).unwrap();
    assert_eq!(report.tree_digest, rev.tree_digest);
}

#[test]
fn amend_last_task_requires_the_same_type() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");

    let amended = engine
        .amend_last_task(
            &rev.name,
            Task::Init(PackageInitTaskSpec {
                description: "amended".to_owned(),
                ..PackageInitTaskSpec::default()
            }),
            1,
        )
        .unwrap();
    assert_eq!(amended.tasks().len(), 1);
    assert_eq!(amended.superseded.len(), 1);
    assert!(engine
        .pull(&amended.name)
        .unwrap()
        .get("README.md")
        .unwrap()
        .contains("amended"));

    let err = engine
        .amend_last_task(&rev.name, Task::Edit(rpkg_schema::PackageEditTaskSpec {
            source: PackageRevisionRef {
                name: RevisionName::new("other"),
            },
        }), 2)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn amend_with_another_type_runs_nothing() {
    let store = tempfile::tempdir().unwrap();
    let runner = Arc::new(MockRunner::new());
    let engine = Engine::new(store.path()).with_runner(runner.clone());
    let rev = init(&engine, "web");
    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert("app.yaml", CONFIGMAP_V1).unwrap();
    let rev = engine.push(&rev.name, &tree, 1).unwrap();

    let eval = Task::Eval(FunctionEvalTaskSpec {
        image: "gcr.io/kpt-fn/annotate:v1".to_owned(),
        ..FunctionEvalTaskSpec::default()
    });
    let err = engine.amend_last_task(&rev.name, eval, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(runner.call_count(), 0);
    let after = engine.get(&rev.name).unwrap();
    assert_eq!(after.resource_version, 2);
    assert_eq!(after.tree_digest, rev.tree_digest);
}

#[test]
fn function_missing_from_the_runner_is_an_execution_error() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");
    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert("app.yaml", CONFIGMAP_V1).unwrap();
    let rev = engine.push(&rev.name, &tree, 1).unwrap();

    let eval = Task::Eval(FunctionEvalTaskSpec {
        image: "example.com/fn/not-shipped:v1".to_owned(),
        ..FunctionEvalTaskSpec::default()
    });
    let err = engine.append_task(&rev.name, eval, 2).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execution);
    assert!(err.to_string().contains("not-shipped"));
    assert_eq!(engine.get(&rev.name).unwrap().resource_version, 2);
}

#[test]
fn tampered_record_is_reported_as_drift() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");
    let mut tree = engine.pull(&rev.name).unwrap();
    tree.insert("app.yaml", CONFIGMAP_V1).unwrap();
    let rev = engine.push(&rev.name, &tree, 1).unwrap();

    let mut tampered = rev.clone();
    tampered.task_records[0].tree_digest = tree.digest();
    rpkg_store::RevisionStore::new(rpkg_store::StoreLayout::new(store.path()))
        .put(&tampered)
        .unwrap();

    let err = engine.replay(&rev.name).unwrap_err();
    match err {
        CoreError::Drift { position, .. } => assert_eq!(position, 0),
        other => panic!("expected drift, got {other}"),
    }
}

#[test]
fn concurrent_writers_on_one_revision_never_lose_updates() {
    let store = tempfile::tempdir().unwrap();
    let rev = init(&Engine::new(store.path()), "web");
    let base = Engine::new(store.path()).pull(&rev.name).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|i| {
            let root = store.path().to_path_buf();
            let name = rev.name.to_string();
            let barrier = barrier.clone();
            let mut tree = base.clone();
            tree.insert(format!("writer-{i}.txt"), "x\n").unwrap();
            thread::spawn(move || {
                let engine = Engine::new(root);
                barrier.wait();
                engine.push(&name, &tree, 1)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let committed = results.iter().filter(|r| r.is_ok()).count();
    let stale = results
        .iter()
        .filter(|r| matches!(r, Err(CoreError::StaleVersion { .. })))
        .count();
    assert_eq!((committed, stale), (1, 1));
    assert_eq!(
        Engine::new(store.path()).get(&rev.name).unwrap().resource_version,
        2
    );
}

#[test]
fn deployment_flag_follows_configuration() {
    let store = tempfile::tempdir().unwrap();
    let config = EngineConfig::from_toml("deployment_repositories = [\"blueprints\"]\n").unwrap();
    let engine = Engine::new(store.path()).with_config(config);
    assert!(init(&engine, "web").status.deployment);

    let plain = Engine::new(store.path());
    let other = plain
        .init(
            &RevisionKey::new("catalog", "web", "v1"),
            PackageInitTaskSpec::default(),
        )
        .unwrap();
    assert!(!other.status.deployment);
}

#[test]
fn delete_then_gc_collects_unreferenced_content() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let keep = init(&engine, "keep");
    let doomed = init(&engine, "doomed");
    let mut tree = engine.pull(&doomed.name).unwrap();
    tree.insert("only-here.txt", "unique content\n").unwrap();
    let doomed = engine.push(&doomed.name, &tree, 1).unwrap();

    let err = engine.delete(&doomed.name, Some(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    engine.delete(&doomed.name, Some(2)).unwrap();
    assert_eq!(engine.get(&doomed.name).unwrap_err().kind(), ErrorKind::NotFound);

    let preview = engine.gc(true, false).unwrap();
    assert!(!preview.orphaned_objects.is_empty());
    assert_eq!(preview.removed_objects, 0);

    let report = engine.gc(false, false).unwrap();
    assert_eq!(report.removed_objects, preview.orphaned_objects.len());
    assert_eq!(engine.replay(&keep.name).unwrap().tree_digest, keep.tree_digest);
}

#[test]
fn cancelled_engine_commits_nothing() {
    let store = tempfile::tempdir().unwrap();
    let engine = Engine::new(store.path());
    let rev = init(&engine, "web");
    engine.cancel_token().cancel();

    let err = engine.propose(&rev.name, 1, "alice").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(
        Engine::new(store.path()).get(&rev.name).unwrap().lifecycle(),
        Lifecycle::Draft
    );
}
