//! CLI subprocess integration tests.
//!
//! These tests invoke the `rpkg` binary against a temporary store and check
//! exit codes, stdout content and JSON output.

use std::path::Path;
use std::process::{Command, Output};

struct Harness {
    store: tempfile::TempDir,
    home: tempfile::TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: tempfile::tempdir().unwrap(),
            home: tempfile::tempdir().unwrap(),
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_rpkg"));
        cmd.env("HOME", self.home.path())
            .env_remove("RPKG_LOG")
            .arg("--store")
            .arg(self.store.path());
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.cmd().args(args).output().unwrap()
    }

    fn json(&self, args: &[&str]) -> serde_json::Value {
        let output = self.cmd().arg("--json").args(args).output().unwrap();
        assert!(
            output.status.success(),
            "{args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        serde_json::from_slice(&output.stdout).unwrap()
    }

    /// Init `package` in repository `blueprints` and return its name.
    fn init(&self, package: &str) -> String {
        let rev = self.json(&["init", package, "--repository", "blueprints"]);
        rev["name"].as_str().unwrap().to_owned()
    }
}

fn write_file(dir: &Path, path: &str, contents: &str) {
    let dest = dir.join(path);
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::write(dest, contents).unwrap();
}

#[test]
fn cli_version_exits_zero() {
    let output = Command::new(env!("CARGO_BIN_EXE_rpkg"))
        .arg("--version")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("rpkg"));
}

#[test]
fn cli_help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_rpkg"))
        .arg("--help")
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["init", "clone", "push", "propose", "approve", "update", "eval", "gc"] {
        assert!(stdout.contains(sub), "help is missing {sub}");
    }
}

#[test]
fn cli_init_then_get_json() {
    let h = Harness::new();
    let name = h.init("web");

    let rev = h.json(&["get", &name]);
    assert_eq!(rev["spec"]["packageName"], "web");
    assert_eq!(rev["spec"]["repository"], "blueprints");
    assert_eq!(rev["spec"]["revision"], "v1");
    assert_eq!(rev["spec"]["lifecycle"], "Draft");
    assert_eq!(rev["resourceVersion"], 1);
    assert_eq!(rev["spec"]["tasks"].as_array().unwrap().len(), 1);

    let listed = h.json(&["get", "--repository", "blueprints"]);
    assert_eq!(listed.as_array().unwrap().len(), 1);
    let none = h.json(&["get", "--repository", "other"]);
    assert!(none.as_array().unwrap().is_empty());
}

#[test]
fn cli_init_twice_is_a_conflict() {
    let h = Harness::new();
    h.init("web");
    let output = h.run(&["init", "web", "--repository", "blueprints"]);
    assert_eq!(output.status.code(), Some(4));
}

#[test]
fn cli_invalid_identity_exits_two() {
    let h = Harness::new();
    let output = h.run(&["init", "bad name", "--repository", "blueprints"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("error:"));
}

#[test]
fn cli_unknown_runner_exits_two() {
    let h = Harness::new();
    let output = h.run(&["--runner", "wasm", "get"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_missing_revision_exits_one() {
    let h = Harness::new();
    let output = h.run(&["get", "blueprints-0000"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn cli_push_then_pull_round_trips_a_directory() {
    let h = Harness::new();
    let name = h.init("web");

    let work = tempfile::tempdir().unwrap();
    let pulled = h.run(&["pull", &name, work.path().to_str().unwrap()]);
    assert!(pulled.status.success());
    assert!(work.path().join("Kptfile").exists());

    write_file(
        work.path(),
        "deploy/cm.yaml",
        "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: web\n",
    );
    let pushed = h.json(&["push", &name, work.path().to_str().unwrap()]);
    assert_eq!(pushed["resourceVersion"], 2);
    assert_eq!(pushed["spec"]["tasks"][1]["type"], "patch");

    let files = h.json(&["pull", &name]);
    assert!(files["deploy/cm.yaml"]
        .as_str()
        .unwrap()
        .contains("kind: ConfigMap"));
    assert!(files["Kptfile"].is_string());
}

#[test]
fn cli_stale_version_exits_four() {
    let h = Harness::new();
    let name = h.init("web");
    let work = tempfile::tempdir().unwrap();
    write_file(work.path(), "Kptfile", "kind: Kptfile\n");
    let output = h.run(&[
        "push",
        &name,
        work.path().to_str().unwrap(),
        "--resource-version",
        "7",
    ]);
    assert_eq!(output.status.code(), Some(4));
    let rev = h.json(&["get", &name]);
    assert_eq!(rev["resourceVersion"], 1);
}

#[test]
fn cli_propose_and_approve_publish() {
    let h = Harness::new();
    let name = h.init("web");

    let proposed = h.json(&["propose", &name, "--actor", "alice"]);
    assert_eq!(proposed["spec"]["lifecycle"], "Proposed");

    let published = h.json(&["approve", &name, "--actor", "bob"]);
    assert_eq!(published["spec"]["lifecycle"], "Published");
    assert_eq!(published["status"]["publishedBy"], "bob");

    // Published revisions reject further edits.
    let work = tempfile::tempdir().unwrap();
    write_file(work.path(), "Kptfile", "kind: Kptfile\n");
    let output = h.run(&["push", &name, work.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(4));
}

#[test]
fn cli_copy_creates_an_edit_revision() {
    let h = Harness::new();
    let name = h.init("web");
    let copy = h.json(&["copy", &name, "web", "--repository", "blueprints", "--revision", "v2"]);
    assert_eq!(copy["spec"]["revision"], "v2");
    assert_eq!(copy["spec"]["tasks"][0]["type"], "edit");

    let original = h.json(&["pull", &name]);
    let copied = h.json(&["pull", copy["name"].as_str().unwrap()]);
    assert_eq!(original, copied);
}

#[test]
fn cli_update_without_upstream_exits_two() {
    let h = Harness::new();
    let name = h.init("web");
    let output = h.run(&["update", &name]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cli_update_ref_without_tracked_upstream_exits_two() {
    let h = Harness::new();
    let name = h.init("web");
    let output = h.run(&["update", &name, "--ref", "v2"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("not cloned from an upstream"));
    let rev = h.json(&["get", &name]);
    assert_eq!(rev["resourceVersion"], 1);
}

#[test]
fn cli_pull_into_non_empty_directory_exits_two() {
    let h = Harness::new();
    let name = h.init("web");
    let work = tempfile::tempdir().unwrap();
    write_file(work.path(), "stale.yaml", "kind: Secret\n");

    let output = h.run(&["pull", &name, work.path().to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
    assert!(!work.path().join("Kptfile").exists());
    assert!(work.path().join("stale.yaml").exists());
}

#[test]
fn cli_replay_reports_matching_digest() {
    let h = Harness::new();
    let name = h.init("web");
    let report = h.json(&["replay", &name]);
    let rev = h.json(&["get", &name]);
    assert_eq!(report["tree_digest"], rev["treeDigest"]);
}

#[test]
fn cli_delete_then_gc() {
    let h = Harness::new();
    let name = h.init("web");
    let deleted = h.run(&["del", &name]);
    assert!(deleted.status.success());

    let missing = h.run(&["get", &name]);
    assert_eq!(missing.status.code(), Some(1));

    let report = h.json(&["gc"]);
    assert_eq!(report["dry_run"], false);
    assert!(report["removed_objects"].as_u64().unwrap() >= 1);
}
