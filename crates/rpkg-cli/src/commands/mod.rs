pub mod clone;
pub mod copy;
pub mod del;
pub mod eval;
pub mod gc;
pub mod get;
pub mod init;
pub mod lifecycle;
pub mod pull;
pub mod push;
pub mod replay;
pub mod update;

use indicatif::{ProgressBar, ProgressStyle};
use rpkg_core::{CoreError, Engine, ErrorKind};
use rpkg_schema::{PackageRevision, PackageTree};
use std::fmt;
use std::path::Path;
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_VALIDATION_ERROR: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_CONFLICT: u8 = 4;
pub const EXIT_UPSTREAM_ERROR: u8 = 5;

#[derive(Debug)]
pub enum CliError {
    Core(CoreError),
    /// Bad command-line input.
    Invalid(String),
    Failed(String),
}

impl From<CoreError> for CliError {
    fn from(e: CoreError) -> Self {
        CliError::Core(e)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Core(e) => write!(f, "{e}"),
            CliError::Invalid(msg) | CliError::Failed(msg) => f.write_str(msg),
        }
    }
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Core(e) => match e.kind() {
                ErrorKind::Validation => EXIT_VALIDATION_ERROR,
                ErrorKind::Conflict => EXIT_CONFLICT,
                ErrorKind::Upstream => EXIT_UPSTREAM_ERROR,
                ErrorKind::Store => EXIT_STORE_ERROR,
                ErrorKind::Execution | ErrorKind::NotFound | ErrorKind::Cancelled => EXIT_FAILURE,
            },
            CliError::Invalid(_) => EXIT_VALIDATION_ERROR,
            CliError::Failed(_) => EXIT_FAILURE,
        }
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CliError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CliError::Failed(format!("JSON serialization failed: {e}")))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Run `op` behind a spinner unless output is JSON.
pub fn with_spinner<T>(
    json: bool,
    msg: &str,
    op: impl FnOnce() -> Result<T, CoreError>,
) -> Result<T, CliError> {
    if json {
        return Ok(op()?);
    }
    let pb = spinner(msg);
    match op() {
        Ok(value) => {
            spin_ok(&pb, msg);
            Ok(value)
        }
        Err(e) => {
            spin_fail(&pb, msg);
            Err(e.into())
        }
    }
}

pub fn colorize_lifecycle(lifecycle: &str) -> String {
    use console::Style;
    match lifecycle {
        "Draft" => Style::new().yellow().apply_to(lifecycle).to_string(),
        "Proposed" => Style::new().cyan().bold().apply_to(lifecycle).to_string(),
        "Published" => Style::new().green().apply_to(lifecycle).to_string(),
        other => other.to_owned(),
    }
}

pub fn print_revision(rev: &PackageRevision, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", json_pretty(rev)?);
        return Ok(());
    }
    println!("name:        {}", rev.name);
    println!("package:     {}", rev.spec.package_name);
    println!("repository:  {}", rev.spec.repository);
    println!("revision:    {}", rev.spec.revision);
    println!(
        "lifecycle:   {}",
        colorize_lifecycle(&rev.lifecycle().to_string())
    );
    println!("version:     {}", rev.resource_version);
    println!("tasks:       {}", rev.tasks().len());
    println!("tree:        {}", rev.tree_digest);
    if let Some(lock) = rev.upstream_lock() {
        println!("upstream:    {}", lock.describe());
    }
    if let Some(parent) = &rev.spec.parent {
        println!("parent:      {}", parent.name);
    }
    if let Some(by) = &rev.status.published_by {
        println!("published:   by {by} at {}", rev.status.published_at.as_deref().unwrap_or("?"));
    }
    for record in &rev.task_records {
        for warning in &record.warnings {
            println!("warning:     {} task: {warning}", record.task_type);
        }
    }
    Ok(())
}

/// The presented version, or the current one when none was given.
pub fn version_or_current(engine: &Engine, name: &str, version: Option<u64>) -> Result<u64, CliError> {
    match version {
        Some(version) => Ok(version),
        None => Ok(engine.get(name)?.resource_version),
    }
}

pub fn default_actor() -> String {
    std::env::var("USER")
        .ok()
        .filter(|user| !user.is_empty())
        .unwrap_or_else(|| "rpkg".to_owned())
}

/// Read a directory into a package tree. Hidden entries (`.git` and the like)
/// are skipped; every file must be UTF-8.
pub fn read_tree(dir: &Path) -> Result<PackageTree, CliError> {
    if !dir.is_dir() {
        return Err(CliError::Invalid(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    let mut tree = PackageTree::new();
    let mut pending = vec![(dir.to_path_buf(), String::new())];
    while let Some((path, prefix)) = pending.pop() {
        let entries = std::fs::read_dir(&path)
            .map_err(|e| CliError::Failed(format!("failed to read {}: {e}", path.display())))?;
        for entry in entries {
            let entry = entry
                .map_err(|e| CliError::Failed(format!("failed to read {}: {e}", path.display())))?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }
            let relative = if prefix.is_empty() {
                file_name
            } else {
                format!("{prefix}/{file_name}")
            };
            let entry_path = entry.path();
            if entry_path.is_dir() {
                pending.push((entry_path, relative));
            } else {
                let contents = std::fs::read_to_string(&entry_path).map_err(|e| {
                    CliError::Failed(format!("failed to read {}: {e}", entry_path.display()))
                })?;
                tree.insert(relative, contents)
                    .map_err(|e| CliError::Invalid(e.to_string()))?;
            }
        }
    }
    Ok(tree)
}

/// Write `tree` under `dir`, which must be absent or empty.
pub fn write_tree(dir: &Path, tree: &PackageTree) -> Result<(), CliError> {
    match std::fs::read_dir(dir) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Err(CliError::Invalid(format!(
                    "{} is not empty; pull into a new or empty directory",
                    dir.display()
                )));
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(CliError::Failed(format!(
                "failed to read {}: {e}",
                dir.display()
            )))
        }
    }
    for (path, contents) in tree.iter() {
        let dest = dir.join(path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CliError::Failed(format!("failed to create {}: {e}", parent.display()))
            })?;
        }
        std::fs::write(&dest, contents)
            .map_err(|e| CliError::Failed(format!("failed to write {}: {e}", dest.display())))?;
    }
    Ok(())
}
