use super::clone::{upstream, CloneSource};
use super::{print_revision, version_or_current, with_spinner, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;
use rpkg_schema::{MergeStrategy, PackageRevision, SecretRef, Task, UpstreamPackage};

/// Where an update fetches from, as given on the command line.
///
/// Without `source`, the other fields adjust the upstream the revision
/// already tracks.
#[derive(Debug, Default)]
pub struct UpdateSource<'a> {
    pub source: Option<&'a str>,
    pub directory: Option<&'a str>,
    pub git_ref: Option<&'a str>,
    pub secret: Option<&'a str>,
}

impl UpdateSource<'_> {
    fn has_overrides(&self) -> bool {
        self.directory.is_some() || self.git_ref.is_some() || self.secret.is_some()
    }
}

/// Resolve the upstream to pass to the engine, if any.
fn resolve(
    rev: &PackageRevision,
    source: &UpdateSource<'_>,
) -> Result<Option<UpstreamPackage>, CliError> {
    if let Some(source_ref) = source.source {
        return upstream(&CloneSource {
            source: source_ref,
            directory: source.directory,
            git_ref: source.git_ref,
            secret: source.secret,
        })
        .map(Some);
    }
    if !source.has_overrides() {
        return Ok(None);
    }

    let current = rev
        .tasks()
        .iter()
        .rev()
        .find_map(Task::upstream)
        .ok_or_else(|| {
            CliError::Invalid(format!("{} was not cloned from an upstream", rev.name))
        })?;
    let UpstreamPackage::Git(git) = current else {
        return Err(CliError::Invalid(format!(
            "--ref, --directory and --secret need --upstream when tracking {}",
            current.describe()
        )));
    };
    let mut git = git.clone();
    if let Some(git_ref) = source.git_ref {
        git_ref.clone_into(&mut git.git_ref);
    }
    if let Some(directory) = source.directory {
        directory.clone_into(&mut git.directory);
    }
    if let Some(secret) = source.secret {
        git.secret_ref = Some(SecretRef {
            name: secret.to_owned(),
        });
    }
    Ok(Some(UpstreamPackage::Git(git)))
}

pub fn run(
    engine: &Engine,
    name: &str,
    source: &UpdateSource<'_>,
    strategy: Option<MergeStrategy>,
    version: Option<u64>,
    json: bool,
) -> Result<u8, CliError> {
    let upstream = if source.source.is_some() || source.has_overrides() {
        resolve(&engine.get(name)?, source)?
    } else {
        None
    };
    let version = version_or_current(engine, name, version)?;
    let rev = with_spinner(json, &format!("updating {name}"), || {
        engine.update(name, upstream, strategy, version)
    })?;
    if json {
        print_revision(&rev, true)?;
        return Ok(EXIT_SUCCESS);
    }
    if let Some(lock) = rev.upstream_lock() {
        println!("{name} updated to {}", lock.describe());
    }
    if let Some(record) = rev.task_records.last() {
        for note in &record.warnings {
            println!("note: {note}");
        }
    }
    Ok(EXIT_SUCCESS)
}
