use super::{print_revision, with_spinner, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;
use rpkg_schema::{parse_clone_source, MergeStrategy, RevisionKey, SecretRef, UpstreamPackage};

pub struct CloneSource<'a> {
    pub source: &'a str,
    pub directory: Option<&'a str>,
    pub git_ref: Option<&'a str>,
    pub secret: Option<&'a str>,
}

/// Parse a clone source as given on the command line.
pub fn upstream(source: &CloneSource<'_>) -> Result<UpstreamPackage, CliError> {
    let mut upstream = parse_clone_source(source.source, source.directory, source.git_ref)
        .map_err(|e| CliError::Invalid(e.to_string()))?;
    if let Some(secret) = source.secret {
        match &mut upstream {
            UpstreamPackage::Git(git) => {
                git.secret_ref = Some(SecretRef {
                    name: secret.to_owned(),
                });
            }
            _ => {
                return Err(CliError::Invalid(
                    "--secret only applies to git sources".to_owned(),
                ))
            }
        }
    }
    Ok(upstream)
}

pub fn run(
    engine: &Engine,
    source: &CloneSource<'_>,
    key: &RevisionKey,
    strategy: MergeStrategy,
    json: bool,
) -> Result<u8, CliError> {
    let upstream = upstream(source)?;
    let msg = format!("cloning {}", upstream.describe());
    let rev = with_spinner(json, &msg, || engine.clone_package(key, upstream, strategy))?;
    if json {
        print_revision(&rev, true)?;
    } else {
        println!("created {} ({key})", rev.name);
        if let Some(lock) = rev.upstream_lock() {
            println!("upstream lock: {}", lock.describe());
        }
    }
    Ok(EXIT_SUCCESS)
}
