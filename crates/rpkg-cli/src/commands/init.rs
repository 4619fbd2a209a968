use super::{print_revision, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;
use rpkg_schema::{PackageInitTaskSpec, RevisionKey};

pub fn run(
    engine: &Engine,
    key: &RevisionKey,
    spec: PackageInitTaskSpec,
    json: bool,
) -> Result<u8, CliError> {
    let rev = engine.init(key, spec)?;
    if json {
        print_revision(&rev, true)?;
    } else {
        println!("created {} ({key})", rev.name);
    }
    Ok(EXIT_SUCCESS)
}
