use super::{print_revision, read_tree, version_or_current, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;
use std::path::Path;

pub fn run(
    engine: &Engine,
    name: &str,
    dir: &Path,
    version: Option<u64>,
    json: bool,
) -> Result<u8, CliError> {
    let tree = read_tree(dir)?;
    let version = version_or_current(engine, name, version)?;
    let rev = engine.push(name, &tree, version)?;
    if json {
        print_revision(&rev, true)?;
    } else if rev.resource_version == version {
        println!("{name}: no changes");
    } else {
        println!(
            "pushed {} file(s) to {name} (version {})",
            tree.len(),
            rev.resource_version
        );
    }
    Ok(EXIT_SUCCESS)
}
