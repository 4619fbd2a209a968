use super::{print_revision, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;
use rpkg_schema::RevisionKey;

pub fn run(engine: &Engine, source: &str, key: &RevisionKey, json: bool) -> Result<u8, CliError> {
    let rev = engine.copy(source, key)?;
    if json {
        print_revision(&rev, true)?;
    } else {
        println!("created {} ({key}) from {source}", rev.name);
    }
    Ok(EXIT_SUCCESS)
}
