use super::{CliError, EXIT_SUCCESS};
use rpkg_core::Engine;

pub fn run(engine: &Engine, name: &str, version: Option<u64>, json: bool) -> Result<u8, CliError> {
    engine.delete(name, version)?;
    if json {
        println!("{}", serde_json::json!({ "deleted": name }));
    } else {
        println!("deleted {name}");
    }
    Ok(EXIT_SUCCESS)
}
