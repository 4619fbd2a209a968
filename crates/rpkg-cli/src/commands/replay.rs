use super::{json_pretty, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;

pub fn run(engine: &Engine, name: &str, json: bool) -> Result<u8, CliError> {
    let report = engine.replay(name)?;
    if json {
        let payload = serde_json::json!({
            "name": report.name,
            "tasks": report.tasks,
            "tree_digest": report.tree_digest,
            "files": report.files,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!(
            "{name}: {} task(s) re-derived, {} file(s), tree {}",
            report.tasks, report.files, report.tree_digest
        );
    }
    Ok(EXIT_SUCCESS)
}
