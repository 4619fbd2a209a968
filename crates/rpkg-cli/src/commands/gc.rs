use super::{json_pretty, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;

pub fn run(engine: &Engine, dry_run: bool, prune_cache: bool, json: bool) -> Result<u8, CliError> {
    let report = engine.gc(dry_run, prune_cache)?;
    if json {
        let payload = serde_json::json!({
            "dry_run": dry_run,
            "orphaned_cache_entries": report.orphaned_cache_entries,
            "orphaned_objects": report.orphaned_objects,
            "removed_cache_entries": report.removed_cache_entries,
            "removed_objects": report.removed_objects,
        });
        println!("{}", json_pretty(&payload)?);
    } else if dry_run {
        println!(
            "gc: would remove {} cache entries, {} objects",
            report.orphaned_cache_entries.len(),
            report.orphaned_objects.len()
        );
    } else {
        println!(
            "gc: removed {} cache entries, {} objects",
            report.removed_cache_entries, report.removed_objects
        );
    }
    Ok(EXIT_SUCCESS)
}
