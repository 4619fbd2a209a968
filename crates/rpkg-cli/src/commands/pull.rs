use super::{json_pretty, write_tree, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;
use std::collections::BTreeMap;
use std::path::Path;

pub fn run(engine: &Engine, name: &str, dir: Option<&Path>, json: bool) -> Result<u8, CliError> {
    let tree = engine.pull(name)?;
    if let Some(dir) = dir {
        write_tree(dir, &tree)?;
        if !json {
            println!("wrote {} file(s) to {}", tree.len(), dir.display());
            return Ok(EXIT_SUCCESS);
        }
    }
    if json {
        let files: BTreeMap<&str, &str> = tree.iter().collect();
        println!("{}", json_pretty(&files)?);
    } else {
        for (path, contents) in tree.iter() {
            println!("--- {path}");
            print!("{contents}");
            if !contents.ends_with('\n') {
                println!();
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
