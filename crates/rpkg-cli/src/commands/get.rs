use super::{colorize_lifecycle, json_pretty, print_revision, CliError, EXIT_SUCCESS};
use rpkg_core::{Engine, RevisionFilter};

pub fn run(
    engine: &Engine,
    name: Option<&str>,
    filter: &RevisionFilter,
    json: bool,
) -> Result<u8, CliError> {
    if let Some(name) = name {
        let rev = engine.get(name)?;
        print_revision(&rev, json)?;
        return Ok(EXIT_SUCCESS);
    }

    let revisions = engine.list(filter)?;
    if json {
        println!("{}", json_pretty(&revisions)?);
    } else if revisions.is_empty() {
        println!("no package revisions found");
    } else {
        println!(
            "{:<54} {:<20} {:<10} {:<14} {:<10} VERSION",
            "NAME", "PACKAGE", "REVISION", "REPOSITORY", "LIFECYCLE"
        );
        for rev in &revisions {
            let lifecycle = colorize_lifecycle(&rev.lifecycle().to_string());
            println!(
                "{:<54} {:<20} {:<10} {:<14} {} {}",
                rev.name.as_str(),
                rev.spec.package_name,
                rev.spec.revision,
                rev.spec.repository,
                console::pad_str(&lifecycle, 10, console::Alignment::Left, None),
                rev.resource_version
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
