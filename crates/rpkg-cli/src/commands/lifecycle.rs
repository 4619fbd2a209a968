use super::{colorize_lifecycle, print_revision, version_or_current, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Propose,
    Approve,
    Reject,
}

pub fn run(
    engine: &Engine,
    transition: Transition,
    name: &str,
    version: Option<u64>,
    actor: &str,
    json: bool,
) -> Result<u8, CliError> {
    let version = version_or_current(engine, name, version)?;
    let rev = match transition {
        Transition::Propose => engine.propose(name, version, actor)?,
        Transition::Approve => engine.approve(name, version, actor)?,
        Transition::Reject => engine.reject(name, version, actor)?,
    };
    if json {
        print_revision(&rev, true)?;
    } else {
        println!(
            "{name} is now {}",
            colorize_lifecycle(&rev.lifecycle().to_string())
        );
    }
    Ok(EXIT_SUCCESS)
}
