use super::{print_revision, version_or_current, with_spinner, CliError, EXIT_SUCCESS};
use rpkg_core::Engine;
use rpkg_schema::{FunctionEvalTaskSpec, FunctionRef, Selector, Task};
use std::collections::BTreeMap;

/// Parse `key=value` function config arguments.
pub fn parse_config(pairs: &[String]) -> Result<BTreeMap<String, String>, CliError> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, value)| (key.to_owned(), value.to_owned()))
                .ok_or_else(|| CliError::Invalid(format!("config '{pair}' is not key=value")))
        })
        .collect()
}

pub struct EvalArgs {
    pub image: Option<String>,
    pub function: Option<String>,
    pub subpackage: String,
    pub config: Vec<String>,
    pub selector: Selector,
    pub include_meta_resources: bool,
    pub enable_network: bool,
}

pub fn run(
    engine: &Engine,
    name: &str,
    args: EvalArgs,
    version: Option<u64>,
    json: bool,
) -> Result<u8, CliError> {
    let spec = FunctionEvalTaskSpec {
        subpackage: args.subpackage,
        image: args.image.unwrap_or_default(),
        function_ref: args.function.map(|name| FunctionRef { name }),
        config_map: parse_config(&args.config)?,
        config: None,
        include_meta_resources: args.include_meta_resources,
        enable_network: args.enable_network,
        selector: args.selector,
    };
    let msg = format!("evaluating {}", spec.function_id());
    let version = version_or_current(engine, name, version)?;
    let rev = with_spinner(json, &msg, || {
        engine.append_task(name, Task::Eval(spec), version)
    })?;
    if json {
        print_revision(&rev, true)?;
        return Ok(EXIT_SUCCESS);
    }
    if let Some(call) = rev.task_records.last().and_then(|r| r.function.as_ref()) {
        println!(
            "{}: {} resource(s) selected, tree {}",
            call.function, call.selected, rev.tree_digest
        );
    }
    if let Some(record) = rev.task_records.last() {
        for warning in &record.warnings {
            println!("warning: {warning}");
        }
    }
    Ok(EXIT_SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_pairs_split_on_first_equals() {
        let parsed = parse_config(&["namespace=prod".to_owned(), "expr=a=b".to_owned()]).unwrap();
        assert_eq!(parsed.get("namespace").map(String::as_str), Some("prod"));
        assert_eq!(parsed.get("expr").map(String::as_str), Some("a=b"));
    }

    #[test]
    fn config_without_key_is_invalid() {
        assert!(parse_config(&["=prod".to_owned()]).is_err());
        assert!(parse_config(&["prod".to_owned()]).is_err());
    }
}
