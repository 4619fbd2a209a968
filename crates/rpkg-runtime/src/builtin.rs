//! In-process implementations of the metadata-mutating catalog functions.
//!
//! Functions are matched by the last path segment of the image with tag or
//! digest removed, so `gcr.io/kpt-fn/set-namespace:v0.4.1` and a plain
//! `set-namespace` function reference resolve to the same builtin.

use crate::runner::{FunctionRequest, FunctionResponse, FunctionRunner};
use crate::{ExecutionCause, ExecutionError};
use rpkg_schema::Resource;
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use tracing::debug;

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PersistentVolume",
    "PriorityClass",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    SetNamespace,
    SetLabels,
    SetAnnotations,
}

impl Builtin {
    fn lookup(function: &str) -> Option<Self> {
        match function_basename(function) {
            "set-namespace" => Some(Self::SetNamespace),
            "set-labels" => Some(Self::SetLabels),
            "set-annotations" => Some(Self::SetAnnotations),
            _ => None,
        }
    }
}

/// `gcr.io/kpt-fn/set-labels:v0.2` -> `set-labels`.
pub fn function_basename(function: &str) -> &str {
    let without_digest = function.split('@').next().unwrap_or(function);
    let last = without_digest.rsplit('/').next().unwrap_or(without_digest);
    last.split(':').next().unwrap_or(last)
}

#[derive(Debug, Default)]
pub struct BuiltinRunner;

impl BuiltinRunner {
    pub fn new() -> Self {
        Self
    }
}

impl FunctionRunner for BuiltinRunner {
    fn name(&self) -> &'static str {
        "builtin"
    }

    fn available(&self, function: &str) -> bool {
        Builtin::lookup(function).is_some()
    }

    fn run(&self, request: &FunctionRequest) -> Result<FunctionResponse, ExecutionError> {
        let Some(builtin) = Builtin::lookup(&request.function) else {
            return Err(ExecutionError::new(
                request,
                ExecutionCause::Sandbox(format!(
                    "function image '{}' is not available",
                    request.function
                )),
            ));
        };
        let fail = |stderr: String| {
            ExecutionError::new(request, ExecutionCause::NonZeroExit { code: 1, stderr })
        };

        let mut items = request.items.clone();
        let message = match builtin {
            Builtin::SetNamespace => {
                let data = config_data(request.config.as_ref(), "namespace").map_err(fail)?;
                let namespace = data
                    .get("namespace")
                    .filter(|ns| !ns.is_empty())
                    .ok_or_else(|| fail("config is missing 'namespace'".to_owned()))?;
                let mut changed = 0;
                for item in &mut items {
                    if set_namespace(item, namespace).map_err(fail)? {
                        changed += 1;
                    }
                }
                format!("namespace '{namespace}' set on {changed} resource(s)")
            }
            Builtin::SetLabels | Builtin::SetAnnotations => {
                let field = if builtin == Builtin::SetLabels {
                    "labels"
                } else {
                    "annotations"
                };
                let data = config_data(request.config.as_ref(), field).map_err(fail)?;
                if data.is_empty() {
                    return Err(fail(format!("config has no {field} to set")));
                }
                for item in &mut items {
                    merge_metadata_map(item, field, &data).map_err(fail)?;
                }
                format!("{} {field} set on {} resource(s)", data.len(), items.len())
            }
        };
        debug!("builtin {}: {message}", request.function);

        Ok(FunctionResponse {
            items,
            results: vec![message],
        })
    }
}

/// Read the string map a function is configured with: a ConfigMap's `data`,
/// or the typed field (`namespace`, `labels`, `annotations`) of a
/// function-specific config object.
fn config_data(
    config: Option<&Value>,
    typed_field: &str,
) -> Result<BTreeMap<String, String>, String> {
    let Some(config) = config else {
        return Err("function requires config".to_owned());
    };
    let mut out = BTreeMap::new();
    if let Some(data) = config.get("data") {
        collect_strings(data, "data", &mut out)?;
    }
    match config.get(typed_field) {
        Some(Value::String(s)) => {
            out.insert(typed_field.to_owned(), s.clone());
        }
        Some(value @ Value::Mapping(_)) => collect_strings(value, typed_field, &mut out)?,
        Some(_) => return Err(format!("config field '{typed_field}' has an unsupported type")),
        None => {}
    }
    Ok(out)
}

fn collect_strings(
    value: &Value,
    what: &str,
    out: &mut BTreeMap<String, String>,
) -> Result<(), String> {
    let Some(map) = value.as_mapping() else {
        return Err(format!("config '{what}' must be a mapping"));
    };
    for (key, value) in map {
        let key = key
            .as_str()
            .ok_or_else(|| format!("config '{what}' has a non-string key"))?;
        let value = match value {
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            _ => return Err(format!("config '{what}.{key}' must be a scalar")),
        };
        out.insert(key.to_owned(), value);
    }
    Ok(())
}

fn metadata_mut(item: &mut Resource) -> Result<&mut Mapping, String> {
    let location = format!("{}[{}]", item.path, item.index);
    let root = item
        .value
        .as_mapping_mut()
        .ok_or_else(|| format!("{location}: resource is not a mapping"))?;
    child_mapping(root, "metadata").ok_or_else(|| format!("{location}: metadata is not a mapping"))
}

fn child_mapping<'a>(map: &'a mut Mapping, key: &str) -> Option<&'a mut Mapping> {
    let entry = map
        .entry(Value::from(key))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if entry.is_null() {
        *entry = Value::Mapping(Mapping::new());
    }
    entry.as_mapping_mut()
}

/// Returns whether the resource was touched. Cluster-scoped resources are
/// skipped; a `Namespace` resource is renamed instead.
fn set_namespace(item: &mut Resource, namespace: &str) -> Result<bool, String> {
    let kind = item.kind().to_owned();
    if kind == "Namespace" {
        metadata_mut(item)?.insert(Value::from("name"), Value::from(namespace));
        return Ok(true);
    }
    if CLUSTER_SCOPED_KINDS.contains(&kind.as_str()) {
        return Ok(false);
    }
    metadata_mut(item)?.insert(Value::from("namespace"), Value::from(namespace));
    Ok(true)
}

fn merge_metadata_map(
    item: &mut Resource,
    field: &str,
    data: &BTreeMap<String, String>,
) -> Result<(), String> {
    let location = format!("{}[{}]", item.path, item.index);
    let metadata = metadata_mut(item)?;
    let target = child_mapping(metadata, field)
        .ok_or_else(|| format!("{location}: metadata.{field} is not a mapping"))?;
    for (key, value) in data {
        target.insert(Value::from(key.as_str()), Value::from(value.as_str()));
    }
    Ok(())
}
