//! The `Task` sum type and the per-variant task specs.

use crate::upstream::{PackageRevisionRef, UpstreamPackage};
use crate::{normalize_subpackage, validate_path, ValidationError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergeStrategy {
    #[default]
    ResourceMerge,
    FastForward,
    ForceDeleteReplace,
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::ResourceMerge => write!(f, "resource-merge"),
            MergeStrategy::FastForward => write!(f, "fast-forward"),
            MergeStrategy::ForceDeleteReplace => write!(f, "force-delete-replace"),
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource-merge" => Ok(MergeStrategy::ResourceMerge),
            "fast-forward" => Ok(MergeStrategy::FastForward),
            "force-delete-replace" => Ok(MergeStrategy::ForceDeleteReplace),
            other => Err(ValidationError::Invalid(format!(
                "unknown merge strategy '{other}' (expected resource-merge, fast-forward or force-delete-replace)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInitTaskSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subpackage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub site: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageCloneTaskSpec {
    #[serde(rename = "upstreamRef")]
    pub upstream: UpstreamPackage,
    #[serde(default)]
    pub strategy: MergeStrategy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUpdateTaskSpec {
    #[serde(rename = "upstreamRef")]
    pub upstream: UpstreamPackage,
    /// Overrides the strategy inherited from the most recent clone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<MergeStrategy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatchType {
    CreateFile,
    DeleteFile,
    PatchFile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchSpec {
    pub file: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub contents: String,
    pub patch_type: PatchType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackagePatchTaskSpec {
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEditTaskSpec {
    #[serde(rename = "sourceRef")]
    pub source: PackageRevisionRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,
}

/// Resource selector. Empty fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selector {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

impl Selector {
    pub fn is_empty(&self) -> bool {
        self.api_version.is_empty()
            && self.kind.is_empty()
            && self.name.is_empty()
            && self.namespace.is_empty()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "*");
        }
        let mut parts = Vec::new();
        for (key, value) in [
            ("apiVersion", &self.api_version),
            ("kind", &self.kind),
            ("name", &self.name),
            ("namespace", &self.namespace),
        ] {
            if !value.is_empty() {
                parts.push(format!("{key}={value}"));
            }
        }
        write!(f, "{}", parts.join(","))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionEvalTaskSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subpackage: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_ref: Option<FunctionRef>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config_map: BTreeMap<String, String>,
    /// Function config as an arbitrary KRM resource.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    #[serde(default)]
    pub include_meta_resources: bool,
    #[serde(default)]
    pub enable_network: bool,
    #[serde(default, rename = "match", skip_serializing_if = "Selector::is_empty")]
    pub selector: Selector,
}

impl FunctionEvalTaskSpec {
    /// Enforce the one-of rules: exactly one of `image`/`functionRef`,
    /// at most one of `configMap`/`config`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let has_image = !self.image.trim().is_empty();
        let has_ref = self.function_ref.is_some();
        match (has_image, has_ref) {
            (true, true) => {
                return Err(ValidationError::MutuallyExclusive {
                    first: "image",
                    second: "functionRef",
                })
            }
            (false, false) => return Err(ValidationError::MissingField("image or functionRef")),
            _ => {}
        }
        if let Some(function_ref) = &self.function_ref {
            if function_ref.name.trim().is_empty() {
                return Err(ValidationError::MissingField("functionRef.name"));
            }
        }
        if !self.config_map.is_empty() && self.has_config() {
            return Err(ValidationError::MutuallyExclusive {
                first: "configMap",
                second: "config",
            });
        }
        if let Some(config) = self.config.as_ref().filter(|c| !c.is_null()) {
            if !config.is_object() {
                return Err(ValidationError::Invalid(
                    "eval config must be a KRM resource object".to_owned(),
                ));
            }
        }
        normalize_subpackage(&self.subpackage)?;
        Ok(())
    }

    fn has_config(&self) -> bool {
        self.config.as_ref().is_some_and(|c| !c.is_null())
    }

    /// The function identity: its image, or the referenced function name.
    pub fn function_id(&self) -> String {
        match &self.function_ref {
            Some(function_ref) if self.image.is_empty() => function_ref.name.clone(),
            _ => self.image.clone(),
        }
    }

    /// Resolve the function config into a single KRM object.
    ///
    /// A `configMap` becomes a `v1/ConfigMap` named `function-input`; an
    /// explicit `config` is passed through; neither yields `None`.
    pub fn resolved_config(&self) -> Option<serde_json::Value> {
        if self.has_config() {
            return self.config.clone();
        }
        if self.config_map.is_empty() {
            return None;
        }
        Some(serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "function-input" },
            "data": self.config_map,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Init,
    Clone,
    Patch,
    Edit,
    Eval,
    Update,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskType::Init => write!(f, "init"),
            TaskType::Clone => write!(f, "clone"),
            TaskType::Patch => write!(f, "patch"),
            TaskType::Edit => write!(f, "edit"),
            TaskType::Eval => write!(f, "eval"),
            TaskType::Update => write!(f, "update"),
        }
    }
}

/// One recorded content-producing operation in a revision's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TaskWire", into = "TaskWire")]
pub enum Task {
    Init(PackageInitTaskSpec),
    Clone(PackageCloneTaskSpec),
    Patch(PackagePatchTaskSpec),
    Edit(PackageEditTaskSpec),
    Eval(FunctionEvalTaskSpec),
    Update(PackageUpdateTaskSpec),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TaskWire {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    init: Option<PackageInitTaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    clone: Option<PackageCloneTaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    patch: Option<PackagePatchTaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    edit: Option<PackageEditTaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    eval: Option<FunctionEvalTaskSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    update: Option<PackageUpdateTaskSpec>,
}

impl TryFrom<TaskWire> for Task {
    type Error = ValidationError;

    fn try_from(wire: TaskWire) -> Result<Self, Self::Error> {
        let populated = [
            wire.init.is_some(),
            wire.clone.is_some(),
            wire.patch.is_some(),
            wire.edit.is_some(),
            wire.eval.is_some(),
            wire.update.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if populated != 1 {
            return Err(ValidationError::VariantCount {
                union: "task",
                populated,
            });
        }

        let mismatch = |kind: &str| ValidationError::TypeMismatch {
            union: "task",
            kind: kind.to_owned(),
        };
        let task = match wire.kind.as_str() {
            "init" => Task::Init(wire.init.ok_or_else(|| mismatch("init"))?),
            "clone" => Task::Clone(wire.clone.ok_or_else(|| mismatch("clone"))?),
            "patch" => Task::Patch(wire.patch.ok_or_else(|| mismatch("patch"))?),
            "edit" => Task::Edit(wire.edit.ok_or_else(|| mismatch("edit"))?),
            "eval" => Task::Eval(wire.eval.ok_or_else(|| mismatch("eval"))?),
            "update" => Task::Update(wire.update.ok_or_else(|| mismatch("update"))?),
            other => {
                return Err(ValidationError::UnknownType {
                    union: "task",
                    kind: other.to_owned(),
                })
            }
        };
        task.validate()?;
        Ok(task)
    }
}

impl From<Task> for TaskWire {
    fn from(task: Task) -> Self {
        let kind = task.task_type().to_string();
        let mut wire = TaskWire {
            kind,
            ..Default::default()
        };
        match task {
            Task::Init(spec) => wire.init = Some(spec),
            Task::Clone(spec) => wire.clone = Some(spec),
            Task::Patch(spec) => wire.patch = Some(spec),
            Task::Edit(spec) => wire.edit = Some(spec),
            Task::Eval(spec) => wire.eval = Some(spec),
            Task::Update(spec) => wire.update = Some(spec),
        }
        wire
    }
}

impl Task {
    pub fn task_type(&self) -> TaskType {
        match self {
            Task::Init(_) => TaskType::Init,
            Task::Clone(_) => TaskType::Clone,
            Task::Patch(_) => TaskType::Patch,
            Task::Edit(_) => TaskType::Edit,
            Task::Eval(_) => TaskType::Eval,
            Task::Update(_) => TaskType::Update,
        }
    }

    /// Field-level validation of the populated variant.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Task::Init(spec) => {
                normalize_subpackage(&spec.subpackage)?;
            }
            Task::Clone(spec) => spec.upstream.validate()?,
            Task::Update(spec) => spec.upstream.validate()?,
            Task::Patch(spec) => {
                if spec.patches.is_empty() {
                    return Err(ValidationError::MissingField("patch.patches"));
                }
                for patch in &spec.patches {
                    validate_path(&patch.file)?;
                    if patch.patch_type == PatchType::PatchFile && patch.contents.is_empty() {
                        return Err(ValidationError::MissingField("patch.contents"));
                    }
                }
            }
            Task::Edit(spec) => {
                if spec.source.name.trim().is_empty() {
                    return Err(ValidationError::MissingField("edit.sourceRef.name"));
                }
            }
            Task::Eval(spec) => spec.validate()?,
        }
        Ok(())
    }

    /// The upstream a Clone or Update task fetches from.
    pub fn upstream(&self) -> Option<&UpstreamPackage> {
        match self {
            Task::Clone(spec) => Some(&spec.upstream),
            Task::Update(spec) => Some(&spec.upstream),
            _ => None,
        }
    }
}
