//! KRM resources parsed out of multi-document YAML files.

use crate::kptfile::{KPTFILE, LOCAL_CONFIG_ANNOTATION};
use serde::Deserialize;
use serde_yaml::Value;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("{path}: invalid YAML: {source}")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: document {index} is not a mapping")]
    NotAMapping { path: String, index: usize },
    #[error("{path}: document {index} has no '{field}'")]
    MissingField {
        path: String,
        index: usize,
        field: &'static str,
    },
    #[error("failed to render resources: {0}")]
    Render(#[source] serde_yaml::Error),
}

/// Identity of a resource within a package.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{} ({})", self.kind, self.name, self.api_version)
        } else {
            write!(
                f,
                "{}/{}/{} ({})",
                self.kind, self.namespace, self.name, self.api_version
            )
        }
    }
}

/// A single YAML document from a package file.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    /// Package-relative path of the file holding the document.
    pub path: String,
    /// Position of the document within its file.
    pub index: usize,
    pub value: Value,
}

impl Resource {
    fn str_at(&self, keys: &[&str]) -> &str {
        let mut current = &self.value;
        for key in keys {
            match current.get(*key) {
                Some(next) => current = next,
                None => return "",
            }
        }
        current.as_str().unwrap_or("")
    }

    pub fn api_version(&self) -> &str {
        self.str_at(&["apiVersion"])
    }

    pub fn kind(&self) -> &str {
        self.str_at(&["kind"])
    }

    pub fn name(&self) -> &str {
        self.str_at(&["metadata", "name"])
    }

    pub fn namespace(&self) -> &str {
        self.str_at(&["metadata", "namespace"])
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.value
            .get("metadata")?
            .get("annotations")?
            .get(key)?
            .as_str()
    }

    pub fn id(&self) -> ResourceId {
        ResourceId {
            api_version: self.api_version().to_owned(),
            kind: self.kind().to_owned(),
            namespace: self.namespace().to_owned(),
            name: self.name().to_owned(),
        }
    }

    /// Meta resources describe the package rather than the workload:
    /// the `Kptfile` and anything annotated as local config.
    pub fn is_meta(&self) -> bool {
        self.kind() == KPTFILE || self.annotation(LOCAL_CONFIG_ANNOTATION) == Some("true")
    }
}

pub fn is_manifest_path(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    file == KPTFILE
        || std::path::Path::new(file)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
}

/// Parse every document of a YAML file into resources.
///
/// Empty documents are skipped. Every other document must be a mapping with
/// `apiVersion` and `kind`.
pub fn parse_manifests(path: &str, contents: &str) -> Result<Vec<Resource>, ResourceError> {
    let mut resources = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(contents).enumerate() {
        let value = Value::deserialize(document).map_err(|source| ResourceError::Yaml {
            path: path.to_owned(),
            source,
        })?;
        if value.is_null() {
            continue;
        }
        if !value.is_mapping() {
            return Err(ResourceError::NotAMapping {
                path: path.to_owned(),
                index,
            });
        }
        for field in ["apiVersion", "kind"] {
            if value.get(field).and_then(Value::as_str).is_none() {
                return Err(ResourceError::MissingField {
                    path: path.to_owned(),
                    index,
                    field,
                });
            }
        }
        resources.push(Resource {
            path: path.to_owned(),
            index,
            value,
        });
    }
    Ok(resources)
}

/// Render documents back into a single multi-document YAML file.
pub fn render_manifests<'a>(
    values: impl IntoIterator<Item = &'a Value>,
) -> Result<String, ResourceError> {
    let mut out = String::new();
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(value).map_err(ResourceError::Render)?);
    }
    Ok(out)
}
