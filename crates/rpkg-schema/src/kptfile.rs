use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const KPTFILE: &str = "Kptfile";
pub const KPTFILE_API_VERSION: &str = "kpt.dev/v1";
pub const LOCAL_CONFIG_ANNOTATION: &str = "config.kubernetes.io/local-config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KptfileMetadata {
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KptfileInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

/// Package metadata file written at the root of every (sub)package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kptfile {
    pub api_version: String,
    pub kind: String,
    pub metadata: KptfileMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<KptfileInfo>,
}

impl Kptfile {
    pub fn new(name: &str, description: &str, keywords: &[String], site: &str) -> Self {
        let info = KptfileInfo {
            site: non_empty(site),
            description: non_empty(description),
            keywords: keywords.to_vec(),
        };
        let info = (info != KptfileInfo::default()).then_some(info);
        Kptfile {
            api_version: KPTFILE_API_VERSION.to_owned(),
            kind: KPTFILE.to_owned(),
            metadata: KptfileMetadata {
                name: name.to_owned(),
                annotations: BTreeMap::from([(
                    LOCAL_CONFIG_ANNOTATION.to_owned(),
                    "true".to_owned(),
                )]),
            },
            info,
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_owned())
}

/// README scaffolded next to a new Kptfile.
pub fn readme(name: &str, description: &str) -> String {
    let description = if description.trim().is_empty() {
        "sample description"
    } else {
        description.trim()
    };
    format!(
        "# {name}\n\n\
         ## Description\n{description}\n\n\
         ## Usage\n\n\
         ### Fetch the package\n`rpkg clone <source> {name} --repository <repo> --revision <rev>`\n\n\
         ### View package content\n`rpkg pull <revision-name>`\n"
    )
}
