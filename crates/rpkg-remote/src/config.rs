use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitCredential {
    pub username: String,
    pub token: String,
}

/// Named git credentials, referenced from `GitPackage::secret_ref`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub secrets: BTreeMap<String, GitCredential>,
}

impl Credentials {
    /// Load from `~/.config/rpkg/credentials.json`; a missing file means no credentials.
    pub fn load_default() -> Result<Self, std::io::Error> {
        match default_credentials_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid credentials file {}: {e}", path.display()),
            )
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
    }

    pub fn get(&self, name: &str) -> Option<&GitCredential> {
        self.secrets.get(name)
    }

    #[must_use]
    pub fn with_secret(mut self, name: &str, username: &str, token: &str) -> Self {
        self.secrets.insert(
            name.to_owned(),
            GitCredential {
                username: username.to_owned(),
                token: token.to_owned(),
            },
        );
        self
    }
}

fn default_credentials_path() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    Some(PathBuf::from(home).join(".config/rpkg/credentials.json"))
}
