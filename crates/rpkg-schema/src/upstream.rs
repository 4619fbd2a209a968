//! Upstream package references and the pinned locks recorded after a fetch.
//!
//! On the wire both unions keep the one-of-N shape (`{"type": "git", "git": {..}}`);
//! in memory they are enums, so the "exactly one branch" invariant only has to
//! be checked once, at deserialization.

use crate::types::{RevisionName, TreeDigest};
use crate::ValidationError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitPackage {
    /// Repository address, e.g. `https://github.com/GoogleCloudPlatform/blueprints.git`.
    pub repo: String,
    /// Branch, tag or commit SHA containing the package.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Directory inside the repository holding the package.
    #[serde(default)]
    pub directory: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciPackage {
    pub image: String,
}

impl OciPackage {
    /// Image address without its tag or digest suffix.
    pub fn repository(&self) -> &str {
        image_repository(&self.image)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRevisionRef {
    pub name: RevisionName,
}

/// Image address without its tag or digest suffix.
pub fn image_repository(image: &str) -> &str {
    let without_digest = image.split_once('@').map_or(image, |(repo, _)| repo);
    // A ':' after the last '/' is a tag; one before it is a registry port.
    match (without_digest.rfind(':'), without_digest.rfind('/')) {
        (Some(colon), Some(slash)) if colon > slash => &without_digest[..colon],
        (Some(colon), None) => &without_digest[..colon],
        _ => without_digest,
    }
}

/// Where a package's content comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UpstreamPackageWire", into = "UpstreamPackageWire")]
pub enum UpstreamPackage {
    Git(GitPackage),
    Oci(OciPackage),
    Revision(PackageRevisionRef),
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpstreamPackageWire {
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<GitPackage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oci: Option<OciPackage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    upstream_ref: Option<PackageRevisionRef>,
}

impl TryFrom<UpstreamPackageWire> for UpstreamPackage {
    type Error = ValidationError;

    fn try_from(wire: UpstreamPackageWire) -> Result<Self, Self::Error> {
        let populated = usize::from(wire.git.is_some())
            + usize::from(wire.oci.is_some())
            + usize::from(wire.upstream_ref.is_some());
        if populated != 1 {
            return Err(ValidationError::VariantCount {
                union: "upstream",
                populated,
            });
        }
        let upstream = match (wire.kind.as_str(), wire.git, wire.oci, wire.upstream_ref) {
            ("git", Some(git), None, None) => UpstreamPackage::Git(git),
            ("oci", None, Some(oci), None) => UpstreamPackage::Oci(oci),
            ("", None, None, Some(reference)) => UpstreamPackage::Revision(reference),
            (kind, ..) if !matches!(kind, "" | "git" | "oci") => {
                return Err(ValidationError::UnknownType {
                    union: "upstream",
                    kind: kind.to_owned(),
                })
            }
            (kind, ..) => {
                return Err(ValidationError::TypeMismatch {
                    union: "upstream",
                    kind: kind.to_owned(),
                })
            }
        };
        upstream.validate()?;
        Ok(upstream)
    }
}

impl From<UpstreamPackage> for UpstreamPackageWire {
    fn from(upstream: UpstreamPackage) -> Self {
        match upstream {
            UpstreamPackage::Git(git) => UpstreamPackageWire {
                kind: "git".to_owned(),
                git: Some(git),
                ..Default::default()
            },
            UpstreamPackage::Oci(oci) => UpstreamPackageWire {
                kind: "oci".to_owned(),
                oci: Some(oci),
                ..Default::default()
            },
            UpstreamPackage::Revision(reference) => UpstreamPackageWire {
                upstream_ref: Some(reference),
                ..Default::default()
            },
        }
    }
}

impl UpstreamPackage {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            UpstreamPackage::Git(git) => {
                if git.repo.trim().is_empty() {
                    return Err(ValidationError::MissingField("upstream.git.repo"));
                }
                if git.git_ref.trim().is_empty() {
                    return Err(ValidationError::MissingField("upstream.git.ref"));
                }
            }
            UpstreamPackage::Oci(oci) => {
                if oci.image.trim().is_empty() {
                    return Err(ValidationError::MissingField("upstream.oci.image"));
                }
            }
            UpstreamPackage::Revision(reference) => {
                if reference.name.trim().is_empty() {
                    return Err(ValidationError::MissingField("upstream.upstreamRef.name"));
                }
            }
        }
        Ok(())
    }

    pub fn origin_type(&self) -> OriginType {
        match self {
            UpstreamPackage::Git(_) => OriginType::Git,
            UpstreamPackage::Oci(_) => OriginType::Oci,
            UpstreamPackage::Revision(_) => OriginType::Revision,
        }
    }

    /// Short human-readable form used in logs and error messages.
    pub fn describe(&self) -> String {
        match self {
            UpstreamPackage::Git(git) => {
                format!("git {}@{} ({})", git.repo, git.git_ref, display_dir(&git.directory))
            }
            UpstreamPackage::Oci(oci) => format!("oci {}", oci.image),
            UpstreamPackage::Revision(reference) => format!("revision {}", reference.name),
        }
    }
}

fn display_dir(directory: &str) -> &str {
    if directory.is_empty() {
        "/"
    } else {
        directory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OriginType {
    Git,
    Oci,
    Revision,
}

impl std::fmt::Display for OriginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OriginType::Git => write!(f, "git"),
            OriginType::Oci => write!(f, "oci"),
            OriginType::Revision => write!(f, "revision"),
        }
    }
}

/// Resolved locator for a git fetch. `git_ref` holds the commit, never a branch name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitLock {
    pub repo: String,
    #[serde(default)]
    pub directory: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub commit: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciLock {
    pub image: String,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionLock {
    pub name: RevisionName,
    pub digest: TreeDigest,
}

/// Pinned, reproducible locator for the exact upstream content that was fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "UpstreamLockWire", into = "UpstreamLockWire")]
pub enum UpstreamLock {
    Git(GitLock),
    Oci(OciLock),
    Revision(RevisionLock),
}

#[derive(Debug, Serialize, Deserialize)]
struct UpstreamLockWire {
    #[serde(rename = "type")]
    kind: OriginType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    git: Option<GitLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    oci: Option<OciLock>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    revision: Option<RevisionLock>,
}

impl TryFrom<UpstreamLockWire> for UpstreamLock {
    type Error = ValidationError;

    fn try_from(wire: UpstreamLockWire) -> Result<Self, Self::Error> {
        let populated = usize::from(wire.git.is_some())
            + usize::from(wire.oci.is_some())
            + usize::from(wire.revision.is_some());
        if populated != 1 {
            return Err(ValidationError::VariantCount {
                union: "upstreamLock",
                populated,
            });
        }
        match (wire.kind, wire.git, wire.oci, wire.revision) {
            (OriginType::Git, Some(git), None, None) => Ok(UpstreamLock::Git(git)),
            (OriginType::Oci, None, Some(oci), None) => Ok(UpstreamLock::Oci(oci)),
            (OriginType::Revision, None, None, Some(rev)) => Ok(UpstreamLock::Revision(rev)),
            (kind, ..) => Err(ValidationError::TypeMismatch {
                union: "upstreamLock",
                kind: kind.to_string(),
            }),
        }
    }
}

impl From<UpstreamLock> for UpstreamLockWire {
    fn from(lock: UpstreamLock) -> Self {
        let kind = lock.origin_type();
        let (git, oci, revision) = match lock {
            UpstreamLock::Git(git) => (Some(git), None, None),
            UpstreamLock::Oci(oci) => (None, Some(oci), None),
            UpstreamLock::Revision(rev) => (None, None, Some(rev)),
        };
        UpstreamLockWire {
            kind,
            git,
            oci,
            revision,
        }
    }
}

impl UpstreamLock {
    pub fn origin_type(&self) -> OriginType {
        match self {
            UpstreamLock::Git(_) => OriginType::Git,
            UpstreamLock::Oci(_) => OriginType::Oci,
            UpstreamLock::Revision(_) => OriginType::Revision,
        }
    }

    /// Stable key for this lock, used to index fetched content.
    ///
    /// Derived from pinned fields only, so two locks for the same commit or
    /// digest share a key no matter which ref name was requested.
    pub fn cache_key(&self) -> String {
        let input = match self {
            UpstreamLock::Git(git) => {
                format!("git:{}:{}:{}", git.repo, normalize_dir(&git.directory), git.commit)
            }
            UpstreamLock::Oci(oci) => format!("oci:{}:{}", image_repository(&oci.image), oci.digest),
            UpstreamLock::Revision(rev) => format!("revision:{}:{}", rev.name, rev.digest),
        };
        blake3::hash(input.as_bytes()).to_hex().to_string()
    }

    /// Whether `upstream` points at the same source this lock was taken from,
    /// ignoring which ref or tag is requested.
    pub fn same_source(&self, upstream: &UpstreamPackage) -> bool {
        match (self, upstream) {
            (UpstreamLock::Git(lock), UpstreamPackage::Git(git)) => {
                lock.repo == git.repo
                    && normalize_dir(&lock.directory) == normalize_dir(&git.directory)
            }
            (UpstreamLock::Oci(lock), UpstreamPackage::Oci(oci)) => {
                image_repository(&lock.image) == oci.repository()
            }
            (UpstreamLock::Revision(_), UpstreamPackage::Revision(_)) => true,
            _ => false,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            UpstreamLock::Git(git) => format!(
                "git {}@{} ({})",
                git.repo,
                short(&git.commit),
                display_dir(&git.directory)
            ),
            UpstreamLock::Oci(oci) => format!("oci {}@{}", oci.image, short(&oci.digest)),
            UpstreamLock::Revision(rev) => format!("revision {}@{}", rev.name, short(&rev.digest)),
        }
    }
}

fn short(value: &str) -> &str {
    &value[..12.min(value.len())]
}

/// Normalize a repository sub-directory: no leading/trailing slashes, `/` → "".
pub fn normalize_dir(directory: &str) -> &str {
    directory.trim_matches('/')
}

/// Interpret a clone source string the way `rpkg clone` accepts it.
///
/// * `oci://registry/repo:tag` → OCI image
/// * `https://…`, `http://…`, `git@…` or anything ending in `.git` → git
///   repository (`git_ref` defaults to `main`, `directory` to the root)
/// * anything else → the name of an existing package revision
pub fn parse_clone_source(
    source: &str,
    directory: Option<&str>,
    git_ref: Option<&str>,
) -> Result<UpstreamPackage, ValidationError> {
    let source = source.trim();
    if source.is_empty() {
        return Err(ValidationError::MissingField("source"));
    }

    let upstream = if let Some(image) = source.strip_prefix("oci://") {
        UpstreamPackage::Oci(OciPackage {
            image: image.to_owned(),
        })
    } else if source.starts_with("https://")
        || source.starts_with("http://")
        || source.starts_with("git@")
        || source.ends_with(".git")
    {
        UpstreamPackage::Git(GitPackage {
            repo: source.to_owned(),
            git_ref: git_ref.unwrap_or("main").to_owned(),
            directory: directory.unwrap_or("/").to_owned(),
            secret_ref: None,
        })
    } else {
        if directory.is_some() || git_ref.is_some() {
            return Err(ValidationError::Invalid(format!(
                "--directory and --ref only apply to git or oci sources, not revision '{source}'"
            )));
        }
        UpstreamPackage::Revision(PackageRevisionRef {
            name: RevisionName::new(source),
        })
    };
    upstream.validate()?;
    Ok(upstream)
}
