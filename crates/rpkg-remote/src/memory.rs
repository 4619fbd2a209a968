//! In-memory upstream fetcher with movable refs and failure injection.

use crate::{Fetched, UpstreamError, UpstreamFetcher};
use rpkg_schema::{
    image_repository, normalize_dir, GitLock, OciLock, PackageTree, UpstreamLock, UpstreamPackage,
};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct GitRepo {
    refs: BTreeMap<String, String>,
    commits: BTreeMap<String, PackageTree>,
    secret: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    git: BTreeMap<String, GitRepo>,
    /// image repository → tag → digest
    oci_tags: BTreeMap<String, BTreeMap<String, String>>,
    oci_blobs: BTreeMap<String, PackageTree>,
    failures: VecDeque<UpstreamError>,
    fetches: usize,
    delay: Option<Duration>,
}

/// Serves git repositories and OCI images from memory.
///
/// Refs and tags can be moved between fetches to simulate a changing
/// upstream; queued failures are returned before any real lookup.
#[derive(Debug, Default)]
pub struct MemoryFetcher {
    state: Mutex<State>,
}

impl MemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Commit `tree` to `repo` and point `git_ref` at it. Returns the commit SHA.
    pub fn publish_git(&self, repo: &str, git_ref: &str, tree: PackageTree) -> String {
        let mut state = self.state();
        let entry = state.git.entry(repo.to_owned()).or_default();
        let parent = entry.refs.get(git_ref).cloned().unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(repo.as_bytes());
        hasher.update(parent.as_bytes());
        hasher.update(tree.digest().as_bytes());
        let commit = hasher.finalize().to_hex()[..40].to_owned();
        entry.commits.insert(commit.clone(), tree);
        entry.refs.insert(git_ref.to_owned(), commit.clone());
        commit
    }

    /// Require `secret` on every fetch from `repo`.
    pub fn protect_git(&self, repo: &str, secret: &str) {
        self.state().git.entry(repo.to_owned()).or_default().secret = Some(secret.to_owned());
    }

    /// Push `tree` as `image` (`repo:tag`). Returns the content digest.
    pub fn publish_oci(&self, image: &str, tree: PackageTree) -> String {
        let digest = format!("sha256:{}", tree.digest());
        let (repo, tag) = split_tag(image);
        let mut state = self.state();
        state
            .oci_tags
            .entry(repo.to_owned())
            .or_default()
            .insert(tag.to_owned(), digest.clone());
        state.oci_blobs.insert(digest.clone(), tree);
        digest
    }

    /// Queue an error returned by the next fetch.
    pub fn fail_next(&self, error: UpstreamError) {
        self.state().failures.push_back(error);
    }

    pub fn fail_next_n(&self, error: &UpstreamError, n: usize) {
        let mut state = self.state();
        for _ in 0..n {
            state.failures.push_back(error.clone());
        }
    }

    /// Sleep this long inside every fetch.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Number of fetch calls made so far, failed ones included.
    pub fn fetch_count(&self) -> usize {
        self.state().fetches
    }

    fn begin(&self) -> Result<(), UpstreamError> {
        let delay = {
            let mut state = self.state();
            state.fetches += 1;
            if let Some(error) = state.failures.pop_front() {
                return Err(error);
            }
            state.delay
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }
}

fn split_tag(image: &str) -> (&str, &str) {
    let repo = image_repository(image);
    let rest = &image[repo.len()..];
    let tag = rest
        .strip_prefix(':')
        .or_else(|| rest.strip_prefix('@'))
        .unwrap_or("latest");
    (repo, tag)
}

fn git_subtree(tree: &PackageTree, directory: &str, what: &str) -> Result<PackageTree, UpstreamError> {
    let directory = normalize_dir(directory);
    let sub = tree.subtree(directory);
    if sub.is_empty() && !directory.is_empty() {
        return Err(UpstreamError::NotFound(format!("directory '{directory}' in {what}")));
    }
    Ok(sub)
}

impl UpstreamFetcher for MemoryFetcher {
    fn fetch(&self, upstream: &UpstreamPackage) -> Result<Fetched, UpstreamError> {
        self.begin()?;
        let state = self.state();
        match upstream {
            UpstreamPackage::Git(git) => {
                let repo = state
                    .git
                    .get(&git.repo)
                    .ok_or_else(|| UpstreamError::NotFound(format!("repository {}", git.repo)))?;
                if let Some(required) = &repo.secret {
                    let presented = git.secret_ref.as_ref().map(|s| s.name.as_str());
                    if presented != Some(required.as_str()) {
                        return Err(UpstreamError::AuthFailed(format!(
                            "repository {} requires credentials",
                            git.repo
                        )));
                    }
                }
                let commit = match repo.refs.get(&git.git_ref) {
                    Some(commit) => commit.clone(),
                    None if repo.commits.contains_key(&git.git_ref) => git.git_ref.clone(),
                    None => {
                        return Err(UpstreamError::NotFound(format!(
                            "ref {} in {}",
                            git.git_ref, git.repo
                        )))
                    }
                };
                let full = repo.commits.get(&commit).ok_or_else(|| {
                    UpstreamError::NotFound(format!("commit {commit} in {}", git.repo))
                })?;
                let tree = git_subtree(full, &git.directory, &git.repo)?;
                Ok(Fetched {
                    tree,
                    lock: UpstreamLock::Git(GitLock {
                        repo: git.repo.clone(),
                        directory: git.directory.clone(),
                        git_ref: commit.clone(),
                        commit,
                    }),
                })
            }
            UpstreamPackage::Oci(oci) => {
                let (repo, tag) = split_tag(&oci.image);
                let digest = if tag.starts_with("sha256:") {
                    tag.to_owned()
                } else {
                    state
                        .oci_tags
                        .get(repo)
                        .and_then(|tags| tags.get(tag))
                        .cloned()
                        .ok_or_else(|| UpstreamError::NotFound(format!("image {}", oci.image)))?
                };
                let tree = state
                    .oci_blobs
                    .get(&digest)
                    .cloned()
                    .ok_or_else(|| UpstreamError::NotFound(format!("image {}", oci.image)))?;
                Ok(Fetched {
                    tree,
                    lock: UpstreamLock::Oci(OciLock {
                        image: oci.image.clone(),
                        digest,
                    }),
                })
            }
            UpstreamPackage::Revision(reference) => Err(UpstreamError::InvalidReference(format!(
                "revision {} is not served by an upstream fetcher",
                reference.name
            ))),
        }
    }

    fn fetch_locked(&self, lock: &UpstreamLock) -> Result<PackageTree, UpstreamError> {
        self.begin()?;
        let state = self.state();
        match lock {
            UpstreamLock::Git(git) => {
                let tree = state
                    .git
                    .get(&git.repo)
                    .and_then(|repo| repo.commits.get(&git.commit))
                    .ok_or_else(|| {
                        UpstreamError::NotFound(format!("commit {} in {}", git.commit, git.repo))
                    })?;
                git_subtree(tree, &git.directory, &git.repo)
            }
            UpstreamLock::Oci(oci) => state
                .oci_blobs
                .get(&oci.digest)
                .cloned()
                .ok_or_else(|| UpstreamError::NotFound(format!("digest {}", oci.digest))),
            UpstreamLock::Revision(rev) => Err(UpstreamError::InvalidReference(format!(
                "revision {} is not served by an upstream fetcher",
                rev.name
            ))),
        }
    }
}
