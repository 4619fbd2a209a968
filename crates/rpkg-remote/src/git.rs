//! Git upstream fetcher driving the `git` command-line client.

use crate::config::{Credentials, GitCredential};
use crate::{Fetched, UpstreamError, UpstreamFetcher};
use rpkg_schema::{normalize_dir, GitLock, GitPackage, PackageTree, UpstreamLock, UpstreamPackage};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Classify git stderr into an upstream error kind.
pub fn classify_git_error(stderr: &str) -> UpstreamError {
    let lower = stderr.to_lowercase();
    let message = stderr.trim().to_owned();

    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection timed out")
        || lower.contains("network is unreachable")
        || lower.contains("failed to connect")
        || lower.contains("couldn't connect to server")
        || lower.contains("the remote end hung up unexpectedly")
        || lower.contains("early eof")
        || lower.contains("operation timed out")
    {
        return UpstreamError::Unreachable(message);
    }

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("invalid credentials")
        || lower.contains("could not read username")
        || lower.contains("http basic: access denied")
        || lower.contains("403")
    {
        return UpstreamError::AuthFailed(message);
    }

    if lower.contains("couldn't find remote ref")
        || lower.contains("repository not found")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("not found")
        || lower.contains("not our ref")
        || lower.contains("no such file or directory")
    {
        return UpstreamError::NotFound(message);
    }

    UpstreamError::InvalidReference(message)
}

fn is_commit_sha(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

fn check_argument(value: &str, what: &str) -> Result<(), UpstreamError> {
    if value.is_empty() || value.starts_with('-') || value.contains(['\n', '\0']) {
        return Err(UpstreamError::InvalidReference(format!(
            "{what} '{value}' is not valid"
        )));
    }
    Ok(())
}

/// Credential helper answering `get` from `RPKG_GIT_USERNAME` and
/// `RPKG_GIT_PASSWORD`.
const CREDENTIAL_HELPER: &str = "credential.helper=!f() { test \"$1\" = get && \
printf 'username=%s\\npassword=%s\\n' \"$RPKG_GIT_USERNAME\" \"$RPKG_GIT_PASSWORD\"; }; f";

/// Fetches packages by shallow-fetching a single ref into a scratch repository.
#[derive(Debug, Clone)]
pub struct GitCliFetcher {
    work_root: PathBuf,
    credentials: Credentials,
    timeout: Duration,
}

impl GitCliFetcher {
    /// `work_root` holds the scratch repositories; each fetch uses and removes
    /// its own temporary directory inside it.
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            credentials: Credentials::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn credential(
        &self,
        repo: &str,
        secret: Option<&str>,
    ) -> Result<Option<&GitCredential>, UpstreamError> {
        let Some(name) = secret.filter(|n| !n.is_empty()) else {
            return Ok(None);
        };
        let credential = self.credentials.get(name).ok_or_else(|| {
            UpstreamError::AuthFailed(format!("secret '{name}' is not configured"))
        })?;
        if !repo.starts_with("https://") {
            return Err(UpstreamError::AuthFailed(format!(
                "secret '{name}' can only be used with https repositories"
            )));
        }
        Ok(Some(credential))
    }

    /// Create a scratch repository with `repo` as its `origin`.
    fn session<'a>(
        &self,
        repo: &str,
        credential: Option<&'a GitCredential>,
    ) -> Result<Session<'a>, UpstreamError> {
        std::fs::create_dir_all(&self.work_root)
            .map_err(|e| UpstreamError::Unreachable(format!("scratch dir: {e}")))?;
        let scratch = tempfile::Builder::new()
            .prefix("fetch-")
            .tempdir_in(&self.work_root)
            .map_err(|e| UpstreamError::Unreachable(format!("scratch dir: {e}")))?;
        let session = Session {
            scratch,
            deadline: Instant::now() + self.timeout,
            timeout: self.timeout,
            credential,
        };
        session.run_ok(&["init", "-q"])?;
        session.run_ok(&["remote", "add", "origin", repo])?;
        Ok(session)
    }

    fn fetch_git(&self, git: &GitPackage) -> Result<Fetched, UpstreamError> {
        check_argument(&git.repo, "repository")?;
        check_argument(&git.git_ref, "ref")?;
        let credential =
            self.credential(&git.repo, git.secret_ref.as_ref().map(|s| s.name.as_str()))?;
        let session = self.session(&git.repo, credential)?;

        let commit = session.fetch_commit(&git.git_ref)?;
        let tree = session.read_tree(&commit, &git.directory)?;
        debug!("resolved {}@{} to {commit}", git.repo, git.git_ref);

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
}

/// One fetch: a scratch repository, the deadline for every git call made in
/// it and the credential offered to the remote.
struct Session<'a> {
    scratch: tempfile::TempDir,
    deadline: Instant,
    timeout: Duration,
    credential: Option<&'a GitCredential>,
}

impl Session<'_> {
    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        if let Some(credential) = self.credential {
            command
                .args(["-c", "credential.helper=", "-c", CREDENTIAL_HELPER])
                .env("RPKG_GIT_USERNAME", &credential.username)
                .env("RPKG_GIT_PASSWORD", &credential.token);
        }
        command
            .args(args)
            .current_dir(self.scratch.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
    }

    /// Run git in the scratch repository, killing it once the deadline passes.
    fn run(&self, args: &[&str]) -> Result<Output, UpstreamError> {
        debug!("git {}", args.first().copied().unwrap_or_default());
        let mut child = self
            .command(args)
            .spawn()
            .map_err(|e| UpstreamError::Unreachable(format!("cannot run git: {e}")))?;

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let out_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(s) = stdout.as_mut() {
                let _ = s.read_to_end(&mut buf);
            }
            buf
        });
        let err_reader = std::thread::spawn(move || {
            let mut buf = Vec::new();
            if let Some(s) = stderr.as_mut() {
                let _ = s.read_to_end(&mut buf);
            }
            buf
        });

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= self.deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(UpstreamError::Unreachable(format!(
                        "git {} timed out after {}s",
                        args.first().copied().unwrap_or_default(),
                        self.timeout.as_secs()
                    )));
                }
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(UpstreamError::Unreachable(format!("git wait failed: {e}"))),
            }
        };

        Ok(Output {
            status,
            stdout: out_reader.join().unwrap_or_default(),
            stderr: err_reader.join().unwrap_or_default(),
        })
    }

    fn run_ok(&self, args: &[&str]) -> Result<Vec<u8>, UpstreamError> {
        let output = self.run(args)?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(classify_git_error(&redact(
                &String::from_utf8_lossy(&output.stderr),
            )))
        }
    }

    /// Fetch `what` (ref name or commit) and return the concrete commit SHA.
    fn fetch_commit(&self, what: &str) -> Result<String, UpstreamError> {
        let shallow = self.run_ok(&["fetch", "-q", "--depth", "1", "--no-tags", "origin", what]);
        match shallow {
            Ok(_) => {}
            // Servers may refuse to serve an unadvertised SHA; fall back to a full fetch.
            Err(UpstreamError::NotFound(_) | UpstreamError::InvalidReference(_))
                if is_commit_sha(what) =>
            {
                self.run_ok(&["fetch", "-q", "--no-tags", "origin"])?;
                let object = format!("{what}^{{commit}}");
                self.run_ok(&["cat-file", "-e", &object])
                    .map_err(|_| UpstreamError::NotFound(format!("commit {what}")))?;
                return Ok(what.to_owned());
            }
            Err(e) => return Err(e),
        }
        let out = self.run_ok(&["rev-parse", "FETCH_HEAD^{commit}"])?;
        let commit = String::from_utf8_lossy(&out).trim().to_owned();
        if !is_commit_sha(&commit) {
            return Err(UpstreamError::InvalidReference(format!(
                "'{what}' did not resolve to a commit"
            )));
        }
        Ok(commit)
    }

    fn read_tree(&self, commit: &str, directory: &str) -> Result<PackageTree, UpstreamError> {
        let directory = normalize_dir(directory);
        let mut args = vec!["ls-tree", "-r", "-z", commit];
        let scope = format!("{directory}/");
        if !directory.is_empty() {
            args.push("--");
            args.push(&scope);
        }
        let listing = self.run_ok(&args)?;

        let mut tree = PackageTree::new();
        for entry in listing.split(|b| *b == 0).filter(|e| !e.is_empty()) {
            let entry = String::from_utf8_lossy(entry);
            let Some((meta, path)) = entry.split_once('\t') else {
                continue;
            };
            let mut fields = meta.split_whitespace();
            let (_mode, kind, hash) = (fields.next(), fields.next(), fields.next());
            if kind != Some("blob") {
                continue;
            }
            let Some(hash) = hash else { continue };
            let relative = if directory.is_empty() {
                path
            } else {
                match path.strip_prefix(&scope) {
                    Some(rest) => rest,
                    None => continue,
                }
            };
            let blob = self.run_ok(&["cat-file", "blob", hash])?;
            let contents = String::from_utf8(blob).map_err(|_| {
                UpstreamError::InvalidReference(format!("non-UTF-8 file '{relative}' at {commit}"))
            })?;
            tree.insert(relative, contents)
                .map_err(|e| UpstreamError::InvalidReference(e.to_string()))?;
        }

        if tree.is_empty() && !directory.is_empty() {
            return Err(UpstreamError::NotFound(format!(
                "directory '{directory}' at commit {commit}"
            )));
        }
        Ok(tree)
    }
}

/// Strip credentials embedded in URLs out of git's messages.
fn redact(message: &str) -> String {
    message
        .split(' ')
        .map(|word| match (word.find("://"), word.find('@')) {
            (Some(scheme), Some(at)) if at > scheme => {
                format!("{}://***@{}", &word[..scheme], &word[at + 1..])
            }
            _ => word.to_owned(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl UpstreamFetcher for GitCliFetcher {
    fn fetch(&self, upstream: &UpstreamPackage) -> Result<Fetched, UpstreamError> {
        match upstream {
            UpstreamPackage::Git(git) => self.fetch_git(git),
            other => Err(UpstreamError::InvalidReference(format!(
                "git fetcher cannot resolve {}",
                other.describe()
            ))),
        }
    }

    fn fetch_locked(&self, lock: &UpstreamLock) -> Result<PackageTree, UpstreamError> {
        let UpstreamLock::Git(git) = lock else {
            return Err(UpstreamError::InvalidReference(format!(
                "git fetcher cannot resolve {}",
                lock.describe()
            )));
        };
        check_argument(&git.repo, "repository")?;
        if !is_commit_sha(&git.commit) {
            return Err(UpstreamError::InvalidReference(format!(
                "lock commit '{}' is not a full SHA",
                git.commit
            )));
        }
        let session = self.session(&git.repo, None)?;
        let commit = session.fetch_commit(&git.commit)?;
        session.read_tree(&commit, &git.directory)
    }
}
