//! Repository resolution and the on-disk clone cache.
//!
//! Turns a manifest repository reference into a local checkout. Remote
//! references land under `<cacheRoot>/repos/<owner>/<name>/<sanitized-ref>`;
//! file and relative references resolve in place. All git work shells out to
//! the `git` binary.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use tako_core::codes::ErrorCode;
use tako_core::reference::{sanitize_ref, RepoRef};

use crate::locks::LockTable;

/// Clone and fetch attempts before giving up.
const MAX_ATTEMPTS: u32 = 3;
/// Constant backoff between attempts; a small jitter is added on top.
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("malformed repository reference: {0}")]
    Malformed(String),
    #[error("clone of {repo} failed: {detail}")]
    CloneFailed { repo: String, detail: String },
    #[error("checkout of {reference} in {repo} failed: {detail}")]
    CheckoutFailed {
        repo: String,
        reference: String,
        detail: String,
    },
    #[error("ref `{reference}` not found in {repo}")]
    RefNotFound { repo: String, reference: String },
    #[error("repository {0} is not cached and --local forbids cloning")]
    CacheMissInLocalMode(String),
    #[error("failed to execute git: {0}")]
    Execution(#[from] std::io::Error),
}

impl ResolveError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::CacheMissInLocalMode(_) => ErrorCode::CacheMissInLocalMode,
            Self::Malformed(_) => ErrorCode::ManifestInvalid,
            _ => ErrorCode::RepoResolveFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Resolver configuration shared by the graph builder and child factories.
#[derive(Debug, Clone)]
pub struct Resolver {
    cache_root: PathBuf,
    local_only: bool,
    /// Base URL the `owner/name` form expands against.
    host_url: String,
}

impl Resolver {
    pub fn new(cache_root: PathBuf, local_only: bool) -> Self {
        Self {
            cache_root,
            local_only,
            host_url: "https://github.com".to_string(),
        }
    }

    /// Default cache root: `~/.cache/tako`.
    pub fn default_cache_root() -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(|| PathBuf::from(".cache"))
            .join("tako")
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolve `raw` to a local repository directory.
    ///
    /// `current_path` anchors relative references. Remote references are
    /// cloned or refreshed under the cache unless `local_only` is set, in
    /// which case the checkout must already exist.
    pub fn resolve(&self, raw: &str, current_path: &Path) -> Result<PathBuf> {
        let reference =
            RepoRef::parse(raw).map_err(|_| ResolveError::Malformed(raw.to_string()))?;
        match reference {
            RepoRef::File { path } => Ok(PathBuf::from(path)),
            RepoRef::Relative { path } => Ok(clean_join(current_path, &path)),
            RepoRef::Remote {
                owner,
                name,
                ref_name,
            } => self.resolve_remote(&owner, &name, ref_name.as_deref()),
        }
    }

    fn resolve_remote(&self, owner: &str, name: &str, ref_name: Option<&str>) -> Result<PathBuf> {
        let branch_dir = sanitize_ref(ref_name.unwrap_or("main"));
        let checkout = self
            .cache_root
            .join("repos")
            .join(owner)
            .join(name)
            .join(&branch_dir);
        let repo = format!("{owner}/{name}");

        LockTable::global().with_lock(&repo, || {
            if !checkout.exists() {
                if self.local_only {
                    return Err(ResolveError::CacheMissInLocalMode(repo.clone()));
                }
                self.clone_repo(&repo, &checkout)?;
            } else if !self.local_only {
                self.fetch(&repo, &checkout)?;
            }
            if let Some(reference) = ref_name {
                checkout_ref(&repo, &checkout, reference)?;
            }
            Ok(checkout.clone())
        })
    }

    fn clone_url(&self, repo: &str) -> String {
        format!("{}/{repo}.git", self.host_url)
    }

    fn clone_repo(&self, repo: &str, checkout: &Path) -> Result<()> {
        if let Some(parent) = checkout.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let url = self.clone_url(repo);
        info!(repo, url = %url, dest = %checkout.display(), "cloning repository");

        with_retries(repo, "clone", || {
            let output = Command::new("git")
                .args(["clone", &url, &checkout.display().to_string()])
                .output()?;
            if output.status.success() {
                Ok(())
            } else {
                Err(ResolveError::CloneFailed {
                    repo: repo.to_string(),
                    detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        })
    }

    fn fetch(&self, repo: &str, checkout: &Path) -> Result<()> {
        debug!(repo, dest = %checkout.display(), "fetching repository");
        with_retries(repo, "fetch", || {
            let output = Command::new("git")
                .args(["fetch", "--all", "--prune"])
                .current_dir(checkout)
                .output()?;
            if output.status.success() {
                Ok(())
            } else {
                Err(ResolveError::CloneFailed {
                    repo: repo.to_string(),
                    detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        })
    }
}

fn checkout_ref(repo: &str, checkout: &Path, reference: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["checkout", reference])
        .current_dir(checkout)
        .output()?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.contains("did not match any") || stderr.contains("pathspec") {
        return Err(ResolveError::RefNotFound {
            repo: repo.to_string(),
            reference: reference.to_string(),
        });
    }
    Err(ResolveError::CheckoutFailed {
        repo: repo.to_string(),
        reference: reference.to_string(),
        detail: stderr,
    })
}

/// Bounded retry with constant backoff plus a little jitter, so parallel
/// workers hitting the same remote do not retry in lockstep.
fn with_retries(repo: &str, operation: &str, mut f: impl FnMut() -> Result<()>) -> Result<()> {
    let mut last = None;
    for attempt in 1..=MAX_ATTEMPTS {
        match f() {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(repo, operation, attempt, error = %e, "git operation failed");
                last = Some(e);
                if attempt < MAX_ATTEMPTS {
                    let jitter = Duration::from_millis(u64::from(rand::random::<u8>()) * 4);
                    std::thread::sleep(RETRY_BACKOFF + jitter);
                }
            }
        }
    }
    Err(last.expect("at least one attempt ran"))
}

/// Join and normalize without touching the filesystem, so paths resolve the
/// same whether or not they exist yet.
pub fn clean_join(base: &Path, relative: &str) -> PathBuf {
    let joined = base.join(relative);
    let mut components: Vec<std::path::Component<'_>> = Vec::new();
    for component in joined.components() {
        match component {
            std::path::Component::ParentDir => {
                if matches!(components.last(), Some(std::path::Component::Normal(_))) {
                    components.pop();
                } else {
                    components.push(component);
                }
            }
            std::path::Component::CurDir => {}
            other => components.push(other),
        }
    }
    components.iter().collect()
}
