//! Child run workspaces: creation, liveness locking, and cleanup.
//!
//! Every child workflow gets its own workspace under
//! `<parent-workspace>/children/<child-run-id>` with a private copy of the
//! subscriber repository. A held advisory lock on the workspace's lock file
//! marks it as owned by a live process; the cleanup manager never touches a
//! locked workspace.

use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, warn};

use tako_core::codes::ErrorCode;

use crate::locks::LockTable;
use crate::state::{new_run_id, StateStore};

/// Name of the liveness lock file inside a child workspace.
pub const LOCK_FILE: &str = ".tako.lock";

#[derive(Debug, Error)]
pub enum ChildError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository path {0} escapes the cache root")]
    Traversal(String),
}

impl ChildError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ChildWorkflowExecutionFailed
    }
}

pub type Result<T> = std::result::Result<T, ChildError>;

/// A freshly provisioned child workspace.
#[derive(Debug)]
pub struct ChildWorkspace {
    pub run_id: String,
    /// `<parent-workspace>/children/<run-id>`.
    pub workspace: PathBuf,
    /// The child's private repository copy.
    pub repo_path: PathBuf,
    /// Held for the child's lifetime; dropping releases the liveness mark.
    _lock: WorkspaceLock,
}

/// An exclusively-locked workspace lock file.
#[derive(Debug)]
struct WorkspaceLock {
    _file: File,
}

impl WorkspaceLock {
    fn acquire(workspace: &Path) -> std::io::Result<Self> {
        let file = File::create(workspace.join(LOCK_FILE))?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

/// Creates isolated workspaces for child workflow runs.
#[derive(Debug, Clone)]
pub struct ChildRunnerFactory {
    parent_workspace: PathBuf,
    cache_root: PathBuf,
}

impl ChildRunnerFactory {
    pub fn new(parent_workspace: PathBuf, cache_root: PathBuf) -> Self {
        Self {
            parent_workspace,
            cache_root,
        }
    }

    pub fn children_dir(&self) -> PathBuf {
        self.parent_workspace.join("children")
    }

    /// Provision a workspace for one child run: allocate a run id, copy the
    /// subscriber repository in (holding the repository cache lock for the
    /// duration of the copy), and mark the workspace live.
    pub fn create_child(&self, subscriber_repo: &Path) -> Result<ChildWorkspace> {
        self.check_repo_path(subscriber_repo)?;

        let run_id = new_run_id();
        let workspace = self.children_dir().join(&run_id);
        std::fs::create_dir_all(&workspace)?;
        let lock = WorkspaceLock::acquire(&workspace)?;

        let repo_path = workspace.join("repo");
        let lock_key = cache_lock_key(&self.cache_root, subscriber_repo);
        LockTable::global().with_lock(&lock_key, || copy_dir(subscriber_repo, &repo_path))?;

        debug!(run_id = %run_id, workspace = %workspace.display(), "child workspace created");
        Ok(ChildWorkspace {
            run_id,
            workspace,
            repo_path,
            _lock: lock,
        })
    }

    /// Child repositories must be absolute and live under the cache root;
    /// `..` segments are rejected outright.
    fn check_repo_path(&self, repo: &Path) -> Result<()> {
        let escapes = !repo.is_absolute()
            || repo
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
            || !repo.starts_with(&self.cache_root);
        if escapes {
            return Err(ChildError::Traversal(repo.display().to_string()));
        }
        Ok(())
    }
}

/// Serialize repository copies against clone/fetch on the same cache entry.
fn cache_lock_key(cache_root: &Path, repo: &Path) -> String {
    repo.strip_prefix(cache_root.join("repos"))
        .ok()
        .and_then(|rel| {
            let mut parts = rel.components();
            let owner = parts.next()?.as_os_str().to_string_lossy().into_owned();
            let name = parts.next()?.as_os_str().to_string_lossy().into_owned();
            Some(format!("{owner}/{name}"))
        })
        .unwrap_or_else(|| repo.display().to_string())
}

fn copy_dir(from: &Path, to: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&source, &target)?;
        } else {
            std::fs::copy(&source, &target)?;
        }
    }
    Ok(())
}

/// Sweeps finished and abandoned child workspaces. Safe to run repeatedly;
/// a workspace whose lock is still held is always left alone.
#[derive(Debug, Clone)]
pub struct CleanupManager {
    /// Workspaces older than this are removed even without terminal state.
    pub max_age: Duration,
}

impl Default for CleanupManager {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl CleanupManager {
    /// Remove eligible child workspaces under `children_dir`. Returns how
    /// many were removed.
    pub fn sweep(&self, children_dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(children_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.filter_map(std::result::Result::ok) {
            let workspace = entry.path();
            if !workspace.is_dir() {
                continue;
            }
            if self.should_remove(&workspace) {
                match std::fs::remove_dir_all(&workspace) {
                    Ok(()) => {
                        info!(workspace = %workspace.display(), "removed child workspace");
                        removed += 1;
                    }
                    Err(e) => {
                        warn!(workspace = %workspace.display(), error = %e, "child workspace cleanup failed");
                    }
                }
            }
        }
        removed
    }

    fn should_remove(&self, workspace: &Path) -> bool {
        // A held lock means the owning process is still running.
        if workspace_is_live(workspace) {
            return false;
        }

        if let Some(run_id) = workspace.file_name().and_then(|n| n.to_str()) {
            let store = StateStore::new(workspace);
            if let Ok(state) = store.load(run_id) {
                if state.status.is_terminal() {
                    return true;
                }
            }
        }

        match workspace_age(workspace) {
            Some(age) => age > self.max_age,
            None => false,
        }
    }
}

fn workspace_is_live(workspace: &Path) -> bool {
    let lock_path = workspace.join(LOCK_FILE);
    let Ok(file) = File::open(&lock_path) else {
        return false;
    };
    if file.try_lock_exclusive().is_ok() {
        let _ = fs2::FileExt::unlock(&file);
        false
    } else {
        true
    }
}

fn workspace_age(workspace: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(workspace).ok()?.modified().ok()?;
    SystemTime::now().duration_since(modified).ok()
}
