//! The graph runner: executes work across the dependents graph in
//! topological order.
//!
//! `exec` runs a workflow in the root repository and propagates along
//! declared dependents (installing artifacts, then running the workflows
//! each edge names). `run` executes an ad-hoc shell command in every
//! selected repository. Parallel mode dispatches a whole topological level
//! at once; serial mode walks the flattened order.

use indexmap::IndexMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tako_core::manifest::Manifest;

use crate::children::CleanupManager;
use crate::errors::{EngineError, Result};
use crate::executor::shell::run_shell;
use crate::graph::{Graph, Node};
use crate::orchestrator::{Orchestrator, OrchestratorShared};
use crate::planner;
use crate::resolver::Resolver;
use crate::state::{new_run_id, RunStatus, StateStore};
use crate::workflow::{ExecOptions, WorkflowEngine, WorkflowError};

/// Everything a top-level invocation needs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Root repository directory.
    pub root: PathBuf,
    pub cache_root: PathBuf,
    /// Directory run workspaces are created under.
    pub workspace_root: PathBuf,
    pub local_only: bool,
    pub only: Vec<String>,
    pub ignore: Vec<String>,
    pub serial: bool,
    /// 0 means unbounded.
    pub max_concurrent_repos: usize,
    pub options: ExecOptions,
}

impl RunnerConfig {
    pub fn new(root: PathBuf, cache_root: PathBuf) -> Self {
        let workspace_root = cache_root.join("runs");
        Self {
            root,
            cache_root,
            workspace_root,
            local_only: false,
            only: Vec::new(),
            ignore: Vec::new(),
            serial: false,
            max_concurrent_repos: 0,
            options: ExecOptions::default(),
        }
    }
}

/// Result of work in one repository.
#[derive(Debug, Clone)]
pub struct RepoResult {
    pub repo: String,
    pub workflow: Option<String>,
    pub run_id: Option<String>,
    pub ok: bool,
    pub error: Option<String>,
}

/// Aggregate of one invocation.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub results: Vec<RepoResult>,
}

impl RunReport {
    pub fn ok(&self) -> bool {
        self.results.iter().all(|r| r.ok)
    }

    pub fn failures(&self) -> Vec<&RepoResult> {
        self.results.iter().filter(|r| !r.ok).collect()
    }
}

#[derive(Debug)]
pub struct GraphRunner {
    config: RunnerConfig,
    cancel: CancellationToken,
}

impl GraphRunner {
    pub fn new(config: RunnerConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    fn resolver(&self) -> Resolver {
        Resolver::new(self.config.cache_root.clone(), self.config.local_only)
    }

    /// Build the full dependents graph from the configured root.
    pub fn build_graph(&self) -> Result<Graph> {
        Ok(Graph::build(&self.config.root, &self.resolver())?)
    }

    /// Load and validate the root manifest (and, transitively, the graph).
    pub fn validate(&self) -> Result<()> {
        Manifest::load_from_dir(&self.config.root)?;
        self.build_graph()?;
        Ok(())
    }

    /// Execute an ad-hoc shell command across the filtered graph.
    pub async fn run_command(&self, command: &str) -> Result<RunReport> {
        let graph = self.build_graph()?;
        let subset = planner::filter(&graph, &self.config.only, &self.config.ignore)?;
        if subset.is_empty() {
            warn!("filter selected no repositories");
        }
        let levels = planner::topo_levels(&graph, &subset)?;

        let run_id = new_run_id();
        let mut results = Vec::new();

        for level in levels {
            if self.cancel.is_cancelled() {
                break;
            }
            let level_results = self
                .run_level(level, |node| {
                    let command = command.to_string();
                    let cancel = self.cancel.clone();
                    let dry_run = self.config.options.dry_run;
                    async move {
                        if dry_run {
                            info!(repo = %node.name, command, "would run (dry-run)");
                            return RepoResult {
                                repo: node.name.clone(),
                                workflow: None,
                                run_id: None,
                                ok: true,
                                error: None,
                            };
                        }
                        let outcome = run_shell(
                            &command,
                            &node.path,
                            &IndexMap::new(),
                            &cancel,
                            None,
                        )
                        .await;
                        match outcome {
                            Ok(outcome) if outcome.success() => RepoResult {
                                repo: node.name.clone(),
                                workflow: None,
                                run_id: None,
                                ok: true,
                                error: None,
                            },
                            Ok(outcome) => RepoResult {
                                repo: node.name.clone(),
                                workflow: None,
                                run_id: None,
                                ok: false,
                                error: Some(format!(
                                    "exit code {}: {}",
                                    outcome.exit_code,
                                    outcome.stderr_tail(5)
                                )),
                            },
                            Err(e) => RepoResult {
                                repo: node.name.clone(),
                                workflow: None,
                                run_id: None,
                                ok: false,
                                error: Some(e.to_string()),
                            },
                        }
                    }
                })
                .await;

            let failed = level_results.iter().any(|r| !r.ok);
            results.extend(level_results);
            if failed && !self.config.options.continue_on_error {
                break;
            }
        }

        Ok(RunReport { run_id, results })
    }

    /// Execute `workflow` in the root repository, then propagate along
    /// declared dependents level by level.
    pub async fn exec_workflow(
        &self,
        workflow: &str,
        inputs: &IndexMap<String, String>,
    ) -> Result<RunReport> {
        let graph = self.build_graph()?;
        let subset = planner::filter(&graph, &self.config.only, &self.config.ignore)?;
        if subset.is_empty() {
            warn!("filter selected no repositories");
            return Ok(RunReport {
                run_id: new_run_id(),
                results: Vec::new(),
            });
        }

        let run_id = new_run_id();
        let workspace = self.config.workspace_root.join(&run_id);
        std::fs::create_dir_all(&workspace)?;

        let shared =
            OrchestratorShared::new(self.config.cache_root.clone(), self.config.options.clone());
        let mut results = Vec::new();

        // Root workflow first.
        let root_result = self
            .execute_node_workflow(
                &graph.root,
                workflow,
                inputs,
                &run_id,
                &workspace,
                &shared,
                Some(run_id.clone()),
            )
            .await;
        let root_ok = root_result.ok;
        results.push(root_result);

        if root_ok || self.config.options.continue_on_error {
            let propagated = self
                .propagate(&graph, &subset, &workspace, &run_id, &shared, root_ok)
                .await?;
            results.extend(propagated);
        }

        if !self.config.options.preserve_tmp {
            let swept = CleanupManager::default().sweep(&workspace.join("children"));
            if swept > 0 {
                info!(swept, "cleaned up child workspaces");
            }
        }

        Ok(RunReport { run_id, results })
    }

    /// Resume a previously failed run of `workflow` in the root repository.
    pub async fn resume_run(&self, run_id: &str) -> Result<RunReport> {
        let workspace = self.config.workspace_root.join(run_id);
        let store = StateStore::new(&workspace);
        let previous = store.load(run_id)?;
        if !previous.is_resumable() {
            return Err(EngineError::State(crate::state::StateError::NotResumable(
                run_id.to_string(),
            )));
        }

        let shared =
            OrchestratorShared::new(self.config.cache_root.clone(), self.config.options.clone());
        let workflow = previous.workflow.clone();
        let inputs = previous.inputs.clone();
        let repo_path = PathBuf::from(&previous.repo_path);

        let engine = self.engine_for(
            &repo_path,
            &workspace,
            run_id.to_string(),
            None,
            &shared,
        );
        let result = engine.resume(previous, &workflow, &inputs).await;
        let repo_name = Manifest::load_from_dir(&repo_path)
            .map(|m| m.name().to_string())
            .unwrap_or_else(|_| repo_path.display().to_string());

        let repo_result = match result {
            Ok(state) if state.status == RunStatus::Completed => RepoResult {
                repo: repo_name,
                workflow: Some(workflow),
                run_id: Some(run_id.to_string()),
                ok: true,
                error: None,
            },
            Ok(state) => RepoResult {
                repo: repo_name,
                workflow: Some(workflow),
                run_id: Some(run_id.to_string()),
                ok: false,
                error: state.error,
            },
            Err(e) => RepoResult {
                repo: repo_name,
                workflow: Some(workflow),
                run_id: Some(run_id.to_string()),
                ok: false,
                error: Some(e.to_string()),
            },
        };

        Ok(RunReport {
            run_id: run_id.to_string(),
            results: vec![repo_result],
        })
    }

    /// Directed propagation: walk dependent edges breadth-first from the
    /// root, installing declared artifacts and running the workflows each
    /// edge names. Descendants of a failed repository are skipped;
    /// independent branches continue.
    async fn propagate(
        &self,
        graph: &Graph,
        subset: &HashSet<PathBuf>,
        workspace: &Path,
        parent_run_id: &str,
        shared: &Arc<OrchestratorShared>,
        root_ok: bool,
    ) -> Result<Vec<RepoResult>> {
        let mut results = Vec::new();
        let mut failed: HashSet<PathBuf> = HashSet::new();
        if !root_ok {
            failed.insert(graph.root.path.clone());
        }
        let mut executed: HashSet<(PathBuf, String)> = HashSet::new();
        let mut frontier: Vec<Arc<Node>> = vec![Arc::clone(&graph.root)];
        let mut visited: HashSet<PathBuf> = HashSet::new();

        while !frontier.is_empty() {
            if self.cancel.is_cancelled() {
                break;
            }

            // Collect this level's edge jobs.
            let mut jobs = Vec::new();
            let mut next: Vec<Arc<Node>> = Vec::new();
            for parent in &frontier {
                if !visited.insert(parent.path.clone()) {
                    continue;
                }
                if failed.contains(&parent.path) {
                    continue;
                }
                for (entry, child) in parent.manifest.dependents.iter().zip(&parent.dependents) {
                    if !subset.contains(&child.path) {
                        continue;
                    }
                    next.push(Arc::clone(child));
                    let mut workflows = entry.workflows.clone();
                    if workflows.is_empty()
                        && child.manifest.workflows.contains_key("default")
                    {
                        workflows.push("default".to_string());
                    }
                    workflows.retain(|w| executed.insert((child.path.clone(), w.clone())));
                    jobs.push(EdgeJob {
                        parent: Arc::clone(parent),
                        child: Arc::clone(child),
                        artifacts: entry.artifacts.clone(),
                        workflows,
                    });
                }
            }

            let level_results = self
                .run_level_jobs(jobs, workspace, parent_run_id, shared)
                .await;
            for (child_path, repo_results, edge_failed) in level_results {
                if edge_failed {
                    failed.insert(child_path);
                }
                results.extend(repo_results);
            }

            let any_failed = !failed.is_empty();
            if any_failed && !self.config.options.continue_on_error {
                break;
            }
            frontier = next;
        }

        Ok(results)
    }

    async fn run_level_jobs(
        &self,
        jobs: Vec<EdgeJob>,
        workspace: &Path,
        parent_run_id: &str,
        shared: &Arc<OrchestratorShared>,
    ) -> Vec<(PathBuf, Vec<RepoResult>, bool)> {
        if self.config.serial {
            let mut all = Vec::new();
            for job in jobs {
                all.push(self.run_edge_job(job, workspace, parent_run_id, shared).await);
            }
            return all;
        }

        let semaphore = (self.config.max_concurrent_repos > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_repos)));
        let mut set: JoinSet<(PathBuf, Vec<RepoResult>, bool)> = JoinSet::new();
        for job in jobs {
            let semaphore = semaphore.clone();
            let runner = self.clone_for_task();
            let workspace = workspace.to_path_buf();
            let parent_run_id = parent_run_id.to_string();
            let shared = Arc::clone(shared);
            set.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                runner
                    .run_edge_job(job, &workspace, &parent_run_id, &shared)
                    .await
            });
        }

        let mut all = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(result) = joined {
                all.push(result);
            }
        }
        all
    }

    /// Run one dependent edge: install listed artifacts, then each named
    /// workflow.
    async fn run_edge_job(
        &self,
        job: EdgeJob,
        workspace: &Path,
        parent_run_id: &str,
        shared: &Arc<OrchestratorShared>,
    ) -> (PathBuf, Vec<RepoResult>, bool) {
        let mut results = Vec::new();
        let mut edge_failed = false;

        for artifact_name in &job.artifacts {
            if let Some(artifact) = job.parent.manifest.artifacts.get(artifact_name) {
                if let Err(e) = self.install_artifact(&job, artifact).await {
                    edge_failed = true;
                    results.push(RepoResult {
                        repo: job.child.name.clone(),
                        workflow: None,
                        run_id: None,
                        ok: false,
                        error: Some(format!("artifact `{artifact_name}`: {e}")),
                    });
                }
            }
        }

        if !edge_failed || self.config.options.continue_on_error {
            for workflow in &job.workflows {
                let run_id = new_run_id();
                let result = self
                    .execute_node_workflow(
                        &job.child,
                        workflow,
                        &IndexMap::new(),
                        &run_id,
                        workspace,
                        shared,
                        Some(parent_run_id.to_string()),
                    )
                    .await;
                edge_failed |= !result.ok;
                results.push(result);
                if edge_failed && !self.config.options.continue_on_error {
                    break;
                }
            }
        }

        (job.child.path.clone(), results, edge_failed)
    }

    async fn install_artifact(
        &self,
        job: &EdgeJob,
        artifact: &tako_core::manifest::Artifact,
    ) -> std::result::Result<(), WorkflowError> {
        let artifact_path = job.parent.path.join(&artifact.path);
        let mut env = IndexMap::new();
        env.insert(
            "TAKO_ARTIFACT_PATH".to_string(),
            artifact_path.display().to_string(),
        );

        for command in [&artifact.install_command, &artifact.verify_command]
            .into_iter()
            .flatten()
        {
            if self.config.options.dry_run {
                info!(repo = %job.child.name, command, "would run (dry-run)");
                continue;
            }
            let outcome = run_shell(command, &job.child.path, &env, &self.cancel, None).await?;
            if !outcome.success() {
                return Err(WorkflowError::StepFailed {
                    step: format!("install:{}", artifact.name),
                    detail: format!(
                        "exit code {}: {}",
                        outcome.exit_code,
                        outcome.stderr_tail(5)
                    ),
                });
            }
        }
        Ok(())
    }

    async fn execute_node_workflow(
        &self,
        node: &Arc<Node>,
        workflow: &str,
        inputs: &IndexMap<String, String>,
        run_id: &str,
        workspace: &Path,
        shared: &Arc<OrchestratorShared>,
        parent_run_id: Option<String>,
    ) -> RepoResult {
        let parent = parent_run_id.filter(|p| p != run_id);
        let engine = self.engine_for(&node.path, workspace, run_id.to_string(), parent, shared);
        let result = engine.execute(workflow, inputs, None).await;
        match result {
            Ok(state) if state.status == RunStatus::Completed => RepoResult {
                repo: node.name.clone(),
                workflow: Some(workflow.to_string()),
                run_id: Some(run_id.to_string()),
                ok: true,
                error: None,
            },
            Ok(state) => RepoResult {
                repo: node.name.clone(),
                workflow: Some(workflow.to_string()),
                run_id: Some(run_id.to_string()),
                ok: false,
                error: state.error,
            },
            Err(e) => RepoResult {
                repo: node.name.clone(),
                workflow: Some(workflow.to_string()),
                run_id: Some(run_id.to_string()),
                ok: false,
                error: Some(format!("{}: {e}", e.code())),
            },
        }
    }

    fn engine_for(
        &self,
        repo_path: &Path,
        workspace: &Path,
        run_id: String,
        parent_run_id: Option<String>,
        shared: &Arc<OrchestratorShared>,
    ) -> WorkflowEngine {
        let orchestrator = Orchestrator::new(
            Arc::clone(shared),
            workspace.to_path_buf(),
            run_id.clone(),
            self.cancel.clone(),
        );
        WorkflowEngine {
            repo_path: repo_path.to_path_buf(),
            workspace: workspace.to_path_buf(),
            run_id,
            parent_run_id,
            options: self.config.options.clone(),
            cancel: self.cancel.clone(),
            orchestrator,
        }
    }

    fn clone_for_task(&self) -> Self {
        Self {
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        }
    }

    /// Execute one closure per node of a level, honoring serial mode and
    /// the repo concurrency cap.
    async fn run_level<F, Fut>(&self, level: Vec<Arc<Node>>, f: F) -> Vec<RepoResult>
    where
        F: Fn(Arc<Node>) -> Fut,
        Fut: std::future::Future<Output = RepoResult> + Send + 'static,
    {
        if self.config.serial {
            let mut results = Vec::new();
            for node in level {
                results.push(f(node).await);
            }
            return results;
        }

        let semaphore = (self.config.max_concurrent_repos > 0)
            .then(|| Arc::new(Semaphore::new(self.config.max_concurrent_repos)));
        let mut set: JoinSet<RepoResult> = JoinSet::new();
        for node in level {
            let fut = f(node);
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                fut.await
            });
        }
        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }
        results
    }

    /// Remove the whole clone cache.
    pub fn cache_clean(&self) -> Result<u64> {
        let repos = self.config.cache_root.join("repos");
        if !repos.exists() {
            return Ok(0);
        }
        let count = count_entries(&repos);
        std::fs::remove_dir_all(&repos)?;
        info!(removed = count, "cache cleaned");
        Ok(count)
    }

    /// Remove cached checkouts whose modification time exceeds `max_age`.
    pub fn cache_prune(&self, max_age: Duration) -> Result<u64> {
        let repos = self.config.cache_root.join("repos");
        let mut removed = 0;
        for owner in read_dirs(&repos) {
            for name in read_dirs(&owner) {
                for branch in read_dirs(&name) {
                    let stale = std::fs::metadata(&branch)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                        .map_or(false, |age| age > max_age);
                    if stale {
                        match std::fs::remove_dir_all(&branch) {
                            Ok(()) => {
                                info!(checkout = %branch.display(), "pruned stale checkout");
                                removed += 1;
                            }
                            Err(e) => {
                                warn!(checkout = %branch.display(), error = %e, "prune failed");
                            }
                        }
                    }
                }
            }
        }
        Ok(removed)
    }
}

struct EdgeJob {
    parent: Arc<Node>,
    child: Arc<Node>,
    artifacts: Vec<String>,
    workflows: Vec<String>,
}

fn count_entries(path: &Path) -> u64 {
    read_dirs(path)
        .iter()
        .map(|owner| {
            read_dirs(owner)
                .iter()
                .map(|name| read_dirs(name).len() as u64)
                .sum::<u64>()
        })
        .sum()
}

fn read_dirs(path: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(path) else {
        return Vec::new();
    };
    entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect()
}
