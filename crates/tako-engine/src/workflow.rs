//! The workflow engine: runs one workflow in one repository.
//!
//! Steps execute strictly in manifest order. Each step's captured result is
//! visible to later steps through the template context, events emitted by a
//! step are handed to the orchestrator before the run can finish, and every
//! state mutation is persisted before execution continues.

use indexmap::IndexMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tako_core::codes::ErrorCode;
use tako_core::event::{scalar_value, EventEnvelope};
use tako_core::expr::{self, ExprError};
use tako_core::inputs::{self, InputError};
use tako_core::manifest::{
    Manifest, ManifestError, OutputSource, ResourceLimits, Step, Workflow,
};
use tako_core::reference::ArtifactRef;
use tako_core::template::{self, EventScope, StepScope, TemplateContext, TemplateError};

use crate::builtins::{parse_fan_out, BuiltinError};
use crate::executor::container::{
    detect_runtime, run_container, BreachAction, ContainerSpec,
};
use crate::executor::shell::run_shell;
use crate::executor::{ExecError, ExecOutcome};
use crate::orchestrator::Orchestrator;
use crate::state::{
    ExecutionState, RunStatus, StateError, StateStore, StepRecord, StepStatus,
};

/// Lines of stderr quoted in step failure messages.
const STDERR_TAIL_LINES: usize = 10;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("workflow `{workflow}` not found in {repo}")]
    WorkflowNotFound { workflow: String, repo: String },
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Expr(#[from] ExprError),
    #[error(transparent)]
    Builtin(#[from] BuiltinError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("step `{step}` failed: {detail}")]
    StepFailed { step: String, detail: String },
    #[error("run cancelled")]
    Cancelled,
}

impl WorkflowError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Manifest(e) => e.code(),
            Self::WorkflowNotFound { .. } => ErrorCode::WorkflowNotFound,
            Self::Input(e) => e.code(),
            Self::Template(e) => e.code(),
            Self::Expr(e) => e.code(),
            Self::Builtin(e) => e.code(),
            Self::Exec(e) => e.code(),
            Self::State(e) => e.code(),
            Self::StepFailed { .. } | Self::Cancelled => ErrorCode::StepFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Run-wide execution switches.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub dry_run: bool,
    pub debug: bool,
    pub continue_on_error: bool,
    pub preserve_tmp: bool,
    /// Outermost tier of the resource cap hierarchy.
    pub global_resources: Option<ResourceLimits>,
}

/// One workflow execution in one repository.
#[derive(Debug)]
pub struct WorkflowEngine {
    pub repo_path: PathBuf,
    pub workspace: PathBuf,
    pub run_id: String,
    pub parent_run_id: Option<String>,
    pub options: ExecOptions,
    pub cancel: CancellationToken,
    pub orchestrator: Orchestrator,
}

impl WorkflowEngine {
    /// Execute `workflow_name`. Boxed because fan-out children recurse back
    /// into this function.
    pub fn execute<'a>(
        &'a self,
        workflow_name: &'a str,
        provided: &'a IndexMap<String, String>,
        event: Option<EventScope>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionState>> + Send + 'a>> {
        Box::pin(self.execute_inner(workflow_name, provided, event, None))
    }

    /// Re-run a previously failed run, skipping steps that completed.
    pub fn resume<'a>(
        &'a self,
        previous: ExecutionState,
        workflow_name: &'a str,
        provided: &'a IndexMap<String, String>,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionState>> + Send + 'a>> {
        Box::pin(self.execute_inner(workflow_name, provided, None, Some(previous)))
    }

    async fn execute_inner(
        &self,
        workflow_name: &str,
        provided: &IndexMap<String, String>,
        event: Option<EventScope>,
        resume_from: Option<ExecutionState>,
    ) -> Result<ExecutionState> {
        let manifest = Manifest::load_from_dir(&self.repo_path)?;
        let workflow = manifest.workflows.get(workflow_name).cloned().ok_or_else(|| {
            WorkflowError::WorkflowNotFound {
                workflow: workflow_name.to_string(),
                repo: self.repo_path.display().to_string(),
            }
        })?;

        let resolved_inputs = inputs::resolve(&workflow, provided)?;

        let store = StateStore::new(&self.workspace);
        let mut state = ExecutionState::new(&self.run_id, workflow_name, &self.repo_path);
        state.parent_run_id = self.parent_run_id.clone();
        state.inputs = resolved_inputs.clone();
        state.status = RunStatus::Running;
        store.save(&state)?;

        info!(
            run = %self.run_id,
            workflow = workflow_name,
            repo = %self.repo_path.display(),
            dry_run = self.options.dry_run,
            "workflow started"
        );

        let mut ctx = TemplateContext {
            inputs: resolved_inputs,
            steps: IndexMap::new(),
            event,
            env: IndexMap::new(),
        };

        // Workflow env entries may reference inputs.
        for entry in &workflow.env {
            if let Some((key, value)) = entry.split_once('=') {
                let expanded = template::expand(value, &ctx)?;
                ctx.env.insert(key.to_string(), expanded);
            }
        }

        // Secrets come from the invoking environment and reach step
        // processes only; their values are scrubbed from captures.
        let mut secret_env = IndexMap::new();
        let mut secret_values = Vec::new();
        for name in &workflow.secrets {
            if let Ok(value) = std::env::var(name) {
                secret_values.push(value.clone());
                secret_env.insert(name.clone(), value);
            } else {
                warn!(secret = %name, "secret not present in the invoking environment");
            }
        }

        let mut resume_from = resume_from;
        let result = self
            .run_steps(
                &manifest,
                &workflow,
                &mut ctx,
                &mut state,
                &store,
                &secret_env,
                &secret_values,
                &mut resume_from,
            )
            .await;

        match result {
            Ok(()) => {
                let children_ok = self.orchestrator.drain(&mut state, &store).await?;
                state.ended_at = Some(chrono::Utc::now());
                state.current_step = None;
                if children_ok {
                    state.status = RunStatus::Completed;
                } else {
                    state.status = RunStatus::Failed;
                    state.error = Some("one or more child workflows failed".into());
                }
                store.save(&state)?;
                Ok(state)
            }
            Err(e) => {
                // Children already scheduled still get joined so nothing
                // outlives the run unobserved.
                let _ = self.orchestrator.drain(&mut state, &store).await;
                state.ended_at = Some(chrono::Utc::now());
                state.status = if matches!(e, WorkflowError::Cancelled) {
                    RunStatus::Cancelled
                } else {
                    RunStatus::Failed
                };
                state.error = Some(e.to_string());
                store.save(&state)?;
                Err(e)
            }
        }
    }

    async fn run_steps(
        &self,
        manifest: &Manifest,
        workflow: &Workflow,
        ctx: &mut TemplateContext,
        state: &mut ExecutionState,
        store: &StateStore,
        secret_env: &IndexMap<String, String>,
        secret_values: &[String],
        resume_from: &mut Option<ExecutionState>,
    ) -> Result<()> {
        for (index, step) in workflow.steps.iter().enumerate() {
            let step_id = step.label(index);

            // Resume: restore completed steps instead of re-running them.
            if resume_from.is_some() {
                let restored = resume_from
                    .as_ref()
                    .and_then(|previous| previous.steps.get(&step_id))
                    .filter(|record| record.status == StepStatus::Completed)
                    .cloned();
                match restored {
                    Some(record) => {
                        ctx.record_step(
                            &step_id,
                            StepScope {
                                result: "success".into(),
                                outputs: record.outputs.clone(),
                            },
                        );
                        state.steps.insert(step_id.clone(), record);
                        store.save(state)?;
                        debug!(step = %step_id, "restored completed step from previous run");
                        continue;
                    }
                    // First non-completed step: everything after re-runs.
                    None => *resume_from = None,
                }
            }

            state.current_step = Some(step_id.clone());
            state.steps.insert(step_id.clone(), StepRecord::default());
            store.save(state)?;

            if self.cancel.is_cancelled() {
                self.mark_step(state, store, &step_id, StepStatus::Cancelled, None)?;
                return Err(WorkflowError::Cancelled);
            }

            if let Some(condition) = &step.condition {
                let program = expr::compile_cached(condition)?;
                if !program.eval_bool(&condition_context(ctx)) {
                    info!(step = %step_id, "condition false, skipping");
                    self.mark_step(state, store, &step_id, StepStatus::Skipped, None)?;
                    ctx.record_step(
                        &step_id,
                        StepScope {
                            result: "skipped".into(),
                            outputs: IndexMap::new(),
                        },
                    );
                    continue;
                }
            }

            if self.options.dry_run {
                info!(step = %step_id, "would run (dry-run)");
                self.mark_step(state, store, &step_id, StepStatus::Skipped, None)?;
                ctx.record_step(
                    &step_id,
                    StepScope {
                        result: "success".into(),
                        outputs: IndexMap::new(),
                    },
                );
                continue;
            }

            if self.options.debug {
                debug_pause(&step_id).await;
            }

            let started = Instant::now();
            {
                let record = state.steps.get_mut(&step_id).expect("step record exists");
                record.status = StepStatus::Running;
                record.started_at = Some(chrono::Utc::now());
            }
            store.save(state)?;

            let step_result = if step.is_builtin() {
                self.run_builtin(manifest, step, &step_id, ctx, state, store)
                    .await
            } else {
                self.run_process(workflow, step, &step_id, ctx, secret_env)
                    .await
                    .map(Some)
            };

            match step_result {
                Ok(outcome) => {
                    let outputs = match &outcome {
                        Some(outcome) => {
                            self.finish_process_step(
                                manifest,
                                step,
                                &step_id,
                                outcome,
                                ctx,
                                state,
                                store,
                                secret_env,
                                secret_values,
                            )
                            .await?
                        }
                        None => IndexMap::new(),
                    };
                    {
                        let record = state.steps.get_mut(&step_id).expect("step record exists");
                        record.status = StepStatus::Completed;
                        record.ended_at = Some(chrono::Utc::now());
                        record.duration_ms = Some(started.elapsed().as_millis() as u64);
                        record.outputs = outputs.clone();
                    }
                    store.save(state)?;
                    ctx.record_step(
                        &step_id,
                        StepScope {
                            result: "success".into(),
                            outputs,
                        },
                    );
                }
                Err(e) => {
                    let detail = e.to_string();
                    {
                        let record = state.steps.get_mut(&step_id).expect("step record exists");
                        record.status = if matches!(e, WorkflowError::Cancelled) {
                            StepStatus::Cancelled
                        } else {
                            StepStatus::Failed
                        };
                        record.ended_at = Some(chrono::Utc::now());
                        record.duration_ms = Some(started.elapsed().as_millis() as u64);
                        record.error = Some(detail.clone());
                    }
                    store.save(state)?;

                    if matches!(e, WorkflowError::Cancelled) {
                        return Err(e);
                    }

                    self.run_failure_steps(workflow, step, &step_id, ctx, secret_env)
                        .await;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Capture, redact, extract outputs, and emit events for a finished
    /// process step. Returns the derived outputs; a non-zero exit is a
    /// `StepFailed`.
    async fn finish_process_step(
        &self,
        manifest: &Manifest,
        step: &Step,
        step_id: &str,
        outcome: &ExecOutcome,
        ctx: &mut TemplateContext,
        state: &mut ExecutionState,
        store: &StateStore,
        secret_env: &IndexMap<String, String>,
        secret_values: &[String],
    ) -> Result<IndexMap<String, String>> {
        {
            let record = state.steps.get_mut(step_id).expect("step record exists");
            record.stdout = redact(&outcome.stdout, secret_values);
            record.stderr = redact(&outcome.stderr, secret_values);
        }
        store.save(state)?;

        if !outcome.success() {
            return Err(WorkflowError::StepFailed {
                step: step_id.to_string(),
                detail: format!(
                    "exit code {}: {}",
                    outcome.exit_code,
                    outcome.stderr_tail(STDERR_TAIL_LINES)
                ),
            });
        }

        let Some(produces) = &step.produces else {
            return Ok(IndexMap::new());
        };

        let mut outputs = IndexMap::new();
        for (name, source) in &produces.outputs {
            let value = match OutputSource::parse(source) {
                OutputSource::Stdout => outcome.stdout.trim_end_matches('\n').to_string(),
                OutputSource::Stderr => outcome.stderr.trim_end_matches('\n').to_string(),
                OutputSource::File(path) => {
                    std::fs::read_to_string(self.repo_path.join(&path))
                        .map(|s| s.trim_end_matches('\n').to_string())
                        .map_err(|e| WorkflowError::StepFailed {
                            step: step_id.to_string(),
                            detail: format!("output `{name}` from file {path}: {e}"),
                        })?
                }
                OutputSource::EnvVar(var) => secret_env
                    .get(&var)
                    .or_else(|| ctx.env.get(&var))
                    .cloned()
                    .unwrap_or_default(),
                OutputSource::Template(text) => template::expand(&text, ctx)?,
            };
            outputs.insert(name.clone(), value);
        }

        // Make this step's outputs visible to its own event payloads.
        ctx.record_step(
            step_id,
            StepScope {
                result: "success".into(),
                outputs: outputs.clone(),
            },
        );

        for event_spec in &produces.events {
            let mut envelope = EventEnvelope::new(&event_spec.event_type);
            if let Some(raw) = &event_spec.schema_version {
                envelope.schema_version =
                    Some(tako_core::schema::parse_exact(raw).map_err(|e| {
                        ManifestError::Invalid {
                            field: "schema_version".into(),
                            reason: e.to_string(),
                        }
                    })?);
            }
            envelope.payload = template::expand_map(&event_spec.payload, ctx)?;

            let artifacts = self.producer_artifacts(manifest, produces.artifact.as_deref());
            self.orchestrator
                .dispatch(state, store, step_id, &artifacts, envelope, false, None, 0)
                .await?;
        }

        Ok(outputs)
    }

    async fn run_builtin(
        &self,
        manifest: &Manifest,
        step: &Step,
        step_id: &str,
        ctx: &mut TemplateContext,
        state: &mut ExecutionState,
        store: &StateStore,
    ) -> Result<Option<ExecOutcome>> {
        let params = parse_fan_out(step)?;

        let mut envelope = EventEnvelope::new(&params.event_type);
        envelope.schema_version = params.schema_version.clone();
        envelope.payload = template::expand_map(&params.payload, ctx)?;

        let artifact_hint = step.produces.as_ref().and_then(|p| p.artifact.as_deref());
        let artifacts = self.producer_artifacts(manifest, artifact_hint);

        let ok = self
            .orchestrator
            .dispatch(
                state,
                store,
                step_id,
                &artifacts,
                envelope,
                params.wait_for_children,
                params.timeout,
                params.concurrency_limit,
            )
            .await?;

        if !ok {
            return Err(WorkflowError::StepFailed {
                step: step_id.to_string(),
                detail: "one or more child workflows failed".into(),
            });
        }
        Ok(None)
    }

    async fn run_process(
        &self,
        workflow: &Workflow,
        step: &Step,
        step_id: &str,
        ctx: &TemplateContext,
        secret_env: &IndexMap<String, String>,
    ) -> Result<ExecOutcome> {
        let command = template::expand(step.run.as_deref().unwrap_or_default(), ctx)?;

        let mut env: IndexMap<String, String> = ctx.env.clone();
        for (key, value) in secret_env {
            env.insert(key.clone(), value.clone());
        }
        for (key, value) in &step.env {
            env.insert(key.clone(), template::expand(value, ctx)?);
        }

        let resources = self.effective_resources(workflow, step);
        let timeout = resources.timeout_seconds.map(Duration::from_secs);

        let image = step.image.clone().or_else(|| workflow.image.clone());
        let outcome = match image {
            Some(image) => {
                let runtime = detect_runtime()?;
                let spec = ContainerSpec {
                    name: container_name(&self.run_id, step_id),
                    image,
                    command,
                    network: step.network.clone(),
                    capabilities: step.capabilities.clone(),
                    security_profile: step.security_profile.clone(),
                    volumes: step.volumes.clone(),
                    env,
                    workspace: self.repo_path.clone(),
                    resources,
                    breach_action: BreachAction::Warn,
                };
                run_container(&runtime, &spec, &self.cancel).await?
            }
            None => run_shell(&command, &self.repo_path, &env, &self.cancel, timeout).await?,
        };
        Ok(outcome)
    }

    /// Best-effort failure handlers; their own failures are logged only.
    async fn run_failure_steps(
        &self,
        workflow: &Workflow,
        step: &Step,
        step_id: &str,
        ctx: &TemplateContext,
        secret_env: &IndexMap<String, String>,
    ) {
        for (index, failure_step) in step.on_failure.iter().enumerate() {
            let label = format!("{step_id}.on_failure[{index}]");
            if failure_step.run.is_none() {
                continue;
            }
            match self
                .run_process(workflow, failure_step, &label, ctx, secret_env)
                .await
            {
                Ok(outcome) if outcome.success() => {
                    debug!(step = %label, "failure handler completed");
                }
                Ok(outcome) => {
                    warn!(step = %label, exit = outcome.exit_code, "failure handler exited non-zero");
                }
                Err(e) => {
                    warn!(step = %label, error = %e, "failure handler errored");
                }
            }
        }
    }

    /// Compose the cap hierarchy: global, then workflow, then step.
    fn effective_resources(&self, workflow: &Workflow, step: &Step) -> ResourceLimits {
        let mut resources = self.options.global_resources.clone().unwrap_or_default();
        if let Some(workflow_resources) = &workflow.resources {
            resources = resources.merged_with(workflow_resources);
        }
        if let Some(step_resources) = &step.resources {
            resources = resources.merged_with(step_resources);
        }
        resources
    }

    /// Artifact references this repository produces events under.
    fn producer_artifacts(&self, manifest: &Manifest, only: Option<&str>) -> Vec<ArtifactRef> {
        let (owner, repo) =
            repo_identity(self.orchestrator.cache_root(), &self.repo_path, manifest);
        manifest
            .artifacts
            .keys()
            .filter(|name| only.map_or(true, |only| only == name.as_str()))
            .map(|name| ArtifactRef {
                owner: owner.clone(),
                repo: repo.clone(),
                artifact: name.clone(),
            })
            .collect()
    }

    fn mark_step(
        &self,
        state: &mut ExecutionState,
        store: &StateStore,
        step_id: &str,
        status: StepStatus,
        error: Option<String>,
    ) -> Result<()> {
        if let Some(record) = state.steps.get_mut(step_id) {
            record.status = status;
            record.error = error;
        }
        store.save(state)?;
        Ok(())
    }
}

/// `owner/name` identity of a repository: derived from its cache path when
/// cached, from a slash-form `metadata.name` otherwise, with a `local`
/// owner as the last resort.
pub fn repo_identity(cache_root: &Path, repo_path: &Path, manifest: &Manifest) -> (String, String) {
    if let Ok(rel) = repo_path.strip_prefix(cache_root.join("repos")) {
        let mut parts = rel.components();
        if let (Some(owner), Some(name)) = (parts.next(), parts.next()) {
            return (
                owner.as_os_str().to_string_lossy().into_owned(),
                name.as_os_str().to_string_lossy().into_owned(),
            );
        }
    }
    let name = manifest.name();
    if let Some((owner, repo)) = name.split_once('/') {
        return (owner.to_string(), repo.to_string());
    }
    ("local".to_string(), name.to_string())
}

/// Evaluation context for step `if` expressions.
fn condition_context(ctx: &TemplateContext) -> serde_json::Value {
    let inputs: serde_json::Map<String, serde_json::Value> = ctx
        .inputs
        .iter()
        .map(|(k, v)| (k.clone(), scalar_value(v)))
        .collect();
    let steps: serde_json::Map<String, serde_json::Value> = ctx
        .steps
        .iter()
        .map(|(id, scope)| {
            let outputs: serde_json::Map<String, serde_json::Value> = scope
                .outputs
                .iter()
                .map(|(k, v)| (k.clone(), scalar_value(v)))
                .collect();
            (
                id.clone(),
                serde_json::json!({ "result": scope.result, "outputs": outputs }),
            )
        })
        .collect();
    let mut root = serde_json::json!({ "inputs": inputs, "steps": steps });
    if let Some(event) = &ctx.event {
        let payload: serde_json::Map<String, serde_json::Value> = event
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), scalar_value(v)))
            .collect();
        root["event"] = serde_json::json!({
            "type": event.event_type,
            "schema_version": event.schema_version,
            "payload": payload,
        });
    }
    root
}

fn container_name(run_id: &str, step_id: &str) -> String {
    let safe_step: String = step_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    format!("tako-{run_id}-{safe_step}")
}

/// Replace secret values in captured output.
fn redact(text: &str, secrets: &[String]) -> String {
    let mut redacted = text.to_string();
    for secret in secrets {
        if !secret.is_empty() {
            redacted = redacted.replace(secret, "***");
        }
    }
    redacted
}

/// Single-interactor pause between steps when `--debug` is set.
async fn debug_pause(step_id: &str) {
    eprintln!("[debug] next step: {step_id} (press enter to continue)");
    let _ = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorShared;
    use crate::state::new_run_id;
    use std::sync::Arc;

    fn engine_for(repo: &Path, workspace: &Path, cache: &Path, options: ExecOptions) -> WorkflowEngine {
        let run_id = new_run_id();
        let cancel = CancellationToken::new();
        let shared = OrchestratorShared::new(cache.to_path_buf(), options.clone());
        let orchestrator = Orchestrator::new(
            Arc::clone(&shared),
            workspace.to_path_buf(),
            run_id.clone(),
            cancel.clone(),
        );
        WorkflowEngine {
            repo_path: repo.to_path_buf(),
            workspace: workspace.to_path_buf(),
            run_id,
            parent_run_id: None,
            options,
            cancel,
            orchestrator,
        }
    }

    fn write_repo(dir: &Path, manifest: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join("tako.yml"), manifest).unwrap();
    }

    fn no_inputs() -> IndexMap<String, String> {
        IndexMap::new()
    }

    #[tokio::test]
    async fn step_outputs_flow_into_later_steps() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  build:
    steps:
      - id: s1
        run: echo output1
        produces:
          outputs:
            result: from_stdout
      - id: s2
        run: "echo {{.Steps.s1.outputs.result}}"
"#,
        );
        let engine = engine_for(&repo, &dir.path().join("ws"), &dir.path().join("cache"), ExecOptions::default());
        let state = engine.execute("build", &no_inputs(), None).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.steps["s1"].outputs["result"], "output1");
        assert_eq!(state.steps["s2"].stdout, "output1\n");
    }

    #[tokio::test]
    async fn false_condition_skips_without_side_effects() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  build:
    inputs:
      environment:
        type: string
        required: true
    steps:
      - id: gated
        if: "inputs.environment == 'prod'"
        run: touch side-effect.txt
      - id: always
        run: echo done
"#,
        );
        let engine = engine_for(&repo, &dir.path().join("ws"), &dir.path().join("cache"), ExecOptions::default());
        let provided = IndexMap::from([("environment".to_string(), "dev".to_string())]);
        let state = engine.execute("build", &provided, None).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.steps["gated"].status, StepStatus::Skipped);
        assert!(state.steps["gated"].outputs.is_empty());
        assert!(!repo.join("side-effect.txt").exists());
        assert_eq!(state.steps["always"].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn failing_step_runs_on_failure_and_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  build:
    steps:
      - id: boom
        run: "echo oops >&2; exit 7"
        on_failure:
          - run: touch cleanup-ran.txt
      - id: never
        run: echo unreachable
"#,
        );
        let engine = engine_for(&repo, &dir.path().join("ws"), &dir.path().join("cache"), ExecOptions::default());
        let err = engine.execute("build", &no_inputs(), None).await.unwrap_err();

        assert!(matches!(err, WorkflowError::StepFailed { .. }));
        assert!(repo.join("cleanup-ran.txt").exists());

        let store = StateStore::new(&dir.path().join("ws"));
        let state = store.load(&engine.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.steps["boom"].status, StepStatus::Failed);
        assert!(state.steps["boom"].stderr.contains("oops"));
        assert!(!state.steps.contains_key("never"));
        assert!(state.is_resumable());
    }

    #[tokio::test]
    async fn dry_run_skips_every_step() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  build:
    steps:
      - id: s1
        run: touch would-be-side-effect.txt
        produces:
          outputs:
            result: from_stdout
      - id: s2
        run: "echo [{{.Steps.s1.outputs.result}}]"
"#,
        );
        let options = ExecOptions {
            dry_run: true,
            ..ExecOptions::default()
        };
        let engine = engine_for(&repo, &dir.path().join("ws"), &dir.path().join("cache"), options);
        let state = engine.execute("build", &no_inputs(), None).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.steps["s1"].status, StepStatus::Skipped);
        assert_eq!(state.steps["s2"].status, StepStatus::Skipped);
        assert!(!repo.join("would-be-side-effect.txt").exists());
    }

    #[tokio::test]
    async fn unknown_workflow_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(&repo, "version: \"1.0.0\"\n");
        let engine = engine_for(&repo, &dir.path().join("ws"), &dir.path().join("cache"), ExecOptions::default());
        let err = engine.execute("missing", &no_inputs(), None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::WorkflowNotFound { .. }));
        assert_eq!(err.code(), ErrorCode::WorkflowNotFound);
    }

    #[tokio::test]
    async fn enum_input_validation_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  deploy:
    inputs:
      environment:
        type: string
        required: true
        validation:
          enum: [dev, staging, prod]
    steps:
      - run: "echo deploying to {{ .Inputs.environment }}"
"#,
        );

        let engine = engine_for(&repo, &dir.path().join("ws1"), &dir.path().join("cache"), ExecOptions::default());
        let bad = IndexMap::from([("environment".to_string(), "invalid".to_string())]);
        let err = engine.execute("deploy", &bad, None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InputInvalid);

        let engine = engine_for(&repo, &dir.path().join("ws2"), &dir.path().join("cache"), ExecOptions::default());
        let err = engine.execute("deploy", &no_inputs(), None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InputInvalid);

        let engine = engine_for(&repo, &dir.path().join("ws3"), &dir.path().join("cache"), ExecOptions::default());
        let good = IndexMap::from([("environment".to_string(), "staging".to_string())]);
        let state = engine.execute("deploy", &good, None).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.steps["step-1"].stdout.contains("deploying to staging"));
    }

    #[tokio::test]
    async fn workflow_env_reaches_steps_but_host_env_does_not() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  build:
    env:
      - REGION=eu-west-1
    steps:
      - id: probe
        run: "echo region=${REGION:-unset} leak=${TAKO_WF_LEAK:-clean}"
        env:
          EXTRA: "{{ .env.REGION }}"
      - id: extra
        run: "echo extra=${EXTRA:-unset}"
"#,
        );
        std::env::set_var("TAKO_WF_LEAK", "leaked");
        let engine = engine_for(&repo, &dir.path().join("ws"), &dir.path().join("cache"), ExecOptions::default());
        let state = engine.execute("build", &no_inputs(), None).await.unwrap();
        assert!(state.steps["probe"].stdout.contains("region=eu-west-1"));
        assert!(state.steps["probe"].stdout.contains("leak=clean"));
    }

    #[tokio::test]
    async fn secrets_are_redacted_from_captures() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  build:
    secrets:
      - TAKO_TEST_SECRET
    steps:
      - id: leaky
        run: "echo token is $TAKO_TEST_SECRET"
"#,
        );
        std::env::set_var("TAKO_TEST_SECRET", "s3cr3t-value");
        let engine = engine_for(&repo, &dir.path().join("ws"), &dir.path().join("cache"), ExecOptions::default());
        let state = engine.execute("build", &no_inputs(), None).await.unwrap();
        assert_eq!(state.steps["leaky"].stdout, "token is ***\n");
    }

    #[tokio::test]
    async fn resume_skips_completed_steps() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        let marker = repo.join("flaky-ok");
        write_repo(
            &repo,
            r#"
version: "1.0.0"
workflows:
  build:
    steps:
      - id: once
        run: "echo ran | tee -a once.log"
        produces:
          outputs:
            result: from_stdout
      - id: flaky
        run: "test -f flaky-ok"
      - id: last
        run: "echo {{ .Steps.once.outputs.result }}"
"#,
        );
        let workspace = dir.path().join("ws");
        let engine = engine_for(&repo, &workspace, &dir.path().join("cache"), ExecOptions::default());
        let run_id = engine.run_id.clone();
        let err = engine.execute("build", &no_inputs(), None).await;
        assert!(err.is_err());

        // Heal the failure, then resume under the same run id.
        std::fs::write(&marker, "").unwrap();
        let store = StateStore::new(&workspace);
        let previous = store.load(&run_id).unwrap();
        assert!(previous.is_resumable());

        let engine2 = WorkflowEngine {
            run_id: run_id.clone(),
            ..engine_for(&repo, &workspace, &dir.path().join("cache"), ExecOptions::default())
        };
        let state = engine2
            .resume(previous, "build", &no_inputs())
            .await
            .unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.steps["last"].stdout, "ran\n");
        // The completed step did not re-run.
        let log = std::fs::read_to_string(repo.join("once.log")).unwrap();
        assert_eq!(log, "ran\n");
    }

    #[test]
    fn repo_identity_prefers_cache_layout() {
        let cache = Path::new("/cache");
        let manifest: Manifest = serde_yaml::from_str("version: \"1.0.0\"\n").unwrap();
        assert_eq!(
            repo_identity(cache, Path::new("/cache/repos/acme/widgets/main"), &manifest),
            ("acme".to_string(), "widgets".to_string())
        );

        let named: Manifest =
            serde_yaml::from_str("version: \"1.0.0\"\nmetadata:\n  name: acme/widgets\n").unwrap();
        assert_eq!(
            repo_identity(cache, Path::new("/elsewhere/widgets"), &named),
            ("acme".to_string(), "widgets".to_string())
        );

        let bare: Manifest =
            serde_yaml::from_str("version: \"1.0.0\"\nmetadata:\n  name: widgets\n").unwrap();
        assert_eq!(
            repo_identity(cache, Path::new("/elsewhere/widgets"), &bare),
            ("local".to_string(), "widgets".to_string())
        );
    }

    #[test]
    fn redact_replaces_all_occurrences() {
        assert_eq!(
            redact("key=abc also abc", &["abc".to_string()]),
            "key=*** also ***"
        );
        assert_eq!(redact("clean", &[]), "clean");
    }

    #[test]
    fn container_names_are_shell_safe() {
        assert_eq!(
            container_name("exec-20240101-000000-ab", "step 1/2"),
            "tako-exec-20240101-000000-ab-step-1-2"
        );
    }
}
