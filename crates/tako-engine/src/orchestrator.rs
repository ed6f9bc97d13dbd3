//! Hybrid orchestration: event-driven propagation to subscriber
//! repositories, with idempotency, diamond resolution, circuit breaking,
//! and bounded child concurrency.
//!
//! Every fan-out walks the same pipeline: discover subscribers → apply
//! schema and filter predicates → resolve diamonds (first subscription in
//! deterministic order wins per repository) → drop duplicate triggers via
//! the per-run idempotency map → dispatch survivors through a worker pool.
//! Children run in isolated workspaces produced by the child factory and
//! are always joined before the owning workflow reaches terminal status.

use chrono::Utc;
use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tako_core::event::EventEnvelope;
use tako_core::manifest::Subscription;
use tako_core::reference::ArtifactRef;
use tako_core::schema::SchemaRange;
use tako_core::template::{self, EventScope, TemplateContext};

use crate::children::ChildRunnerFactory;
use crate::discovery::{find_subscribers, SubscriberMatch};
use crate::state::{
    ChildOutcome, ExecutionState, FanOutRecord, FanOutStatus, RunStatus, StateStore,
    SubscriberRecord,
};
use crate::workflow::{ExecOptions, WorkflowEngine, WorkflowError};

/// Consecutive failures before a (repo, workflow) pair trips its breaker.
const BREAKER_THRESHOLD: u32 = 3;
/// Base cool-down; doubles on every subsequent trip.
const BREAKER_BASE_COOLDOWN: Duration = Duration::from_secs(30);
/// Grace period granted to children after a fan-out timeout fires.
const TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// State shared by every orchestrator instance in one run tree.
#[derive(Debug)]
pub struct OrchestratorShared {
    pub cache_root: PathBuf,
    pub options: ExecOptions,
    /// `(repo path, workflow)` → child run id; a key present here never
    /// triggers twice within the run.
    idempotency: Mutex<HashMap<(String, String), String>>,
    breakers: Mutex<HashMap<(String, String), BreakerState>>,
}

impl OrchestratorShared {
    pub fn new(cache_root: PathBuf, options: ExecOptions) -> Arc<Self> {
        Arc::new(Self {
            cache_root,
            options,
            idempotency: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
        })
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    trips: u32,
    open_until: Option<Instant>,
}

impl BreakerState {
    fn is_open(&self) -> bool {
        self.open_until.is_some_and(|until| Instant::now() < until)
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= BREAKER_THRESHOLD {
            self.trips += 1;
            let cooldown = BREAKER_BASE_COOLDOWN * 2u32.saturating_pow(self.trips - 1);
            self.open_until = Some(Instant::now() + cooldown);
            self.consecutive_failures = 0;
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.trips = 0;
        self.open_until = None;
    }
}

/// Result of one child workflow.
#[derive(Debug, Clone)]
pub struct ChildReport {
    pub repo_path: String,
    pub workflow: String,
    pub child_run_id: Option<String>,
    pub outcome: ChildOutcome,
    pub error: Option<String>,
}

/// A scheduled child still in flight.
#[derive(Debug)]
struct PendingChild {
    fan_out_id: String,
    repo_path: String,
    workflow: String,
    handle: JoinHandle<ChildReport>,
}

/// Per-workflow-run orchestrator. Each child run gets its own instance
/// rooted at its workspace, sharing the run-wide maps.
#[derive(Debug)]
pub struct Orchestrator {
    shared: Arc<OrchestratorShared>,
    workspace: PathBuf,
    run_id: String,
    cancel: CancellationToken,
    pending: Mutex<Vec<PendingChild>>,
}

impl Orchestrator {
    pub fn new(
        shared: Arc<OrchestratorShared>,
        workspace: PathBuf,
        run_id: String,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            shared,
            workspace,
            run_id,
            cancel,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn cache_root(&self) -> &std::path::Path {
        &self.shared.cache_root
    }

    /// Propagate one event. `wait` semantics follow the caller: a plain
    /// `produces.events` emission schedules and returns; the fan-out
    /// built-in may wait, bound concurrency, and time out.
    pub async fn dispatch(
        &self,
        state: &mut ExecutionState,
        store: &StateStore,
        step_id: &str,
        producer_artifacts: &[ArtifactRef],
        event: EventEnvelope,
        wait: bool,
        timeout: Option<Duration>,
        concurrency_limit: usize,
    ) -> Result<bool, WorkflowError> {
        let fan_out_id = fan_out_id(&self.run_id, step_id, &event.event_type);
        let mut record = FanOutRecord {
            fan_out_id: fan_out_id.clone(),
            status: FanOutStatus::Pending,
            event: event.clone(),
            subscribers: Vec::new(),
            started_at: Some(Utc::now()),
            ended_at: None,
        };
        state.fan_outs.insert(fan_out_id.clone(), record.clone());
        store.save(state)?;

        record.status = FanOutStatus::Discovering;
        persist_record(state, store, &record)?;

        let matches = self.discover(producer_artifacts, &event.event_type);
        info!(
            fan_out = %fan_out_id,
            event = %event.event_type,
            candidates = matches.len(),
            "discovered subscribers"
        );

        let triggers = self.select_triggers(&event, matches, &mut record);
        record.status = FanOutStatus::Scheduling;
        persist_record(state, store, &record)?;

        let semaphore = (concurrency_limit > 0).then(|| Arc::new(Semaphore::new(concurrency_limit)));
        let fan_out_cancel = self.cancel.child_token();
        let mut children = Vec::new();
        for trigger in triggers {
            let handle = self.spawn_child(&trigger, &fan_out_cancel, semaphore.clone());
            children.push(PendingChild {
                fan_out_id: fan_out_id.clone(),
                repo_path: trigger.repo_path.display().to_string(),
                workflow: trigger.workflow.clone(),
                handle,
            });
        }

        record.status = FanOutStatus::Running;
        persist_record(state, store, &record)?;

        if wait {
            let (reports, timed_out) = join_children(children, timeout, &fan_out_cancel).await;
            for report in &reports {
                self.note_outcome(report);
                apply_report(&mut record, report);
            }
            record.status = if timed_out {
                FanOutStatus::TimedOut
            } else if record_children_ok(&record) {
                FanOutStatus::Completed
            } else {
                FanOutStatus::Failed
            };
            record.ended_at = Some(Utc::now());
            persist_record(state, store, &record)?;

            let ok = !timed_out && record_children_ok(&record);
            Ok(ok || self.shared.options.continue_on_error)
        } else {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.extend(children);
            Ok(true)
        }
    }

    /// Join every fire-and-forget child scheduled by this run and finalize
    /// its fan-out record. Called by the workflow engine before the run
    /// reaches terminal status.
    pub async fn drain(
        &self,
        state: &mut ExecutionState,
        store: &StateStore,
    ) -> Result<bool, WorkflowError> {
        let children: Vec<PendingChild> = {
            let mut pending = self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            pending.drain(..).collect()
        };
        if children.is_empty() {
            return Ok(true);
        }

        let mut all_ok = true;
        let mut by_fan_out: HashMap<String, Vec<ChildReport>> = HashMap::new();
        for child in children {
            let fan_out_id = child.fan_out_id.clone();
            let report = match child.handle.await {
                Ok(report) => report,
                Err(e) => ChildReport {
                    repo_path: child.repo_path,
                    workflow: child.workflow,
                    child_run_id: None,
                    outcome: ChildOutcome::ExecutionFailed,
                    error: Some(e.to_string()),
                },
            };
            self.note_outcome(&report);
            all_ok &= report.outcome.is_success();
            by_fan_out.entry(fan_out_id).or_default().push(report);
        }

        for (fan_out_id, reports) in by_fan_out {
            if let Some(record) = state.fan_outs.get_mut(&fan_out_id) {
                for report in &reports {
                    apply_report(record, report);
                }
                record.status = if record_children_ok(record) {
                    FanOutStatus::Completed
                } else {
                    FanOutStatus::Failed
                };
                record.ended_at = Some(Utc::now());
            }
        }
        store.save(state)?;

        Ok(all_ok || self.shared.options.continue_on_error)
    }

    fn discover(&self, artifacts: &[ArtifactRef], event_type: &str) -> Vec<SubscriberMatch> {
        let mut merged: Vec<SubscriberMatch> = Vec::new();
        for artifact in artifacts {
            for candidate in find_subscribers(&self.shared.cache_root, artifact, event_type) {
                let duplicate = merged.iter().any(|m| {
                    m.repo_path == candidate.repo_path
                        && m.subscription_index == candidate.subscription_index
                });
                if !duplicate {
                    merged.push(candidate);
                }
            }
        }
        merged.sort_by(|a, b| {
            (a.repo_name.as_str(), a.subscription_index)
                .cmp(&(b.repo_name.as_str(), b.subscription_index))
        });
        merged
    }

    /// Apply the schema, filter, diamond, idempotency and breaker
    /// predicates; everything skipped is recorded with its reason.
    fn select_triggers(
        &self,
        event: &EventEnvelope,
        matches: Vec<SubscriberMatch>,
        record: &mut FanOutRecord,
    ) -> Vec<Trigger> {
        let mut winners: HashMap<PathBuf, String> = HashMap::new();
        let mut triggers = Vec::new();

        for candidate in matches {
            let repo = candidate.repo_path.display().to_string();
            let workflow = candidate.subscription.workflow.clone();
            let mut subscriber = SubscriberRecord {
                repo: repo.clone(),
                workflow: workflow.clone(),
                child_run_id: None,
                outcome: None,
                skipped_reason: None,
                error: None,
            };

            if !schema_compatible(event, &candidate.subscription) {
                debug!(repo = %candidate.repo_name, workflow = %workflow, "schema incompatible");
                subscriber.skipped_reason = Some("schema_incompatible".into());
                record.subscribers.push(subscriber);
                continue;
            }

            if !filters_pass(event, &candidate.subscription) {
                debug!(repo = %candidate.repo_name, workflow = %workflow, "filtered out");
                subscriber.skipped_reason = Some("filtered_out".into());
                record.subscribers.push(subscriber);
                continue;
            }

            if let Some(chosen) = winners.get(&candidate.repo_path) {
                subscriber.skipped_reason = Some(format!("shadowed_by_{chosen}"));
                record.subscribers.push(subscriber);
                continue;
            }

            let key = (repo.clone(), workflow.clone());
            {
                let idempotency = self
                    .shared
                    .idempotency
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(existing) = idempotency.get(&key) {
                    subscriber.child_run_id = Some(existing.clone());
                    subscriber.skipped_reason = Some("already_triggered".into());
                    record.subscribers.push(subscriber);
                    winners.insert(candidate.repo_path.clone(), workflow);
                    continue;
                }
            }

            {
                let mut breakers = self
                    .shared
                    .breakers
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if breakers.entry(key.clone()).or_default().is_open() {
                    warn!(repo = %candidate.repo_name, workflow = %workflow, "circuit breaker open");
                    subscriber.outcome = Some(ChildOutcome::CircuitBreakerOpen);
                    subscriber.error = Some("circuit breaker open".into());
                    record.subscribers.push(subscriber);
                    winners.insert(candidate.repo_path.clone(), workflow);
                    continue;
                }
            }

            winners.insert(candidate.repo_path.clone(), workflow.clone());
            record.subscribers.push(subscriber);
            triggers.push(Trigger {
                repo_path: candidate.repo_path,
                repo_name: candidate.repo_name,
                workflow,
                subscription: candidate.subscription,
                event: event.clone(),
            });
        }

        triggers
    }

    fn spawn_child(
        &self,
        trigger: &Trigger,
        fan_out_cancel: &CancellationToken,
        semaphore: Option<Arc<Semaphore>>,
    ) -> JoinHandle<ChildReport> {
        let shared = Arc::clone(&self.shared);
        let factory =
            ChildRunnerFactory::new(self.workspace.clone(), self.shared.cache_root.clone());
        let parent_run_id = self.run_id.clone();
        let cancel = fan_out_cancel.child_token();
        let trigger = trigger.clone();

        tokio::spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => return failed_report(&trigger, "worker pool closed"),
                },
                None => None,
            };
            run_child(shared, factory, parent_run_id, cancel, trigger).await
        })
    }

    /// Record the child run id and breaker outcome for a completed child.
    fn note_outcome(&self, report: &ChildReport) {
        let key = (report.repo_path.clone(), report.workflow.clone());
        if let Some(run_id) = &report.child_run_id {
            let mut idempotency = self
                .shared
                .idempotency
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            idempotency.entry(key.clone()).or_insert_with(|| run_id.clone());
        }
        let mut breakers = self
            .shared
            .breakers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let breaker = breakers.entry(key).or_default();
        if report.outcome.is_success() {
            breaker.record_success();
        } else {
            breaker.record_failure();
        }
    }

    /// Mark the idempotency key as taken before the child starts, so
    /// concurrent fan-outs in the same run cannot double-trigger.
    pub(crate) fn reserve(&self, repo_path: &str, workflow: &str, child_run_id: &str) {
        let mut idempotency = self
            .shared
            .idempotency
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        idempotency
            .entry((repo_path.to_string(), workflow.to_string()))
            .or_insert_with(|| child_run_id.to_string());
    }
}

#[derive(Debug, Clone)]
struct Trigger {
    repo_path: PathBuf,
    repo_name: String,
    workflow: String,
    subscription: Subscription,
    event: EventEnvelope,
}

fn failed_report(trigger: &Trigger, error: &str) -> ChildReport {
    ChildReport {
        repo_path: trigger.repo_path.display().to_string(),
        workflow: trigger.workflow.clone(),
        child_run_id: None,
        outcome: ChildOutcome::ExecutionFailed,
        error: Some(error.to_string()),
    }
}

/// Provision a workspace and run one subscriber workflow to completion.
async fn run_child(
    shared: Arc<OrchestratorShared>,
    factory: ChildRunnerFactory,
    parent_run_id: String,
    cancel: CancellationToken,
    trigger: Trigger,
) -> ChildReport {
    let child = match factory.create_child(&trigger.repo_path) {
        Ok(child) => child,
        Err(e) => return failed_report(&trigger, &e.to_string()),
    };

    let event_scope = EventScope {
        event_type: trigger.event.event_type.clone(),
        schema_version: trigger.event.schema_version.as_ref().map(ToString::to_string),
        payload: trigger.event.payload.clone(),
    };
    let input_ctx = TemplateContext {
        event: Some(event_scope.clone()),
        ..TemplateContext::default()
    };
    let mut provided = IndexMap::new();
    for (name, source) in &trigger.subscription.inputs {
        match template::expand(source, &input_ctx) {
            Ok(value) => {
                provided.insert(name.clone(), value);
            }
            Err(e) => return failed_report(&trigger, &e.to_string()),
        }
    }

    let child_run_id = child.run_id.clone();
    let orchestrator = Orchestrator::new(
        Arc::clone(&shared),
        child.workspace.clone(),
        child_run_id.clone(),
        cancel.clone(),
    );
    orchestrator.reserve(
        &trigger.repo_path.display().to_string(),
        &trigger.workflow,
        &child_run_id,
    );

    let engine = WorkflowEngine {
        repo_path: child.repo_path.clone(),
        workspace: child.workspace.clone(),
        run_id: child_run_id.clone(),
        parent_run_id: Some(parent_run_id),
        options: shared.options.clone(),
        cancel,
        orchestrator,
    };

    info!(
        repo = %trigger.repo_name,
        workflow = %trigger.workflow,
        child_run = %child_run_id,
        "starting child workflow"
    );

    let result = engine
        .execute(&trigger.workflow, &provided, Some(event_scope))
        .await;

    let (outcome, error) = match result {
        Ok(state) if state.status == RunStatus::Completed => (ChildOutcome::Success, None),
        Ok(state) => (
            ChildOutcome::WorkflowFailed,
            state.error.or_else(|| Some("workflow failed".into())),
        ),
        Err(WorkflowError::StepFailed { step, detail }) => (
            ChildOutcome::WorkflowFailed,
            Some(format!("step {step} failed: {detail}")),
        ),
        Err(WorkflowError::Cancelled) => {
            (ChildOutcome::ExecutionFailed, Some("cancelled".into()))
        }
        Err(e) => (ChildOutcome::ExecutionFailed, Some(e.to_string())),
    };

    ChildReport {
        repo_path: trigger.repo_path.display().to_string(),
        workflow: trigger.workflow.clone(),
        child_run_id: Some(child_run_id),
        outcome,
        error,
    }
}

/// Await all children, cancelling and reclassifying on timeout.
async fn join_children(
    children: Vec<PendingChild>,
    timeout: Option<Duration>,
    fan_out_cancel: &CancellationToken,
) -> (Vec<ChildReport>, bool) {
    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let mut timed_out = false;
    let mut reports = Vec::with_capacity(children.len());

    for child in children {
        let mut handle = child.handle;
        let joined = if timed_out {
            // Timeout already fired: give this child the grace period only.
            match tokio::time::timeout(TIMEOUT_GRACE, &mut handle).await {
                Ok(result) => Some(result),
                Err(_) => {
                    handle.abort();
                    None
                }
            }
        } else if let Some(deadline) = deadline {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(result) => Some(result),
                Err(_) => {
                    warn!("fan-out timed out, cancelling children");
                    timed_out = true;
                    fan_out_cancel.cancel();
                    match tokio::time::timeout(TIMEOUT_GRACE, &mut handle).await {
                        Ok(result) => Some(result),
                        Err(_) => {
                            handle.abort();
                            None
                        }
                    }
                }
            }
        } else {
            Some(handle.await)
        };

        let mut report = match joined {
            Some(Ok(report)) => report,
            Some(Err(e)) => ChildReport {
                repo_path: child.repo_path,
                workflow: child.workflow,
                child_run_id: None,
                outcome: ChildOutcome::ExecutionFailed,
                error: Some(e.to_string()),
            },
            None => ChildReport {
                repo_path: child.repo_path,
                workflow: child.workflow,
                child_run_id: None,
                outcome: ChildOutcome::Timeout,
                error: Some("did not finish before the fan-out timeout".into()),
            },
        };
        if timed_out && !report.outcome.is_success() {
            report.outcome = ChildOutcome::Timeout;
        }
        reports.push(report);
    }

    (reports, timed_out)
}

fn schema_compatible(event: &EventEnvelope, subscription: &Subscription) -> bool {
    let Some(range) = &subscription.schema_version else {
        return true;
    };
    let Ok(range) = SchemaRange::parse(range) else {
        return false;
    };
    match &event.schema_version {
        Some(version) => range.matches(version),
        None => false,
    }
}

fn filters_pass(event: &EventEnvelope, subscription: &Subscription) -> bool {
    if subscription.filters.is_empty() {
        return true;
    }
    let ctx = event.filter_context(subscription);
    subscription.filters.iter().all(|filter| {
        match tako_core::expr::compile_cached(filter) {
            Ok(program) => program.eval_bool(&ctx),
            Err(e) => {
                warn!(filter, error = %e, "filter failed to compile, treating as non-match");
                false
            }
        }
    })
}

fn apply_report(record: &mut FanOutRecord, report: &ChildReport) {
    let subscriber = record.subscribers.iter_mut().find(|s| {
        s.repo == report.repo_path && s.workflow == report.workflow && s.skipped_reason.is_none()
    });
    if let Some(subscriber) = subscriber {
        subscriber.child_run_id = report.child_run_id.clone();
        subscriber.outcome = Some(report.outcome);
        subscriber.error = report.error.clone();
    }
}

/// True when every dispatched subscriber either succeeded or was skipped.
fn record_children_ok(record: &FanOutRecord) -> bool {
    record.subscribers.iter().all(|s| {
        s.skipped_reason.is_some() || s.outcome.is_some_and(|outcome| outcome.is_success())
    })
}

fn persist_record(
    state: &mut ExecutionState,
    store: &StateStore,
    record: &FanOutRecord,
) -> Result<(), WorkflowError> {
    state
        .fan_outs
        .insert(record.fan_out_id.clone(), record.clone());
    store.save(state)?;
    Ok(())
}

/// Stable fan-out identifier derived from run, step, and event type.
fn fan_out_id(run_id: &str, step_id: &str, event_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(step_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(event_type.as_bytes());
    let digest = hasher.finalize();
    format!("fanout-{}", hex_prefix(&digest, 8))
}

fn hex_prefix(bytes: &[u8], len: usize) -> String {
    bytes
        .iter()
        .take(len)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn event(version: Option<&str>, env: &str) -> EventEnvelope {
        let mut event = EventEnvelope::new("library_built");
        event.schema_version = version.map(|v| Version::parse(v).unwrap());
        event.payload.insert("environment".into(), env.into());
        event
    }

    fn subscription(range: Option<&str>, filters: &[&str]) -> Subscription {
        Subscription {
            artifact: "acme/widgets:lib".into(),
            events: vec!["library_built".into()],
            schema_version: range.map(ToString::to_string),
            filters: filters.iter().map(ToString::to_string).collect(),
            workflow: "deploy".into(),
            inputs: IndexMap::new(),
        }
    }

    #[test]
    fn schema_and_filter_predicates_compose() {
        let sub = subscription(Some("^1.0.0"), &["payload.environment == 'prod'"]);

        let prod_v1 = event(Some("1.1.0"), "prod");
        assert!(schema_compatible(&prod_v1, &sub));
        assert!(filters_pass(&prod_v1, &sub));

        let dev_v1 = event(Some("1.1.0"), "dev");
        assert!(schema_compatible(&dev_v1, &sub));
        assert!(!filters_pass(&dev_v1, &sub));

        let prod_v2 = event(Some("2.0.0"), "prod");
        assert!(!schema_compatible(&prod_v2, &sub));
    }

    #[test]
    fn missing_event_version_fails_a_declared_range() {
        let sub = subscription(Some("^1.0.0"), &[]);
        assert!(!schema_compatible(&event(None, "prod"), &sub));

        let no_range = subscription(None, &[]);
        assert!(schema_compatible(&event(None, "prod"), &no_range));
    }

    #[test]
    fn breaker_opens_after_threshold_and_backs_off() {
        let mut breaker = BreakerState::default();
        assert!(!breaker.is_open());
        breaker.record_failure();
        breaker.record_failure();
        assert!(!breaker.is_open());
        breaker.record_failure();
        assert!(breaker.is_open());
        assert_eq!(breaker.trips, 1);

        breaker.record_success();
        assert!(!breaker.is_open());
        assert_eq!(breaker.trips, 0);
    }

    #[test]
    fn fan_out_id_is_stable_and_distinct() {
        let a = fan_out_id("exec-1", "s1", "library_built");
        let b = fan_out_id("exec-1", "s1", "library_built");
        let c = fan_out_id("exec-1", "s2", "library_built");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("fanout-"));
        assert_eq!(a.len(), "fanout-".len() + 16);
    }

    #[test]
    fn record_children_ok_counts_only_dispatched() {
        let mut record = FanOutRecord {
            fan_out_id: "fanout-x".into(),
            status: FanOutStatus::Running,
            event: event(None, "prod"),
            subscribers: vec![
                SubscriberRecord {
                    repo: "/a".into(),
                    workflow: "alpha".into(),
                    child_run_id: Some("exec-child".into()),
                    outcome: Some(ChildOutcome::Success),
                    skipped_reason: None,
                    error: None,
                },
                SubscriberRecord {
                    repo: "/a".into(),
                    workflow: "beta".into(),
                    child_run_id: None,
                    outcome: None,
                    skipped_reason: Some("shadowed_by_alpha".into()),
                    error: None,
                },
            ],
            started_at: None,
            ended_at: None,
        };
        assert!(record_children_ok(&record));

        record.subscribers[0].outcome = Some(ChildOutcome::WorkflowFailed);
        assert!(!record_children_ok(&record));
    }
}
