//! End-to-end propagation tests: fan-out, diamond resolution, idempotency,
//! filters, and schema compatibility across cached subscriber repositories.

use indexmap::IndexMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tako_engine::orchestrator::{Orchestrator, OrchestratorShared};
use tako_engine::state::{new_run_id, ChildOutcome, FanOutStatus, RunStatus};
use tako_engine::workflow::{ExecOptions, WorkflowEngine};

struct Fixture {
    _dir: tempfile::TempDir,
    cache_root: PathBuf,
    workspace: PathBuf,
    outdir: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cache_root = dir.path().join("cache");
        let workspace = dir.path().join("ws");
        let outdir = dir.path().join("out");
        std::fs::create_dir_all(&workspace).unwrap();
        std::fs::create_dir_all(&outdir).unwrap();
        Self {
            _dir: dir,
            cache_root,
            workspace,
            outdir,
        }
    }

    fn write_cached_repo(&self, owner: &str, name: &str, manifest: &str) -> PathBuf {
        let repo = self
            .cache_root
            .join("repos")
            .join(owner)
            .join(name)
            .join("main");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("tako.yml"), manifest).unwrap();
        repo
    }

    fn engine(&self, repo: &Path) -> WorkflowEngine {
        let run_id = new_run_id();
        let cancel = CancellationToken::new();
        let shared = OrchestratorShared::new(self.cache_root.clone(), ExecOptions::default());
        let orchestrator = Orchestrator::new(
            Arc::clone(&shared),
            self.workspace.clone(),
            run_id.clone(),
            cancel.clone(),
        );
        WorkflowEngine {
            repo_path: repo.to_path_buf(),
            workspace: self.workspace.clone(),
            run_id,
            parent_run_id: None,
            options: ExecOptions::default(),
            cancel,
            orchestrator,
        }
    }

    fn run_log(&self) -> Vec<String> {
        std::fs::read_to_string(self.outdir.join("runs.log"))
            .unwrap_or_default()
            .lines()
            .map(ToString::to_string)
            .collect()
    }
}

fn producer_manifest(extra_steps: &str) -> String {
    format!(
        r#"
version: "1.0.0"
metadata:
  name: producer
artifacts:
  lib:
    path: out/lib.tar.gz
workflows:
  release:
    inputs:
      outdir:
        type: string
        required: true
      environment:
        type: string
        required: true
    steps:
      - id: fan
        uses: tako/fan-out@v1
        with:
          event_type: library_built
          wait_for_children: true
          schema_version: "1.1.0"
          payload:
            outdir: "{{{{ .Inputs.outdir }}}}"
            environment: "{{{{ .Inputs.environment }}}}"
{extra_steps}"#
    )
}

fn subscriber_workflow(name: &str) -> String {
    format!(
        r#"  {name}:
    inputs:
      outdir:
        type: string
        required: true
    steps:
      - run: "echo {name} >> {{{{ .Inputs.outdir }}}}/runs.log"
"#
    )
}

fn inputs(outdir: &Path, environment: &str) -> IndexMap<String, String> {
    IndexMap::from([
        ("outdir".to_string(), outdir.display().to_string()),
        ("environment".to_string(), environment.to_string()),
    ])
}

#[tokio::test]
async fn fan_out_diamond_runs_each_subscriber_once() {
    let fixture = Fixture::new();
    let producer = fixture.write_cached_repo("acme", "producer", &producer_manifest(""));

    // S1 declares two subscriptions that both match; only the first runs.
    fixture.write_cached_repo(
        "acme",
        "s1",
        &format!(
            r#"
version: "1.0.0"
metadata:
  name: s1
workflows:
{}{}subscriptions:
  - artifact: acme/producer:lib
    events: [library_built]
    workflow: alpha
    inputs:
      outdir: "{{{{ .event.payload.outdir }}}}"
  - artifact: acme/producer:lib
    events: [library_built]
    workflow: beta
    inputs:
      outdir: "{{{{ .event.payload.outdir }}}}"
"#,
            subscriber_workflow("alpha"),
            subscriber_workflow("beta"),
        ),
    );
    fixture.write_cached_repo(
        "acme",
        "s2",
        &format!(
            r#"
version: "1.0.0"
metadata:
  name: s2
workflows:
{}subscriptions:
  - artifact: acme/producer:lib
    events: [library_built]
    workflow: gamma
    inputs:
      outdir: "{{{{ .event.payload.outdir }}}}"
"#,
            subscriber_workflow("gamma"),
        ),
    );

    let engine = fixture.engine(&producer);
    let state = engine
        .execute("release", &inputs(&fixture.outdir, "prod"), None)
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);

    let mut log = fixture.run_log();
    log.sort();
    assert_eq!(log, ["alpha", "gamma"], "beta must be shadowed");

    // The fan-out record tells the same story.
    let fan_out = state.fan_outs.values().next().unwrap();
    assert_eq!(fan_out.status, FanOutStatus::Completed);

    let alpha = fan_out
        .subscribers
        .iter()
        .find(|s| s.workflow == "alpha")
        .unwrap();
    assert_eq!(alpha.outcome, Some(ChildOutcome::Success));
    assert!(alpha.child_run_id.is_some());

    let beta = fan_out
        .subscribers
        .iter()
        .find(|s| s.workflow == "beta")
        .unwrap();
    assert_eq!(beta.skipped_reason.as_deref(), Some("shadowed_by_alpha"));
    assert!(beta.outcome.is_none());

    let gamma = fan_out
        .subscribers
        .iter()
        .find(|s| s.workflow == "gamma")
        .unwrap();
    assert_eq!(gamma.outcome, Some(ChildOutcome::Success));
}

#[tokio::test]
async fn second_fan_out_in_same_run_is_idempotent() {
    let fixture = Fixture::new();
    let again = r#"      - id: fan-again
        uses: tako/fan-out@v1
        with:
          event_type: library_built
          wait_for_children: true
          schema_version: "1.1.0"
          payload:
            outdir: "{{ .Inputs.outdir }}"
            environment: "{{ .Inputs.environment }}"
"#;
    let producer = fixture.write_cached_repo("acme", "producer", &producer_manifest(again));
    fixture.write_cached_repo(
        "acme",
        "s1",
        &format!(
            r#"
version: "1.0.0"
metadata:
  name: s1
workflows:
{}subscriptions:
  - artifact: acme/producer:lib
    events: [library_built]
    workflow: alpha
    inputs:
      outdir: "{{{{ .event.payload.outdir }}}}"
"#,
            subscriber_workflow("alpha"),
        ),
    );

    let engine = fixture.engine(&producer);
    let state = engine
        .execute("release", &inputs(&fixture.outdir, "prod"), None)
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);

    assert_eq!(fixture.run_log(), ["alpha"], "alpha must run exactly once");

    let second = state.fan_outs.values().nth(1).unwrap();
    let repeated = &second.subscribers[0];
    assert_eq!(
        repeated.skipped_reason.as_deref(),
        Some("already_triggered")
    );
    assert!(repeated.child_run_id.is_some());
}

#[tokio::test]
async fn filters_and_schema_ranges_gate_triggering() {
    let fixture = Fixture::new();
    let producer = fixture.write_cached_repo("acme", "producer", &producer_manifest(""));
    fixture.write_cached_repo(
        "acme",
        "s1",
        &format!(
            r#"
version: "1.0.0"
metadata:
  name: s1
workflows:
{}subscriptions:
  - artifact: acme/producer:lib
    events: [library_built]
    schema_version: "^1.0.0"
    filters:
      - "payload.environment == 'prod'"
    workflow: alpha
    inputs:
      outdir: "{{{{ .event.payload.outdir }}}}"
"#,
            subscriber_workflow("alpha"),
        ),
    );

    // Non-matching payload: filtered out, nothing runs.
    let engine = fixture.engine(&producer);
    let state = engine
        .execute("release", &inputs(&fixture.outdir, "dev"), None)
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert!(fixture.run_log().is_empty());
    let fan_out = state.fan_outs.values().next().unwrap();
    assert_eq!(
        fan_out.subscribers[0].skipped_reason.as_deref(),
        Some("filtered_out")
    );

    // Matching payload and version: triggers.
    let engine = fixture.engine(&producer);
    let state = engine
        .execute("release", &inputs(&fixture.outdir, "prod"), None)
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(fixture.run_log(), ["alpha"]);
}

#[tokio::test]
async fn incompatible_schema_version_skips_subscriber() {
    let fixture = Fixture::new();
    // Emits 2.0.0 against a ^1.0.0 subscription.
    let producer = fixture.write_cached_repo(
        "acme",
        "producer",
        &producer_manifest("").replace("\"1.1.0\"", "\"2.0.0\""),
    );
    fixture.write_cached_repo(
        "acme",
        "s1",
        &format!(
            r#"
version: "1.0.0"
metadata:
  name: s1
workflows:
{}subscriptions:
  - artifact: acme/producer:lib
    events: [library_built]
    schema_version: "^1.0.0"
    workflow: alpha
    inputs:
      outdir: "{{{{ .event.payload.outdir }}}}"
"#,
            subscriber_workflow("alpha"),
        ),
    );

    let engine = fixture.engine(&producer);
    let state = engine
        .execute("release", &inputs(&fixture.outdir, "prod"), None)
        .await
        .unwrap();
    assert_eq!(state.status, RunStatus::Completed);
    assert!(fixture.run_log().is_empty());
    let fan_out = state.fan_outs.values().next().unwrap();
    assert_eq!(
        fan_out.subscribers[0].skipped_reason.as_deref(),
        Some("schema_incompatible")
    );
}

#[tokio::test]
async fn failing_child_fails_waiting_fan_out() {
    let fixture = Fixture::new();
    let producer = fixture.write_cached_repo("acme", "producer", &producer_manifest(""));
    fixture.write_cached_repo(
        "acme",
        "s1",
        r#"
version: "1.0.0"
metadata:
  name: s1
workflows:
  alpha:
    steps:
      - run: exit 1
subscriptions:
  - artifact: acme/producer:lib
    events: [library_built]
    workflow: alpha
"#,
    );

    let engine = fixture.engine(&producer);
    let err = engine
        .execute("release", &inputs(&fixture.outdir, "prod"), None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("child workflows failed"));
}

#[tokio::test]
async fn fire_and_forget_children_complete_before_run_ends() {
    let fixture = Fixture::new();
    // Plain event emission from produces.events, no waiting fan-out step.
    let producer = fixture.write_cached_repo(
        "acme",
        "producer",
        r#"
version: "1.0.0"
metadata:
  name: producer
artifacts:
  lib:
    path: out/lib.tar.gz
workflows:
  release:
    inputs:
      outdir:
        type: string
        required: true
    steps:
      - id: build
        run: echo built
        produces:
          artifact: lib
          events:
            - type: library_built
              payload:
                outdir: "{{ .Inputs.outdir }}"
"#,
    );
    fixture.write_cached_repo(
        "acme",
        "s1",
        &format!(
            r#"
version: "1.0.0"
metadata:
  name: s1
workflows:
{}subscriptions:
  - artifact: acme/producer:lib
    events: [library_built]
    workflow: alpha
    inputs:
      outdir: "{{{{ .event.payload.outdir }}}}"
"#,
            subscriber_workflow("alpha"),
        ),
    );

    let engine = fixture.engine(&producer);
    let provided = IndexMap::from([(
        "outdir".to_string(),
        fixture.outdir.display().to_string(),
    )]);
    let state = engine.execute("release", &provided, None).await.unwrap();

    // drain() ran before terminal status: the child's work is visible now.
    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(fixture.run_log(), ["alpha"]);
    let fan_out = state.fan_outs.values().next().unwrap();
    assert_eq!(fan_out.status, FanOutStatus::Completed);
    assert_eq!(
        fan_out.subscribers[0].outcome,
        Some(ChildOutcome::Success)
    );
}
