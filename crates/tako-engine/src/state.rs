//! Durable per-run execution state.
//!
//! One JSON document per run at `<workspace>/state/<run_id>.json`. Every
//! mutation is written to a temp file, fsynced, then renamed over the old
//! document, so a reader only ever observes the pre- or post-state.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use tako_core::codes::ErrorCode;
use tako_core::event::EventEnvelope;

/// Bumped when the on-disk layout changes shape.
pub const STATE_VERSION: &str = "1";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state for run {0} not found")]
    NotFound(String),
    #[error("state file {path} is corrupted: {reason}")]
    Corrupted { path: String, reason: String },
    #[error("run {0} is not resumable")]
    NotResumable(String),
}

impl StateError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::StateCorrupted
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Per-step status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Fan-out lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutStatus {
    Pending,
    Discovering,
    Scheduling,
    Running,
    Completed,
    TimedOut,
    Cancelled,
    Failed,
}

/// Classification of one child workflow's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildOutcome {
    Success,
    WorkflowFailed,
    ExecutionFailed,
    Timeout,
    CircuitBreakerOpen,
}

impl ChildOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::WorkflowFailed => "workflow_failed",
            Self::ExecutionFailed => "execution_failed",
            Self::Timeout => "timeout",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Everything recorded about one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Measured with a monotonic clock; the wall-clock stamps above are for
    /// summaries only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

/// One subscriber considered by a fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberRecord {
    pub repo: String,
    pub workflow: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ChildOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One fan-out occurrence and everything it scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanOutRecord {
    pub fan_out_id: String,
    pub status: FanOutStatus,
    pub event: EventEnvelope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscribers: Vec<SubscriberRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// The whole persisted run document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub state_version: String,
    pub run_id: String,
    pub workflow: String,
    pub repo_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub steps: IndexMap<String, StepRecord>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub fan_outs: IndexMap<String, FanOutRecord>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionState {
    pub fn new(run_id: &str, workflow: &str, repo_path: &Path) -> Self {
        Self {
            state_version: STATE_VERSION.to_string(),
            run_id: run_id.to_string(),
            workflow: workflow.to_string(),
            repo_path: repo_path.display().to_string(),
            parent_run_id: None,
            inputs: IndexMap::new(),
            started_at: Utc::now(),
            ended_at: None,
            current_step: None,
            steps: IndexMap::new(),
            fan_outs: IndexMap::new(),
            status: RunStatus::Pending,
            error: None,
        }
    }

    /// A run resumes only from failure, and only when a concrete step
    /// failed (as opposed to e.g. input validation).
    pub fn is_resumable(&self) -> bool {
        self.status == RunStatus::Failed
            && self
                .steps
                .values()
                .any(|step| step.status == StepStatus::Failed)
    }

    pub fn summary(&self) -> ExecutionSummary {
        let mut counts = StepCounts::default();
        for step in self.steps.values() {
            match step.status {
                StepStatus::Completed => counts.completed += 1,
                StepStatus::Failed => counts.failed += 1,
                StepStatus::Skipped => counts.skipped += 1,
                StepStatus::Cancelled => counts.cancelled += 1,
                StepStatus::Pending | StepStatus::Running => counts.pending += 1,
            }
        }
        ExecutionSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            workflow: self.workflow.clone(),
            repo_path: self.repo_path.clone(),
            counts,
            duration_ms: self
                .ended_at
                .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64),
            error: self.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCounts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub workflow: String,
    pub repo_path: String,
    pub counts: StepCounts,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Allocate a run identifier: `exec-YYYYMMDD-HHMMSS-<8-hex>`.
pub fn new_run_id() -> String {
    format!(
        "exec-{}-{:08x}",
        Utc::now().format("%Y%m%d-%H%M%S"),
        rand::random::<u32>()
    )
}

/// Single-writer store for a workspace's `state/` directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store rooted at `<workspace>/state`.
    pub fn new(workspace: &Path) -> Self {
        Self {
            dir: workspace.join("state"),
        }
    }

    pub fn state_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    /// Persist atomically: temp file, fsync, rename.
    pub fn save(&self, state: &ExecutionState) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let final_path = self.state_path(&state.run_id);
        let tmp_path = self.dir.join(format!(".{}.json.tmp", state.run_id));

        let json = serde_json::to_vec_pretty(state).map_err(|e| StateError::Corrupted {
            path: final_path.display().to_string(),
            reason: e.to_string(),
        })?;
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Load and validate a persisted run.
    pub fn load(&self, run_id: &str) -> Result<ExecutionState> {
        let path = self.state_path(run_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(run_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let state: ExecutionState =
            serde_json::from_str(&content).map_err(|e| StateError::Corrupted {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        if state.state_version != STATE_VERSION {
            return Err(StateError::Corrupted {
                path: path.display().to_string(),
                reason: format!(
                    "state version {} is not supported (expected {STATE_VERSION})",
                    state.state_version
                ),
            });
        }
        Ok(state)
    }
}
