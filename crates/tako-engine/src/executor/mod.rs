//! Step executors: shell processes and containers.

pub mod container;
pub mod shell;

use thiserror::Error;

use tako_core::codes::ErrorCode;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("step cancelled")]
    Cancelled,
    #[error("step timed out after {0} seconds")]
    Timeout(u64),
    #[error("no container runtime found (tried docker, podman)")]
    RuntimeMissing,
    #[error("container runtime failed: {0}")]
    RuntimeFailed(String),
    #[error("invalid container image name `{0}`")]
    InvalidImage(String),
    #[error("invalid container network `{0}`")]
    InvalidNetwork(String),
    #[error("invalid volume specification `{0}`")]
    InvalidVolume(String),
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
}

impl ExecError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::RuntimeMissing => ErrorCode::ContainerRuntimeMissing,
            Self::RuntimeFailed(_) => ErrorCode::ContainerRuntimeFailed,
            Self::ResourceLimit(_) => ErrorCode::ResourceLimitExceeded,
            Self::InvalidImage(_) | Self::InvalidNetwork(_) | Self::InvalidVolume(_) => {
                ErrorCode::ManifestInvalid
            }
            _ => ErrorCode::StepFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Last lines of stderr, for failure messages.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let all: Vec<&str> = self.stderr.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].join("\n")
    }
}
