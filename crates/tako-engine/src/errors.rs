//! Engine-wide error type surfaced to the CLI.

use thiserror::Error;

use tako_core::codes::ErrorCode;
use tako_core::manifest::ManifestError;

use crate::graph::GraphError;
use crate::planner::PlanError;
use crate::resolver::ResolveError;
use crate::state::StateError;
use crate::workflow::WorkflowError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Workflow(#[from] WorkflowError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Graph(e) => e.code(),
            Self::Plan(e) => e.code(),
            Self::Workflow(e) => e.code(),
            Self::Resolve(e) => e.code(),
            Self::State(e) => e.code(),
            Self::Manifest(e) => e.code(),
            Self::Io(_) => ErrorCode::StepFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
