//! Stable error codes attached to every user-visible failure.
//!
//! Each error kind maps to exactly one `TAKO_E###` token. The set is fixed;
//! new kinds append, existing codes never change meaning.

use serde::{Deserialize, Serialize};

/// Machine-readable failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ManifestInvalid,
    RepoResolveFailed,
    CircularDependency,
    FilterNotFound,
    InputInvalid,
    TemplateExpansionFailed,
    ExpressionInvalid,
    StepFailed,
    ContainerRuntimeMissing,
    ContainerRuntimeFailed,
    ResourceLimitExceeded,
    ChildWorkflowExecutionFailed,
    ChildWorkflowTimeout,
    ChildWorkflowCircuitBreakerOpen,
    SchemaIncompatible,
    StateCorrupted,
    CacheMissInLocalMode,
    WorkflowNotFound,
}

impl ErrorCode {
    /// The stable token printed alongside the human message.
    pub fn token(&self) -> &'static str {
        match self {
            Self::ManifestInvalid => "TAKO_E001",
            Self::RepoResolveFailed => "TAKO_E002",
            Self::CircularDependency => "TAKO_E003",
            Self::FilterNotFound => "TAKO_E004",
            Self::InputInvalid => "TAKO_E005",
            Self::TemplateExpansionFailed => "TAKO_E006",
            Self::ExpressionInvalid => "TAKO_E007",
            Self::StepFailed => "TAKO_E008",
            Self::ContainerRuntimeMissing => "TAKO_E009",
            Self::ContainerRuntimeFailed => "TAKO_E010",
            Self::ResourceLimitExceeded => "TAKO_E011",
            Self::ChildWorkflowExecutionFailed => "TAKO_E012",
            Self::ChildWorkflowTimeout => "TAKO_E013",
            Self::ChildWorkflowCircuitBreakerOpen => "TAKO_E014",
            Self::SchemaIncompatible => "TAKO_E015",
            Self::StateCorrupted => "TAKO_E016",
            Self::CacheMissInLocalMode => "TAKO_E017",
            Self::WorkflowNotFound => "TAKO_E018",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique() {
        let all = [
            ErrorCode::ManifestInvalid,
            ErrorCode::RepoResolveFailed,
            ErrorCode::CircularDependency,
            ErrorCode::FilterNotFound,
            ErrorCode::InputInvalid,
            ErrorCode::TemplateExpansionFailed,
            ErrorCode::ExpressionInvalid,
            ErrorCode::StepFailed,
            ErrorCode::ContainerRuntimeMissing,
            ErrorCode::ContainerRuntimeFailed,
            ErrorCode::ResourceLimitExceeded,
            ErrorCode::ChildWorkflowExecutionFailed,
            ErrorCode::ChildWorkflowTimeout,
            ErrorCode::ChildWorkflowCircuitBreakerOpen,
            ErrorCode::SchemaIncompatible,
            ErrorCode::StateCorrupted,
            ErrorCode::CacheMissInLocalMode,
            ErrorCode::WorkflowNotFound,
        ];
        let mut seen = std::collections::HashSet::new();
        for code in all {
            assert!(seen.insert(code.token()), "duplicate token {}", code.token());
        }
    }

    #[test]
    fn token_format() {
        assert_eq!(ErrorCode::ManifestInvalid.token(), "TAKO_E001");
        assert_eq!(ErrorCode::CacheMissInLocalMode.token(), "TAKO_E017");
    }
}
