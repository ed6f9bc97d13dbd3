//! The per-repository manifest (`tako.yml`): serde model and loader.
//!
//! Steps may be written as a bare string (shorthand for `run`) or a
//! structured mapping; both forms normalize into [`Step`] at load time so
//! downstream code only ever sees the structured shape.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::codes::ErrorCode;

/// Canonical manifest file name.
pub const MANIFEST_FILE: &str = "tako.yml";

/// Alternate spelling accepted by the loader.
pub const MANIFEST_FILE_ALT: &str = "tako.yaml";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read manifest {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse manifest {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid manifest field `{field}`: {reason}")]
    Invalid { field: String, reason: String },
    #[error("no {MANIFEST_FILE} found in {0}")]
    NotFound(String),
}

impl ManifestError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ManifestInvalid
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// One repository's manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: String,
    #[serde(default, skip_serializing_if = "Metadata::is_empty")]
    pub metadata: Metadata,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub artifacts: IndexMap<String, Artifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependents: Vec<Dependent>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub workflows: IndexMap<String, Workflow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<Subscription>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Metadata {
    fn is_empty(&self) -> bool {
        self.name.is_none()
    }
}

/// A named build output of the repository.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Artifact {
    /// Back-reference to the mapping key; populated on load.
    #[serde(skip)]
    pub name: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ecosystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_command: Option<String>,
}

/// A downstream repository that consumes this repository's artifacts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependent {
    pub repo: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workflows: Vec<String>,
}

/// Declared input type for a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    #[default]
    String,
    Boolean,
    Number,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Number => "number",
        }
    }
}

/// Validation constraints on a workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InputValidation {
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

/// A declared workflow input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowInput {
    #[serde(rename = "type", default)]
    pub input_type: InputType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<InputValidation>,
}

/// Resource caps; composed global → repository → step, innermost wins.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl ResourceLimits {
    /// Overlay `other` on top of `self`; fields set in `other` win.
    pub fn merged_with(&self, other: &Self) -> Self {
        Self {
            cpu_limit: other.cpu_limit.clone().or_else(|| self.cpu_limit.clone()),
            memory_limit: other
                .memory_limit
                .clone()
                .or_else(|| self.memory_limit.clone()),
            timeout_seconds: other.timeout_seconds.or(self.timeout_seconds),
        }
    }
}

/// A workflow: typed inputs plus an ordered step list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Back-reference to the mapping key; populated on load.
    #[serde(skip)]
    pub name: String,
    #[serde(rename = "on", default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    /// Default container image for container steps in this workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Ordered `KEY=VALUE` entries forming the workflow environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<String>,
    /// Secret names resolved from the invoking environment.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, WorkflowInput>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
}

/// How a step output value is extracted after the step finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputSource {
    Stdout,
    Stderr,
    File(String),
    EnvVar(String),
    /// A templated literal expanded in the step's context.
    Template(String),
}

impl OutputSource {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "from_stdout" => Self::Stdout,
            "from_stderr" => Self::Stderr,
            _ => {
                if let Some(path) = raw.strip_prefix("from_file:") {
                    Self::File(path.to_string())
                } else if let Some(var) = raw.strip_prefix("from_env:") {
                    Self::EnvVar(var.to_string())
                } else {
                    Self::Template(raw.to_string())
                }
            }
        }
    }
}

/// An event emitted when a step completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventSpec {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    /// Templated payload fields, expanded in the emitting step's context.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub payload: IndexMap<String, String>,
}

/// Declared step products: an artifact, extracted outputs, emitted events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Produces {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    /// Output name → extraction expression (see [`OutputSource`]).
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<EventSpec>,
}

/// A single workflow step, normalized from either manifest form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "RawStep")]
pub struct Step {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub with: IndexMap<String, serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(default)]
    pub long_running: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub produces: Option<Produces>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_failure: Vec<Step>,
}

impl Step {
    /// True when the step runs inside a container.
    pub fn is_container(&self) -> bool {
        self.image.is_some() && self.uses.is_none()
    }

    /// True when the step invokes a built-in.
    pub fn is_builtin(&self) -> bool {
        self.uses.is_some()
    }

    /// Display label: explicit id, or a positional fallback.
    pub fn label(&self, index: usize) -> String {
        self.id
            .clone()
            .unwrap_or_else(|| format!("step-{}", index + 1))
    }
}

/// Either manifest spelling of a step.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawStep {
    /// Bare string shorthand for a `run` step.
    Command(String),
    Detailed(StepFields),
}

/// Structured mapping form; mirrors [`Step`] field for field.
#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepFields {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "if", default)]
    condition: Option<String>,
    #[serde(default)]
    run: Option<String>,
    #[serde(default)]
    uses: Option<String>,
    #[serde(default)]
    with: IndexMap<String, serde_yaml::Value>,
    #[serde(default)]
    image: Option<String>,
    #[serde(default)]
    network: Option<String>,
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    security_profile: Option<String>,
    #[serde(default)]
    volumes: Vec<String>,
    #[serde(default)]
    resources: Option<ResourceLimits>,
    #[serde(default)]
    env: IndexMap<String, String>,
    #[serde(default)]
    long_running: bool,
    #[serde(default)]
    produces: Option<Produces>,
    #[serde(default)]
    on_failure: Vec<Step>,
}

impl From<RawStep> for Step {
    fn from(raw: RawStep) -> Self {
        match raw {
            RawStep::Command(cmd) => Self {
                run: Some(cmd),
                ..Self::default()
            },
            RawStep::Detailed(f) => Self {
                id: f.id,
                condition: f.condition,
                run: f.run,
                uses: f.uses,
                with: f.with,
                image: f.image,
                network: f.network,
                capabilities: f.capabilities,
                security_profile: f.security_profile,
                volumes: f.volumes,
                resources: f.resources,
                env: f.env,
                long_running: f.long_running,
                produces: f.produces,
                on_failure: f.on_failure,
            },
        }
    }
}

/// A declared interest in events from another repository's artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Subscription {
    /// `owner/repo:artifact-name` this subscription listens to.
    pub artifact: String,
    pub events: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<String>,
    /// Workflow triggered when a matching event arrives.
    pub workflow: String,
    /// Workflow input name → templated source expression.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub inputs: IndexMap<String, String>,
}

impl Manifest {
    /// Load and validate the manifest at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let mut manifest: Self =
            serde_yaml::from_str(&content).map_err(|source| ManifestError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        manifest.populate_back_references();
        manifest.validate()?;
        Ok(manifest)
    }

    /// Locate `tako.yml` (or `tako.yaml`) inside a repository directory.
    pub fn find(repo_dir: &Path) -> Result<PathBuf> {
        for name in [MANIFEST_FILE, MANIFEST_FILE_ALT] {
            let candidate = repo_dir.join(name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        Err(ManifestError::NotFound(repo_dir.display().to_string()))
    }

    /// Load the manifest of the repository rooted at `repo_dir`.
    pub fn load_from_dir(repo_dir: &Path) -> Result<Self> {
        let path = Self::find(repo_dir)?;
        Self::load(&path)
    }

    /// The repository's display name: `metadata.name` or a fallback.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("unnamed")
    }

    fn populate_back_references(&mut self) {
        for (key, artifact) in &mut self.artifacts {
            artifact.name.clone_from(key);
        }
        for (key, workflow) in &mut self.workflows {
            workflow.name.clone_from(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASIC: &str = r#"
version: "1.0.0"
metadata:
  name: widgets
artifacts:
  lib:
    path: dist/libwidget.tar.gz
    ecosystem: rust
dependents:
  - repo: acme/consumer:main
    artifacts: [lib]
workflows:
  build:
    inputs:
      environment:
        type: string
        required: true
        validation:
          enum: [dev, staging, prod]
    steps:
      - echo building
      - id: package
        run: make package
        produces:
          outputs:
            result: from_stdout
subscriptions:
  - artifact: acme/base:toolchain
    events: [toolchain_updated]
    workflow: build
    inputs:
      environment: "{{ .event.payload.environment }}"
"#;

    #[test]
    fn parses_basic_manifest() {
        let manifest: Manifest = serde_yaml::from_str(BASIC).unwrap();
        assert_eq!(manifest.version, "1.0.0");
        assert_eq!(manifest.metadata.name.as_deref(), Some("widgets"));
        assert_eq!(manifest.artifacts.len(), 1);
        assert_eq!(manifest.dependents.len(), 1);
        assert_eq!(manifest.subscriptions.len(), 1);
    }

    #[test]
    fn bare_string_step_normalizes_to_run() {
        let manifest: Manifest = serde_yaml::from_str(BASIC).unwrap();
        let steps = &manifest.workflows["build"].steps;
        assert_eq!(steps[0].run.as_deref(), Some("echo building"));
        assert!(steps[0].id.is_none());
        assert_eq!(steps[1].id.as_deref(), Some("package"));
    }

    #[test]
    fn back_references_populated_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, BASIC).unwrap();
        let manifest = Manifest::load(&path).unwrap();
        assert_eq!(manifest.artifacts["lib"].name, "lib");
        assert_eq!(manifest.workflows["build"].name, "build");
    }

    #[test]
    fn load_reemit_reload_is_fixed_point() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        std::fs::write(&path, BASIC).unwrap();
        let first = Manifest::load(&path).unwrap();

        let reemitted = serde_yaml::to_string(&first).unwrap();
        let path2 = dir.path().join("reemitted.yml");
        std::fs::write(&path2, &reemitted).unwrap();
        let second = Manifest::load(&path2).unwrap();

        assert_eq!(
            serde_yaml::to_string(&second).unwrap(),
            reemitted,
            "re-emitting and re-loading must not change the model"
        );
    }

    #[test]
    fn output_source_forms() {
        assert_eq!(OutputSource::parse("from_stdout"), OutputSource::Stdout);
        assert_eq!(OutputSource::parse("from_stderr"), OutputSource::Stderr);
        assert_eq!(
            OutputSource::parse("from_file:out/version.txt"),
            OutputSource::File("out/version.txt".into())
        );
        assert_eq!(
            OutputSource::parse("from_env:BUILD_ID"),
            OutputSource::EnvVar("BUILD_ID".into())
        );
        assert_eq!(
            OutputSource::parse("{{ .Inputs.tag }}"),
            OutputSource::Template("{{ .Inputs.tag }}".into())
        );
    }

    #[test]
    fn resource_limits_innermost_wins() {
        let outer = ResourceLimits {
            cpu_limit: Some("4".into()),
            memory_limit: Some("2Gi".into()),
            timeout_seconds: Some(600),
        };
        let inner = ResourceLimits {
            cpu_limit: None,
            memory_limit: Some("512Mi".into()),
            timeout_seconds: None,
        };
        let merged = outer.merged_with(&inner);
        assert_eq!(merged.cpu_limit.as_deref(), Some("4"));
        assert_eq!(merged.memory_limit.as_deref(), Some("512Mi"));
        assert_eq!(merged.timeout_seconds, Some(600));
    }

    #[test]
    fn find_prefers_canonical_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), BASIC).unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE_ALT), BASIC).unwrap();
        let found = Manifest::find(dir.path()).unwrap();
        assert!(found.ends_with(MANIFEST_FILE));
    }

    #[test]
    fn missing_manifest_reports_not_found() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            Manifest::find(dir.path()),
            Err(ManifestError::NotFound(_))
        ));
    }
}
