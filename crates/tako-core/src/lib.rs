pub mod codes;
pub mod event;
pub mod expr;
pub mod inputs;
pub mod manifest;
pub mod reference;
pub mod schema;
pub mod template;
pub mod validate;

pub use codes::ErrorCode;
pub use event::EventEnvelope;
pub use manifest::{
    Artifact, Dependent, EventSpec, InputType, InputValidation, Manifest, ManifestError, Metadata,
    OutputSource, Produces, ResourceLimits, Step, Subscription, Workflow, WorkflowInput,
    MANIFEST_FILE,
};
pub use reference::{sanitize_ref, ArtifactRef, RepoRef};
pub use schema::SchemaRange;
pub use template::{EventScope, StepScope, TemplateContext};
