//! Manifest validation: schema, references, templates, expressions.
//!
//! Errors carry the offending field path so the message points at the exact
//! manifest line the user has to fix.

use semver::Version;

use crate::event::is_valid_event_name;
use crate::expr;
use crate::manifest::{
    InputType, Manifest, ManifestError, OutputSource, Result, Step, Subscription, Workflow,
};
use crate::reference::{ArtifactRef, RepoRef};
use crate::schema::{self, SchemaRange};
use crate::template;

/// Built-in steps and the versions each accepts.
pub const KNOWN_BUILTINS: &[(&str, &[&str])] = &[("tako/fan-out", &["v1"])];

/// Manifest versions the loader accepts.
pub const SUPPORTED_VERSION_RANGE: &str = ">=0.1.0, <2.0.0";

impl Manifest {
    /// Validate the loaded manifest. Pure; touches no files.
    pub fn validate(&self) -> Result<()> {
        self.validate_version()?;

        for (index, dependent) in self.dependents.iter().enumerate() {
            let field = format!("dependents[{index}]");
            RepoRef::parse(&dependent.repo).map_err(|e| {
                ManifestError::invalid(format!("{field}.repo"), e.to_string())
            })?;
            for artifact in &dependent.artifacts {
                if !self.artifacts.contains_key(artifact) {
                    return Err(ManifestError::invalid(
                        format!("{field}.artifacts"),
                        format!("unknown artifact `{artifact}`"),
                    ));
                }
            }
        }

        for (name, workflow) in &self.workflows {
            validate_workflow(name, workflow)?;
        }

        for (index, subscription) in self.subscriptions.iter().enumerate() {
            self.validate_subscription(index, subscription)?;
        }

        Ok(())
    }

    fn validate_version(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            return Err(ManifestError::invalid("version", "must not be empty"));
        }
        let version = parse_lenient_version(&self.version).ok_or_else(|| {
            ManifestError::invalid(
                "version",
                format!("`{}` is not a version", self.version),
            )
        })?;
        let supported = semver::VersionReq::parse(SUPPORTED_VERSION_RANGE)
            .expect("supported range is well-formed");
        if !supported.matches(&version) {
            return Err(ManifestError::invalid(
                "version",
                format!(
                    "`{}` is outside the supported range {SUPPORTED_VERSION_RANGE}",
                    self.version
                ),
            ));
        }
        Ok(())
    }

    fn validate_subscription(&self, index: usize, subscription: &Subscription) -> Result<()> {
        let field = format!("subscriptions[{index}]");

        ArtifactRef::parse(&subscription.artifact)
            .map_err(|e| ManifestError::invalid(format!("{field}.artifact"), e.to_string()))?;

        if subscription.events.is_empty() {
            return Err(ManifestError::invalid(
                format!("{field}.events"),
                "must list at least one event",
            ));
        }
        for event in &subscription.events {
            if !is_valid_event_name(event) {
                return Err(ManifestError::invalid(
                    format!("{field}.events"),
                    format!("`{event}` is not a valid event name"),
                ));
            }
        }

        if !self.workflows.contains_key(&subscription.workflow) {
            return Err(ManifestError::invalid(
                format!("{field}.workflow"),
                format!("unknown workflow `{}`", subscription.workflow),
            ));
        }

        if let Some(range) = &subscription.schema_version {
            SchemaRange::parse(range).map_err(|e| {
                ManifestError::invalid(format!("{field}.schema_version"), e.to_string())
            })?;
        }

        for (i, filter) in subscription.filters.iter().enumerate() {
            expr::check_syntax(filter).map_err(|e| {
                ManifestError::invalid(format!("{field}.filters[{i}]"), e.to_string())
            })?;
        }

        for (input, source) in &subscription.inputs {
            template::check_syntax(source).map_err(|e| {
                ManifestError::invalid(format!("{field}.inputs.{input}"), e.to_string())
            })?;
        }

        Ok(())
    }
}

fn validate_workflow(name: &str, workflow: &Workflow) -> Result<()> {
    let field = format!("workflows.{name}");

    for (input_name, input) in &workflow.inputs {
        let input_field = format!("{field}.inputs.{input_name}");
        if let Some(validation) = &input.validation {
            if !validation.enum_values.is_empty() && input.input_type != InputType::String {
                return Err(ManifestError::invalid(
                    input_field,
                    "enum validation only applies to string inputs",
                ));
            }
            if (validation.min.is_some() || validation.max.is_some())
                && input.input_type != InputType::Number
            {
                return Err(ManifestError::invalid(
                    input_field,
                    "min/max validation only applies to number inputs",
                ));
            }
            if let (Some(min), Some(max)) = (validation.min, validation.max) {
                if min > max {
                    return Err(ManifestError::invalid(input_field, "min exceeds max"));
                }
            }
        }
    }

    for (index, step) in workflow.steps.iter().enumerate() {
        validate_step(&format!("{field}.steps[{index}]"), step)?;
    }

    for entry in &workflow.env {
        if !entry.contains('=') {
            return Err(ManifestError::invalid(
                format!("{field}.env"),
                format!("`{entry}` is not KEY=VALUE"),
            ));
        }
    }

    Ok(())
}

fn validate_step(field: &str, step: &Step) -> Result<()> {
    match (&step.run, &step.uses) {
        (Some(_), Some(_)) => {
            return Err(ManifestError::invalid(
                field.to_string(),
                "a step declares exactly one of `run` or `uses`, not both",
            ));
        }
        (None, None) => {
            return Err(ManifestError::invalid(
                field.to_string(),
                "a step declares exactly one of `run` or `uses`",
            ));
        }
        _ => {}
    }

    if let Some(uses) = &step.uses {
        validate_builtin(field, uses)?;
        if step.image.is_some() {
            return Err(ManifestError::invalid(
                format!("{field}.image"),
                "built-in steps do not take a container image",
            ));
        }
    }

    if let Some(run) = &step.run {
        template::check_syntax(run)
            .map_err(|e| ManifestError::invalid(format!("{field}.run"), e.to_string()))?;
    }

    if let Some(condition) = &step.condition {
        expr::check_syntax(condition)
            .map_err(|e| ManifestError::invalid(format!("{field}.if"), e.to_string()))?;
    }

    for (key, value) in &step.env {
        template::check_syntax(value)
            .map_err(|e| ManifestError::invalid(format!("{field}.env.{key}"), e.to_string()))?;
    }

    for (key, value) in &step.with {
        if let serde_yaml::Value::String(text) = value {
            template::check_syntax(text).map_err(|e| {
                ManifestError::invalid(format!("{field}.with.{key}"), e.to_string())
            })?;
        }
        if let serde_yaml::Value::Mapping(map) = value {
            for (inner_key, inner) in map {
                if let (serde_yaml::Value::String(k), serde_yaml::Value::String(text)) =
                    (inner_key, inner)
                {
                    template::check_syntax(text).map_err(|e| {
                        ManifestError::invalid(format!("{field}.with.{key}.{k}"), e.to_string())
                    })?;
                }
            }
        }
    }

    if let Some(produces) = &step.produces {
        for (output, source) in &produces.outputs {
            if let OutputSource::Template(text) = OutputSource::parse(source) {
                template::check_syntax(&text).map_err(|e| {
                    ManifestError::invalid(
                        format!("{field}.produces.outputs.{output}"),
                        e.to_string(),
                    )
                })?;
            }
        }
        for (i, event) in produces.events.iter().enumerate() {
            let event_field = format!("{field}.produces.events[{i}]");
            if !is_valid_event_name(&event.event_type) {
                return Err(ManifestError::invalid(
                    format!("{event_field}.type"),
                    format!("`{}` is not a valid event name", event.event_type),
                ));
            }
            if let Some(version) = &event.schema_version {
                schema::parse_exact(version).map_err(|e| {
                    ManifestError::invalid(format!("{event_field}.schema_version"), e.to_string())
                })?;
            }
            for (key, value) in &event.payload {
                template::check_syntax(value).map_err(|e| {
                    ManifestError::invalid(
                        format!("{event_field}.payload.{key}"),
                        e.to_string(),
                    )
                })?;
            }
        }
    }

    for (i, inner) in step.on_failure.iter().enumerate() {
        validate_step(&format!("{field}.on_failure[{i}]"), inner)?;
    }

    Ok(())
}

fn validate_builtin(field: &str, uses: &str) -> Result<()> {
    let Some((name, version)) = uses.split_once('@') else {
        return Err(ManifestError::invalid(
            format!("{field}.uses"),
            format!("`{uses}` is missing an @version suffix"),
        ));
    };
    let Some((_, versions)) = KNOWN_BUILTINS.iter().find(|(known, _)| *known == name) else {
        return Err(ManifestError::invalid(
            format!("{field}.uses"),
            format!("unknown built-in `{name}`"),
        ));
    };
    if !versions.contains(&version) {
        return Err(ManifestError::invalid(
            format!("{field}.uses"),
            format!("unsupported version `{version}` for built-in `{name}`"),
        ));
    }
    Ok(())
}

/// Accept `x.y.z` and the shorthand `x.y`.
fn parse_lenient_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.len() == 2 {
        return Version::parse(&format!("{raw}.0")).ok();
    }
    None
}
