//! Built-in step parameter parsing.
//!
//! The one built-in today is `tako/fan-out@v1`, which emits an event and
//! schedules every matching subscriber workflow.

use indexmap::IndexMap;
use semver::Version;
use std::time::Duration;
use thiserror::Error;

use tako_core::codes::ErrorCode;
use tako_core::event::is_valid_event_name;
use tako_core::manifest::Step;

#[derive(Debug, Error)]
pub enum BuiltinError {
    #[error("fan-out parameter `{param}`: {reason}")]
    Invalid { param: &'static str, reason: String },
    #[error("fan-out requires an `event_type` parameter")]
    MissingEventType,
}

impl BuiltinError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::ManifestInvalid
    }

    fn invalid(param: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            param,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BuiltinError>;

/// Parsed `with:` block of a `tako/fan-out@v1` step. Payload values are
/// still templated; the workflow engine expands them in step context.
#[derive(Debug, Clone)]
pub struct FanOutParams {
    pub event_type: String,
    pub wait_for_children: bool,
    pub timeout: Option<Duration>,
    /// 0 means unbounded.
    pub concurrency_limit: usize,
    pub schema_version: Option<Version>,
    pub payload: IndexMap<String, String>,
}

pub fn parse_fan_out(step: &Step) -> Result<FanOutParams> {
    let with = &step.with;

    let event_type = match with.get("event_type") {
        Some(serde_yaml::Value::String(s)) if !s.is_empty() => s.clone(),
        Some(_) => return Err(BuiltinError::invalid("event_type", "must be a string")),
        None => return Err(BuiltinError::MissingEventType),
    };
    if !is_valid_event_name(&event_type) {
        return Err(BuiltinError::invalid(
            "event_type",
            format!("`{event_type}` is not a valid event name"),
        ));
    }

    let wait_for_children = match with.get("wait_for_children") {
        None => false,
        Some(serde_yaml::Value::Bool(b)) => *b,
        Some(_) => {
            return Err(BuiltinError::invalid(
                "wait_for_children",
                "must be a boolean",
            ))
        }
    };

    let timeout = match with.get("timeout") {
        None => None,
        Some(serde_yaml::Value::String(s)) => Some(
            parse_duration(s).ok_or_else(|| {
                BuiltinError::invalid("timeout", format!("`{s}` is not a duration"))
            })?,
        ),
        Some(serde_yaml::Value::Number(n)) => {
            let secs = n
                .as_u64()
                .ok_or_else(|| BuiltinError::invalid("timeout", "must be non-negative"))?;
            Some(Duration::from_secs(secs))
        }
        Some(_) => return Err(BuiltinError::invalid("timeout", "must be a duration")),
    };

    let concurrency_limit = match with.get("concurrency_limit") {
        None => 0,
        Some(serde_yaml::Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| BuiltinError::invalid("concurrency_limit", "must be >= 0"))?
            as usize,
        Some(_) => {
            return Err(BuiltinError::invalid(
                "concurrency_limit",
                "must be an integer",
            ))
        }
    };

    let schema_version = match with.get("schema_version") {
        None => None,
        Some(serde_yaml::Value::String(s)) => Some(
            tako_core::schema::parse_exact(s)
                .map_err(|e| BuiltinError::invalid("schema_version", e.to_string()))?,
        ),
        Some(_) => {
            return Err(BuiltinError::invalid(
                "schema_version",
                "must be an exact x.y.z string",
            ))
        }
    };

    let mut payload = IndexMap::new();
    if let Some(value) = with.get("payload") {
        let serde_yaml::Value::Mapping(map) = value else {
            return Err(BuiltinError::invalid("payload", "must be a mapping"));
        };
        for (key, value) in map {
            let (serde_yaml::Value::String(key), serde_yaml::Value::String(value)) = (key, value)
            else {
                return Err(BuiltinError::invalid(
                    "payload",
                    "keys and values must be strings",
                ));
            };
            payload.insert(key.clone(), value.clone());
        }
    }

    Ok(FanOutParams {
        event_type,
        wait_for_children,
        timeout,
        concurrency_limit,
        schema_version,
        payload,
    })
}

/// `"90"`, `"90s"`, `"5m"`, `"2h"`.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let (digits, unit) = raw.split_at(raw.len().checked_sub(1)?);
    let value: u64 = digits.parse().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 60 * 60)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with(yaml: &str) -> Step {
        serde_yaml::from_str(&format!("uses: tako/fan-out@v1\nwith:\n{yaml}")).unwrap()
    }

    #[test]
    fn parses_full_parameter_set() {
        let step = step_with(
            r#"  event_type: library_built
  wait_for_children: true
  timeout: 5m
  concurrency_limit: 4
  schema_version: "1.2.0"
  payload:
    environment: "{{ .Inputs.environment }}"
"#,
        );
        let params = parse_fan_out(&step).unwrap();
        assert_eq!(params.event_type, "library_built");
        assert!(params.wait_for_children);
        assert_eq!(params.timeout, Some(Duration::from_secs(300)));
        assert_eq!(params.concurrency_limit, 4);
        assert_eq!(params.schema_version, Some(Version::new(1, 2, 0)));
        assert_eq!(
            params.payload.get("environment").map(String::as_str),
            Some("{{ .Inputs.environment }}")
        );
    }

    #[test]
    fn defaults_apply() {
        let step = step_with("  event_type: library_built\n");
        let params = parse_fan_out(&step).unwrap();
        assert!(!params.wait_for_children);
        assert_eq!(params.timeout, None);
        assert_eq!(params.concurrency_limit, 0);
        assert!(params.schema_version.is_none());
        assert!(params.payload.is_empty());
    }

    #[test]
    fn missing_event_type_is_fatal() {
        let step = step_with("  wait_for_children: true\n");
        assert!(matches!(
            parse_fan_out(&step),
            Err(BuiltinError::MissingEventType)
        ));
    }

    #[test]
    fn rejects_invalid_event_name_and_schema_version() {
        let step = step_with("  event_type: BadName\n");
        assert!(parse_fan_out(&step).is_err());

        let step = step_with("  event_type: ok_event\n  schema_version: \"^1.0.0\"\n");
        assert!(parse_fan_out(&step).is_err());
    }

    #[test]
    fn duration_forms() {
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("abc"), None);
        assert_eq!(parse_duration(""), None);
    }
}
