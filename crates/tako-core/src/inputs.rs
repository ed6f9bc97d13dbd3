//! Workflow input resolution: defaults, required checks, type coercion,
//! enum and range validation.

use indexmap::IndexMap;
use thiserror::Error;

use crate::codes::ErrorCode;
use crate::manifest::{InputType, Workflow};

#[derive(Debug, Error)]
pub enum InputError {
    #[error("required input `{0}` was not provided")]
    Missing(String),
    #[error("unknown input `{0}`")]
    Unknown(String),
    #[error("input `{name}` expects a {expected}, got `{value}`")]
    TypeMismatch {
        name: String,
        expected: &'static str,
        value: String,
    },
    #[error("input `{name}` must be one of [{allowed}], got `{value}`")]
    EnumViolation {
        name: String,
        allowed: String,
        value: String,
    },
    #[error("input `{name}` value {value} is outside [{min}, {max}]")]
    OutOfRange {
        name: String,
        value: f64,
        min: String,
        max: String,
    },
}

impl InputError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InputInvalid
    }
}

pub type Result<T> = std::result::Result<T, InputError>;

/// A typed, validated input value.
#[derive(Debug, Clone, PartialEq)]
pub enum InputValue {
    Str(String),
    Bool(bool),
    Num(f64),
}

impl InputValue {
    /// Render for template interpolation.
    pub fn render(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Bool(b) => b.to_string(),
            Self::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    format!("{}", *n as i64)
                } else {
                    n.to_string()
                }
            }
        }
    }
}

/// Validate `provided` against the workflow's declared inputs and return
/// the fully-resolved set, rendered for templating.
pub fn resolve(
    workflow: &Workflow,
    provided: &IndexMap<String, String>,
) -> Result<IndexMap<String, String>> {
    for name in provided.keys() {
        if !workflow.inputs.contains_key(name) {
            return Err(InputError::Unknown(name.clone()));
        }
    }

    let mut resolved = IndexMap::with_capacity(workflow.inputs.len());
    for (name, declared) in &workflow.inputs {
        let value = match provided.get(name) {
            Some(raw) => Some(coerce(name, declared.input_type, raw)?),
            None => default_value(name, declared)?,
        };
        let Some(value) = value else {
            if declared.required {
                return Err(InputError::Missing(name.clone()));
            }
            continue;
        };
        validate_constraints(name, declared, &value)?;
        resolved.insert(name.clone(), value.render());
    }
    Ok(resolved)
}

fn coerce(name: &str, input_type: InputType, raw: &str) -> Result<InputValue> {
    match input_type {
        InputType::String => Ok(InputValue::Str(raw.to_string())),
        InputType::Boolean => match raw.to_lowercase().as_str() {
            "true" | "1" | "yes" | "y" | "on" => Ok(InputValue::Bool(true)),
            "false" | "0" | "no" | "n" | "off" => Ok(InputValue::Bool(false)),
            _ => Err(InputError::TypeMismatch {
                name: name.to_string(),
                expected: "boolean",
                value: raw.to_string(),
            }),
        },
        InputType::Number => raw
            .parse::<f64>()
            .map(InputValue::Num)
            .map_err(|_| InputError::TypeMismatch {
                name: name.to_string(),
                expected: "number",
                value: raw.to_string(),
            }),
    }
}

fn default_value(
    name: &str,
    declared: &crate::manifest::WorkflowInput,
) -> Result<Option<InputValue>> {
    let Some(default) = &declared.default else {
        return Ok(None);
    };
    let value = match (declared.input_type, default) {
        (InputType::String, serde_yaml::Value::String(s)) => InputValue::Str(s.clone()),
        (InputType::Boolean, serde_yaml::Value::Bool(b)) => InputValue::Bool(*b),
        (InputType::Number, serde_yaml::Value::Number(n)) => {
            InputValue::Num(n.as_f64().unwrap_or(0.0))
        }
        // A scalar default written without quotes still coerces.
        (input_type, serde_yaml::Value::String(s)) => coerce(name, input_type, s)?,
        (input_type, serde_yaml::Value::Number(n)) => {
            coerce(name, input_type, &n.to_string())?
        }
        (input_type, serde_yaml::Value::Bool(b)) => coerce(name, input_type, &b.to_string())?,
        (_, other) => {
            return Err(InputError::TypeMismatch {
                name: name.to_string(),
                expected: declared.input_type.as_str(),
                value: format!("{other:?}"),
            })
        }
    };
    Ok(Some(value))
}

fn validate_constraints(
    name: &str,
    declared: &crate::manifest::WorkflowInput,
    value: &InputValue,
) -> Result<()> {
    let Some(validation) = &declared.validation else {
        return Ok(());
    };

    if !validation.enum_values.is_empty() {
        let InputValue::Str(s) = value else {
            return Ok(());
        };
        if !validation.enum_values.iter().any(|v| v == s) {
            return Err(InputError::EnumViolation {
                name: name.to_string(),
                allowed: validation.enum_values.join(", "),
                value: s.clone(),
            });
        }
    }

    if let InputValue::Num(n) = value {
        let min = validation.min.unwrap_or(f64::NEG_INFINITY);
        let max = validation.max.unwrap_or(f64::INFINITY);
        if *n < min || *n > max {
            return Err(InputError::OutOfRange {
                name: name.to_string(),
                value: *n,
                min: validation.min.map_or("-inf".into(), |v| v.to_string()),
                max: validation.max.map_or("inf".into(), |v| v.to_string()),
            });
        }
    }

    Ok(())
}
