//! Runtime event envelope passed between steps, the orchestrator, and
//! subscription filters.

use indexmap::IndexMap;
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use crate::manifest::Subscription;

/// Event identifiers are `[a-z][a-z0-9_]*`.
pub fn is_valid_event_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").unwrap())
        .is_match(name)
}

/// A concrete emitted event with its expanded payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<Version>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub payload: IndexMap<String, String>,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            schema_version: None,
            payload: IndexMap::new(),
        }
    }

    /// Build the evaluation context filters see: `{event: {...},
    /// subscription: {...}}`.
    pub fn filter_context(&self, subscription: &Subscription) -> serde_json::Value {
        let payload: serde_json::Map<String, serde_json::Value> = self
            .payload
            .iter()
            .map(|(k, v)| (k.clone(), scalar_value(v)))
            .collect();

        serde_json::json!({
            "event": {
                "type": self.event_type,
                "schema_version": self.schema_version.as_ref().map(ToString::to_string),
                "payload": payload,
            },
            "subscription": {
                "artifact": subscription.artifact,
                "workflow": subscription.workflow,
                "events": subscription.events,
            },
        })
    }
}

/// Payload values arrive as expanded strings; numeric and boolean shapes
/// are surfaced as such so filters can compare them natively.
pub fn scalar_value(raw: &str) -> serde_json::Value {
    if let Ok(n) = raw.parse::<i64>() {
        return serde_json::Value::from(n);
    }
    if let Ok(n) = raw.parse::<f64>() {
        if n.is_finite() {
            return serde_json::Value::from(n);
        }
    }
    match raw {
        "true" => serde_json::Value::Bool(true),
        "false" => serde_json::Value::Bool(false),
        _ => serde_json::Value::String(raw.to_string()),
    }
}
