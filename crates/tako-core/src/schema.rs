//! Event schema-version ranges for subscriptions.
//!
//! Accepted forms: exact `1.2.3`, caret `^1.2.3`, tilde `~1.2.3`, and the
//! half-open intervals `[1.0.0...2.0.0)` and `(1.0.0...2.0.0]`.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid schema version `{0}`: expected exact x.y.z")]
    InvalidVersion(String),
    #[error("invalid schema version range `{0}`")]
    InvalidRange(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;

/// Parse an emission-side schema version, which must be an exact `x.y.z`.
pub fn parse_exact(raw: &str) -> Result<Version> {
    let version =
        Version::parse(raw.trim()).map_err(|_| SchemaError::InvalidVersion(raw.to_string()))?;
    if !version.pre.is_empty() || !version.build.is_empty() {
        return Err(SchemaError::InvalidVersion(raw.to_string()));
    }
    Ok(version)
}

/// A subscription-side compatibility range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaRange {
    raw: String,
    req: VersionReq,
}

impl SchemaRange {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let req = Self::to_req(trimmed)?;
        Ok(Self {
            raw: trimmed.to_string(),
            req,
        })
    }

    fn to_req(raw: &str) -> Result<VersionReq> {
        if raw.is_empty() {
            return Err(SchemaError::InvalidRange(raw.to_string()));
        }

        // Interval forms use `...` between bounds; the bracket style picks
        // which bound is inclusive.
        if (raw.starts_with('[') || raw.starts_with('(')) && raw.len() >= 2 {
            let lower_inclusive = raw.starts_with('[');
            let upper_inclusive = raw.ends_with(']');
            if !raw.ends_with(']') && !raw.ends_with(')') {
                return Err(SchemaError::InvalidRange(raw.to_string()));
            }
            // Pinned interval shapes: `[a...b)` and `(a...b]`.
            if lower_inclusive == upper_inclusive {
                return Err(SchemaError::InvalidRange(raw.to_string()));
            }
            let inner = &raw[1..raw.len() - 1];
            let Some((lo, hi)) = inner.split_once("...") else {
                return Err(SchemaError::InvalidRange(raw.to_string()));
            };
            let lo = parse_exact(lo).map_err(|_| SchemaError::InvalidRange(raw.to_string()))?;
            let hi = parse_exact(hi).map_err(|_| SchemaError::InvalidRange(raw.to_string()))?;
            let lo_op = if lower_inclusive { ">=" } else { ">" };
            let hi_op = if upper_inclusive { "<=" } else { "<" };
            let spec = format!("{lo_op}{lo}, {hi_op}{hi}");
            return VersionReq::parse(&spec)
                .map_err(|_| SchemaError::InvalidRange(raw.to_string()));
        }

        if let Some(rest) = raw.strip_prefix('^') {
            parse_exact(rest).map_err(|_| SchemaError::InvalidRange(raw.to_string()))?;
            return VersionReq::parse(raw).map_err(|_| SchemaError::InvalidRange(raw.to_string()));
        }
        if let Some(rest) = raw.strip_prefix('~') {
            parse_exact(rest).map_err(|_| SchemaError::InvalidRange(raw.to_string()))?;
            return VersionReq::parse(raw).map_err(|_| SchemaError::InvalidRange(raw.to_string()));
        }

        // Exact pin.
        let version = parse_exact(raw).map_err(|_| SchemaError::InvalidRange(raw.to_string()))?;
        VersionReq::parse(&format!("={version}"))
            .map_err(|_| SchemaError::InvalidRange(raw.to_string()))
    }

    /// True when `version` satisfies the range under standard semver
    /// semantics.
    pub fn matches(&self, version: &Version) -> bool {
        self.req.matches(version)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl std::fmt::Display for SchemaRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for SchemaRange {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<SchemaRange> for String {
    fn from(range: SchemaRange) -> Self {
        range.raw
    }
}
