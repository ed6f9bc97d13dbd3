//! Repository and artifact reference grammar.
//!
//! A repository is addressed as `file://<abs-path>:<ref>`, a relative
//! `./path` or `../path`, or `<owner>/<name>[:<ref>]`. An artifact is
//! addressed as `<owner>/<repo>:<artifact-name>`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefError {
    #[error("malformed repository reference: {0}")]
    MalformedRepo(String),
    #[error("malformed artifact reference: {0}")]
    MalformedArtifact(String),
}

pub type Result<T> = std::result::Result<T, RefError>;

/// Parsed repository reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoRef {
    /// `file://<abs-path>` with an optional trailing `:<ref>` that is
    /// stripped on resolution.
    File { path: String },
    /// `./relative` or `../relative`, resolved against the referencing
    /// repository's directory.
    Relative { path: String },
    /// `<owner>/<name>[:<ref>]`; `ref_name` None means the remote default
    /// branch.
    Remote {
        owner: String,
        name: String,
        ref_name: Option<String>,
    },
}

impl RepoRef {
    /// Parse a reference string.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(RefError::MalformedRepo(raw.to_string()));
        }

        if let Some(rest) = raw.strip_prefix("file://") {
            // A `:<ref>` suffix is allowed and discarded; the path itself
            // must be absolute.
            let path = match rest.rsplit_once(':') {
                Some((path, _ref)) if !path.is_empty() => path,
                _ => rest,
            };
            if !path.starts_with('/') {
                return Err(RefError::MalformedRepo(raw.to_string()));
            }
            return Ok(Self::File {
                path: path.to_string(),
            });
        }

        if raw.starts_with("./") || raw.starts_with("../") {
            return Ok(Self::Relative {
                path: raw.to_string(),
            });
        }

        // owner/name[:ref]
        let (repo_part, ref_name) = match raw.split_once(':') {
            Some((repo, r)) if !r.is_empty() => (repo, Some(r.to_string())),
            Some((_, _)) => return Err(RefError::MalformedRepo(raw.to_string())),
            None => (raw, None),
        };
        let Some((owner, name)) = repo_part.split_once('/') else {
            return Err(RefError::MalformedRepo(raw.to_string()));
        };
        if owner.is_empty()
            || name.is_empty()
            || name.contains('/')
            || !is_safe_segment(owner)
            || !is_safe_segment(name)
        {
            return Err(RefError::MalformedRepo(raw.to_string()));
        }
        Ok(Self::Remote {
            owner: owner.to_string(),
            name: name.to_string(),
            ref_name,
        })
    }

    /// Short display name used in graph output and error chains.
    pub fn display_name(&self) -> String {
        match self {
            Self::File { path } | Self::Relative { path } => path.clone(),
            Self::Remote { owner, name, .. } => format!("{owner}/{name}"),
        }
    }
}

impl std::fmt::Display for RepoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File { path } => write!(f, "file://{path}"),
            Self::Relative { path } => f.write_str(path),
            Self::Remote {
                owner,
                name,
                ref_name,
            } => match ref_name {
                Some(r) => write!(f, "{owner}/{name}:{r}"),
                None => write!(f, "{owner}/{name}"),
            },
        }
    }
}

/// Parsed artifact reference `<owner>/<repo>:<artifact>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub owner: String,
    pub repo: String,
    pub artifact: String,
}

impl ArtifactRef {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let Some((repo_part, artifact)) = raw.split_once(':') else {
            return Err(RefError::MalformedArtifact(raw.to_string()));
        };
        let Some((owner, repo)) = repo_part.split_once('/') else {
            return Err(RefError::MalformedArtifact(raw.to_string()));
        };
        if owner.is_empty() || repo.is_empty() || artifact.is_empty() || repo.contains('/') {
            return Err(RefError::MalformedArtifact(raw.to_string()));
        }
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            artifact: artifact.to_string(),
        })
    }
}

impl std::fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.owner, self.repo, self.artifact)
    }
}

fn is_safe_segment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !s.starts_with('.')
}

/// Replace path separators in a branch name with `-` so it can be used as a
/// single cache directory component.
pub fn sanitize_ref(ref_name: &str) -> String {
    ref_name.replace(['/', '\\'], "-")
}
