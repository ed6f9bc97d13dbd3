//! The dependents graph: transitive manifest walk, cycle detection, and the
//! rendered tree shown by `tako graph`.
//!
//! Nodes are keyed by canonical absolute path, not by name, so a repository
//! reachable through two parents materializes exactly once.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use tako_core::codes::ErrorCode;
use tako_core::manifest::{Manifest, ManifestError};

use crate::resolver::{ResolveError, Resolver};

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("circular dependency detected: {0}")]
    Cycle(String),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("failed to canonicalize {path}: {source}")]
    Canonicalize {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl GraphError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Cycle(_) => ErrorCode::CircularDependency,
            Self::Manifest(e) => e.code(),
            Self::Resolve(e) => e.code(),
            Self::Canonicalize { .. } => ErrorCode::RepoResolveFailed,
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

/// One resolved repository in the graph.
#[derive(Debug)]
pub struct Node {
    /// Canonical absolute path of the checkout.
    pub path: PathBuf,
    /// Display name: `metadata.name`, falling back to the directory name.
    pub name: String,
    pub manifest: Manifest,
    /// Outgoing edges, in manifest order.
    pub dependents: Vec<Arc<Node>>,
}

/// The whole dependents graph rooted at the invocation repository.
#[derive(Debug)]
pub struct Graph {
    pub root: Arc<Node>,
    /// Every node, keyed by canonical path.
    pub nodes: HashMap<PathBuf, Arc<Node>>,
}

impl Graph {
    /// Walk manifests transitively from `root_path`.
    pub fn build(root_path: &Path, resolver: &Resolver) -> Result<Self> {
        let mut builder = Builder {
            resolver,
            visiting: Vec::new(),
            visited: HashMap::new(),
        };
        let root = builder.visit(root_path)?;
        Ok(Self {
            root,
            nodes: builder.visited,
        })
    }

    /// Find a node by display name.
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.values().find(|node| node.name == name)
    }

    /// Render the tree the way `tako graph` prints it. Shared nodes appear
    /// under every parent.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&self.root.name);
        out.push('\n');
        render_children(&self.root, "", &mut out);
        out
    }
}

fn render_children(node: &Node, prefix: &str, out: &mut String) {
    let count = node.dependents.len();
    for (index, child) in node.dependents.iter().enumerate() {
        let last = index == count - 1;
        out.push_str(prefix);
        out.push_str(if last { "└── " } else { "├── " });
        out.push_str(&child.name);
        out.push('\n');
        let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
        render_children(child, &child_prefix, out);
    }
}

struct Builder<'a> {
    resolver: &'a Resolver,
    /// DFS stack of (canonical path, display name).
    visiting: Vec<(PathBuf, String)>,
    visited: HashMap<PathBuf, Arc<Node>>,
}

impl Builder<'_> {
    fn visit(&mut self, repo_path: &Path) -> Result<Arc<Node>> {
        let canonical =
            std::fs::canonicalize(repo_path).map_err(|source| GraphError::Canonicalize {
                path: repo_path.display().to_string(),
                source,
            })?;

        if let Some(existing) = self.visited.get(&canonical) {
            debug!(path = %canonical.display(), "reusing already-built node");
            return Ok(Arc::clone(existing));
        }

        let manifest = Manifest::load_from_dir(&canonical)?;
        let name = display_name(&canonical, &manifest);

        if let Some(first) = self
            .visiting
            .iter()
            .position(|(path, _)| path == &canonical)
        {
            let mut chain: Vec<&str> = self.visiting[first..]
                .iter()
                .map(|(_, n)| n.as_str())
                .collect();
            chain.push(&name);
            return Err(GraphError::Cycle(chain.join(" -> ")));
        }

        self.visiting.push((canonical.clone(), name.clone()));
        let result = self.visit_dependents(&canonical, &manifest);
        self.visiting.pop();
        let dependents = result?;

        let node = Arc::new(Node {
            path: canonical.clone(),
            name,
            manifest,
            dependents,
        });
        self.visited.insert(canonical, Arc::clone(&node));
        Ok(node)
    }

    fn visit_dependents(
        &mut self,
        current: &Path,
        manifest: &Manifest,
    ) -> Result<Vec<Arc<Node>>> {
        let mut dependents = Vec::with_capacity(manifest.dependents.len());
        for dependent in &manifest.dependents {
            let resolved = self.resolver.resolve(&dependent.repo, current)?;
            dependents.push(self.visit(&resolved)?);
        }
        Ok(dependents)
    }
}

fn display_name(path: &Path, manifest: &Manifest) -> String {
    manifest.metadata.name.clone().unwrap_or_else(|| {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write a repo directory with a manifest naming `name` and declaring
    /// `dependents` as relative references.
    fn write_repo(root: &Path, name: &str, dependents: &[&str]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let mut manifest = format!("version: \"1.0.0\"\nmetadata:\n  name: {name}\n");
        if !dependents.is_empty() {
            manifest.push_str("dependents:\n");
            for dep in dependents {
                manifest.push_str(&format!("  - repo: ../{dep}\n"));
            }
        }
        std::fs::write(dir.join("tako.yml"), manifest).unwrap();
    }

    fn build(root: &Path, name: &str) -> Result<Graph> {
        let resolver = Resolver::new(root.join("cache"), true);
        Graph::build(&root.join(name), &resolver)
    }

    #[test]
    fn simple_chain_renders_expected_tree() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "A", &["B"]);
        write_repo(dir.path(), "B", &[]);

        let graph = build(dir.path(), "A").unwrap();
        assert_eq!(graph.render(), "A\n└── B\n");
    }

    #[test]
    fn complex_graph_renders_with_shared_child_under_both_parents() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "A", &["B", "D"]);
        write_repo(dir.path(), "B", &["C"]);
        write_repo(dir.path(), "C", &["E"]);
        write_repo(dir.path(), "D", &["E"]);
        write_repo(dir.path(), "E", &[]);

        let graph = build(dir.path(), "A").unwrap();
        let expected = "\
A
├── B
│   └── C
│       └── E
└── D
    └── E
";
        assert_eq!(graph.render(), expected);
    }

    #[test]
    fn fan_in_materializes_shared_node_once() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "A", &["B", "D"]);
        write_repo(dir.path(), "B", &["E"]);
        write_repo(dir.path(), "D", &["E"]);
        write_repo(dir.path(), "E", &[]);

        let graph = build(dir.path(), "A").unwrap();
        assert_eq!(graph.nodes.len(), 4);

        let b = graph.find_by_name("B").unwrap();
        let d = graph.find_by_name("D").unwrap();
        assert!(Arc::ptr_eq(&b.dependents[0], &d.dependents[0]));
    }

    #[test]
    fn two_node_cycle_reports_name_chain() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "A", &["B"]);
        write_repo(dir.path(), "B", &["A"]);

        let err = build(dir.path(), "A").unwrap_err();
        assert_eq!(
            err.to_string(),
            "circular dependency detected: A -> B -> A"
        );
        assert_eq!(err.code(), ErrorCode::CircularDependency);
    }

    #[test]
    fn self_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "A", &["A"]);

        let err = build(dir.path(), "A").unwrap_err();
        assert_eq!(err.to_string(), "circular dependency detected: A -> A");
    }

    #[test]
    fn invalid_manifest_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("A");
        std::fs::create_dir_all(&repo).unwrap();
        std::fs::write(repo.join("tako.yml"), "version: \"\"\n").unwrap();

        let err = build(dir.path(), "A").unwrap_err();
        assert_eq!(err.code(), ErrorCode::ManifestInvalid);
    }
}
