//! Filtering and topological planning over the dependents graph.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use tako_core::codes::ErrorCode;

use crate::graph::{Graph, Node};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("no repository named `{0}` in the graph")]
    FilterNotFound(String),
    #[error("graph contains a cycle involving {0}")]
    Cycle(String),
}

impl PlanError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::FilterNotFound(_) => ErrorCode::FilterNotFound,
            Self::Cycle(_) => ErrorCode::CircularDependency,
        }
    }
}

pub type Result<T> = std::result::Result<T, PlanError>;

/// Restrict the graph to `only` (plus descendants), then subtract `ignore`
/// (plus descendants). An empty `only` selects everything. Naming a
/// repository the graph does not contain is fatal; an empty result is not.
pub fn filter(
    graph: &Graph,
    only: &[String],
    ignore: &[String],
) -> Result<HashSet<PathBuf>> {
    let mut selected: HashSet<PathBuf> = if only.is_empty() {
        graph.nodes.keys().cloned().collect()
    } else {
        let mut set = HashSet::new();
        for name in only {
            let node = graph
                .find_by_name(name)
                .ok_or_else(|| PlanError::FilterNotFound(name.clone()))?;
            collect_subtree(node, &mut set);
        }
        set
    };

    for name in ignore {
        let node = graph
            .find_by_name(name)
            .ok_or_else(|| PlanError::FilterNotFound(name.clone()))?;
        let mut removed = HashSet::new();
        collect_subtree(node, &mut removed);
        for path in removed {
            selected.remove(&path);
        }
    }

    Ok(selected)
}

fn collect_subtree(node: &Arc<Node>, out: &mut HashSet<PathBuf>) {
    if !out.insert(node.path.clone()) {
        return;
    }
    for child in &node.dependents {
        collect_subtree(child, out);
    }
}

/// Kahn's algorithm, emitting ready sets level by level. Ties within a
/// level sort by repository name so runs are deterministic. The sort
/// re-validates acyclicity even though `Graph::build` already did.
pub fn topo_levels(
    graph: &Graph,
    subset: &HashSet<PathBuf>,
) -> Result<Vec<Vec<Arc<Node>>>> {
    let mut in_degree: HashMap<PathBuf, usize> = subset.iter().map(|p| (p.clone(), 0)).collect();
    for node in graph.nodes.values() {
        if !subset.contains(&node.path) {
            continue;
        }
        for child in &node.dependents {
            if let Some(degree) = in_degree.get_mut(&child.path) {
                *degree += 1;
            }
        }
    }

    let mut levels = Vec::new();
    let mut emitted = 0usize;
    loop {
        let mut ready: Vec<Arc<Node>> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(path, _)| Arc::clone(&graph.nodes[path]))
            .collect();
        if ready.is_empty() {
            break;
        }
        ready.sort_by(|a, b| a.name.cmp(&b.name));

        for node in &ready {
            in_degree.remove(&node.path);
            for child in &node.dependents {
                if let Some(degree) = in_degree.get_mut(&child.path) {
                    *degree = degree.saturating_sub(1);
                }
            }
        }
        emitted += ready.len();
        levels.push(ready);
    }

    if emitted != subset.len() {
        let stuck = in_degree
            .keys()
            .filter_map(|path| graph.nodes.get(path))
            .map(|node| node.name.clone())
            .min()
            .unwrap_or_default();
        return Err(PlanError::Cycle(stuck));
    }

    Ok(levels)
}

/// Flattened topological order.
pub fn topo_sort(graph: &Graph, subset: &HashSet<PathBuf>) -> Result<Vec<Arc<Node>>> {
    Ok(topo_levels(graph, subset)?.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolver;
    use std::path::Path;

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

    fn diamond() -> (tempfile::TempDir, Graph) {
        let dir = tempfile::tempdir().unwrap();
        write_repo(dir.path(), "A", &["B", "D"]);
        write_repo(dir.path(), "B", &["C"]);
        write_repo(dir.path(), "C", &["E"]);
        write_repo(dir.path(), "D", &["E"]);
        write_repo(dir.path(), "E", &[]);
        let resolver = Resolver::new(dir.path().join("cache"), true);
        let graph = Graph::build(&dir.path().join("A"), &resolver).unwrap();
        (dir, graph)
    }

    fn names(nodes: &[Arc<Node>]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn level_sort_matches_expected_order() {
        let (_dir, graph) = diamond();
        let all = filter(&graph, &[], &[]).unwrap();
        let order = topo_sort(&graph, &all).unwrap();
        assert_eq!(names(&order), ["A", "B", "D", "C", "E"]);
    }

    #[test]
    fn every_node_appears_exactly_once_and_edges_respected() {
        let (_dir, graph) = diamond();
        let all = filter(&graph, &[], &[]).unwrap();
        let order = topo_sort(&graph, &all).unwrap();
        assert_eq!(order.len(), graph.nodes.len());

        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();
        for node in graph.nodes.values() {
            for child in &node.dependents {
                assert!(
                    position[node.name.as_str()] < position[child.name.as_str()],
                    "{} must precede {}",
                    node.name,
                    child.name
                );
            }
        }
    }

    #[test]
    fn only_selects_subtree() {
        let (_dir, graph) = diamond();
        let subset = filter(&graph, &["B".into()], &[]).unwrap();
        let order = topo_sort(&graph, &subset).unwrap();
        assert_eq!(names(&order), ["B", "C", "E"]);
    }

    #[test]
    fn ignore_removes_subtree() {
        let (_dir, graph) = diamond();
        let subset = filter(&graph, &[], &["B".into()]).unwrap();
        let order = topo_sort(&graph, &subset).unwrap();
        assert_eq!(names(&order), ["A", "D"]);
    }

    #[test]
    fn only_then_ignore_composes() {
        let (_dir, graph) = diamond();
        let subset = filter(&graph, &["B".into()], &["C".into()]).unwrap();
        let order = topo_sort(&graph, &subset).unwrap();
        assert_eq!(names(&order), ["B"]);
    }

    #[test]
    fn unknown_filter_name_is_fatal() {
        let (_dir, graph) = diamond();
        let err = filter(&graph, &["Z".into()], &[]).unwrap_err();
        assert!(matches!(err, PlanError::FilterNotFound(_)));
        assert_eq!(err.code(), ErrorCode::FilterNotFound);
    }

    #[test]
    fn empty_result_is_allowed() {
        let (_dir, graph) = diamond();
        let subset = filter(&graph, &["E".into()], &["E".into()]).unwrap();
        assert!(subset.is_empty());
        assert!(topo_sort(&graph, &subset).unwrap().is_empty());
    }

    #[test]
    fn levels_group_independent_nodes() {
        let (_dir, graph) = diamond();
        let all = filter(&graph, &[], &[]).unwrap();
        let levels = topo_levels(&graph, &all).unwrap();
        let level_names: Vec<Vec<&str>> = levels.iter().map(|l| names(l)).collect();
        assert_eq!(level_names, [vec!["A"], vec!["B", "D"], vec!["C"], vec!["E"]]);
    }
}
