//! DAG template validation.
//!
//! A template is schedulable when its node ids are unique, every
//! `depends_on` references a declared id, and the dependency graph is
//! acyclic. Cycle detection is a DFS carrying a recursion set; templates
//! are rejected both at create time and again at start time, since
//! user-authored templates may be edited between the two.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

use crate::store::models::DagNode;

#[derive(Debug, Error, Diagnostic, PartialEq, Eq)]
pub enum TemplateError {
    #[error("node id {0:?} is declared more than once")]
    #[diagnostic(code(recongraph::dag::duplicate_node))]
    DuplicateNodeId(String),

    #[error("node {node:?} depends on undeclared node {dependency:?}")]
    #[diagnostic(code(recongraph::dag::unknown_dependency))]
    UnknownDependency { node: String, dependency: String },

    #[error("dependency cycle involving node {0:?}")]
    #[diagnostic(
        code(recongraph::dag::cycle),
        help("Remove the back-edge; only acyclic graphs are schedulable.")
    )]
    Cycle(String),
}

/// Validate a node list for scheduling.
pub fn validate_nodes(nodes: &[DagNode]) -> Result<(), TemplateError> {
    let mut declared = FxHashSet::default();
    for node in nodes {
        if !declared.insert(node.id.as_str()) {
            return Err(TemplateError::DuplicateNodeId(node.id.clone()));
        }
    }
    for node in nodes {
        for dep in &node.depends_on {
            if !declared.contains(dep.as_str()) {
                return Err(TemplateError::UnknownDependency {
                    node: node.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    detect_cycle(nodes)
}

/// Map of node id → its dependency set.
pub fn dependency_graph(nodes: &[DagNode]) -> FxHashMap<String, FxHashSet<String>> {
    let mut graph = FxHashMap::default();
    for node in nodes {
        graph.insert(
            node.id.clone(),
            node.depends_on.iter().cloned().collect::<FxHashSet<_>>(),
        );
    }
    graph
}

fn detect_cycle(nodes: &[DagNode]) -> Result<(), TemplateError> {
    let graph = dependency_graph(nodes);
    let mut visited = FxHashSet::default();
    let mut in_stack = FxHashSet::default();

    fn dfs(
        node: &str,
        graph: &FxHashMap<String, FxHashSet<String>>,
        visited: &mut FxHashSet<String>,
        in_stack: &mut FxHashSet<String>,
    ) -> Result<(), TemplateError> {
        visited.insert(node.to_string());
        in_stack.insert(node.to_string());
        if let Some(deps) = graph.get(node) {
            for dep in deps {
                if in_stack.contains(dep) {
                    return Err(TemplateError::Cycle(dep.clone()));
                }
                if !visited.contains(dep) {
                    dfs(dep, graph, visited, in_stack)?;
                }
            }
        }
        in_stack.remove(node);
        Ok(())
    }

    for node in graph.keys() {
        if !visited.contains(node) {
            dfs(node, &graph, &mut visited, &mut in_stack)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;
    use serde_json::json;

    fn node(id: &str, deps: &[&str]) -> DagNode {
        DagNode {
            id: id.to_string(),
            task_type: TaskType::SubdomainScan,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            config: json!({}),
        }
    }

    #[test]
    fn accepts_linear_chain() {
        let nodes = vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])];
        assert!(validate_nodes(&nodes).is_ok());
    }

    #[test]
    fn accepts_diamond() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["b", "c"]),
        ];
        assert!(validate_nodes(&nodes).is_ok());
    }

    #[test]
    fn rejects_two_node_cycle() {
        let nodes = vec![node("a", &["b"]), node("b", &["a"])];
        assert!(matches!(validate_nodes(&nodes), Err(TemplateError::Cycle(_))));
    }

    #[test]
    fn rejects_self_loop() {
        let nodes = vec![node("a", &["a"])];
        assert!(matches!(validate_nodes(&nodes), Err(TemplateError::Cycle(_))));
    }

    #[test]
    fn rejects_long_cycle_behind_valid_prefix() {
        let nodes = vec![
            node("a", &[]),
            node("b", &["a", "d"]),
            node("c", &["b"]),
            node("d", &["c"]),
        ];
        assert!(matches!(validate_nodes(&nodes), Err(TemplateError::Cycle(_))));
    }

    #[test]
    fn rejects_duplicate_node_ids() {
        let nodes = vec![node("a", &[]), node("a", &[])];
        assert_eq!(
            validate_nodes(&nodes),
            Err(TemplateError::DuplicateNodeId("a".to_string()))
        );
    }

    #[test]
    fn rejects_unknown_dependency() {
        let nodes = vec![node("a", &["ghost"])];
        assert_eq!(
            validate_nodes(&nodes),
            Err(TemplateError::UnknownDependency {
                node: "a".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn empty_template_is_valid() {
        assert!(validate_nodes(&[]).is_ok());
    }
}
