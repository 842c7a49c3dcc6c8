//! Dependency resolution.
//!
//! Builds the dependency graph from explicit `depends_on` entries and from
//! references found in attribute values, then orders it with a depth-first
//! topological sort. Roots are visited in input order and edges in declaration
//! order, so independent resources keep their input order.

use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::error::GraphError;
use crate::model::DeploymentGraph;

/// A dependency-respecting order over the resources of a graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOrder {
    order: Vec<String>,
    dependencies: HashMap<String, Vec<String>>,
}

/// Resolver for deployment graphs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Creates a new resolver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Orders a graph so that every resource follows its dependencies.
    ///
    /// # Errors
    ///
    /// Returns `UnknownReference` for edges to undeclared resources and
    /// `Cycle` naming the participants if the graph is not a DAG.
    pub fn resolve(&self, graph: &DeploymentGraph) -> Result<ExecutionOrder, GraphError> {
        let mut nodes: Vec<(String, Vec<String>)> = Vec::with_capacity(graph.len());

        for resource in graph.resources() {
            if resource.references_self() {
                return Err(GraphError::Cycle {
                    participants: vec![resource.id.clone(), resource.id.clone()],
                });
            }

            let deps = resource.dependencies();
            if let Some(missing) = deps.iter().find(|d| !graph.contains(d)) {
                return Err(GraphError::UnknownReference {
                    resource: resource.id.clone(),
                    target: missing.clone(),
                });
            }
            nodes.push((resource.id.clone(), deps));
        }

        let order = topological_order(&nodes)?;
        debug!("Resolved execution order: {}", order.join(" -> "));

        Ok(ExecutionOrder {
            order,
            dependencies: nodes.into_iter().collect(),
        })
    }
}

/// Depth-first topological sort over `(id, dependencies)` pairs.
///
/// Dependencies naming ids not present in `nodes` are ignored.
///
/// # Errors
///
/// Returns `Cycle` with the participants in cycle order, first id repeated
/// at the end.
pub fn topological_order(nodes: &[(String, Vec<String>)]) -> Result<Vec<String>, GraphError> {
    let edges: HashMap<&str, &[String]> = nodes
        .iter()
        .map(|(id, deps)| (id.as_str(), deps.as_slice()))
        .collect();

    let mut visitor = Visitor {
        edges: &edges,
        done: HashSet::new(),
        path: Vec::new(),
        order: Vec::with_capacity(nodes.len()),
    };

    for (id, _) in nodes {
        visitor.visit(id)?;
    }

    Ok(visitor.order)
}

struct Visitor<'a> {
    edges: &'a HashMap<&'a str, &'a [String]>,
    done: HashSet<&'a str>,
    /// Current DFS path, used to report cycles.
    path: Vec<&'a str>,
    order: Vec<String>,
}

impl<'a> Visitor<'a> {
    fn visit(&mut self, id: &'a str) -> Result<(), GraphError> {
        if self.done.contains(id) {
            return Ok(());
        }

        if let Some(pos) = self.path.iter().position(|p| *p == id) {
            let mut participants: Vec<String> =
                self.path[pos..].iter().map(|p| (*p).to_string()).collect();
            participants.push(id.to_string());
            return Err(GraphError::Cycle { participants });
        }

        let edges = self.edges;
        self.path.push(id);
        if let Some(deps) = edges.get(id) {
            for dep in *deps {
                if edges.contains_key(dep.as_str()) {
                    self.visit(dep)?;
                }
            }
        }
        self.path.pop();

        self.done.insert(id);
        self.order.push(id.to_string());
        Ok(())
    }
}

impl ExecutionOrder {
    /// Returns the ids in execution order.
    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    /// Returns the direct dependencies of `id`.
    #[must_use]
    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Returns the position of `id` in the order.
    #[must_use]
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|o| o == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeValue, Resource};

    fn graph(resources: Vec<Resource>) -> DeploymentGraph {
        DeploymentGraph::new(resources, vec![]).unwrap()
    }

    fn reference(target: &str) -> AttributeValue {
        AttributeValue::reference(target, "id")
    }

    #[test]
    fn test_order_respects_references() {
        // Declared dependents-first on purpose.
        let g = graph(vec![
            Resource::new("web1", "instance").with_attribute("network", reference("vpc")),
            Resource::new("web_sg", "security_group").with_attribute("network", reference("vpc")),
            Resource::new("vpc", "network"),
        ]);

        let order = DependencyResolver::new().resolve(&g).unwrap();
        assert_eq!(order.ids(), ["vpc", "web1", "web_sg"]);
        assert_eq!(order.dependencies_of("web1"), ["vpc"]);
        assert!(order.dependencies_of("vpc").is_empty());
    }

    #[test]
    fn test_order_respects_explicit_edges() {
        let g = graph(vec![
            Resource::new("a", "network").depends_on("b"),
            Resource::new("b", "network"),
        ]);
        let order = DependencyResolver::new().resolve(&g).unwrap();
        assert!(order.position("b") < order.position("a"));
    }

    #[test]
    fn test_independent_resources_keep_input_order() {
        let g = graph(vec![
            Resource::new("c", "network"),
            Resource::new("a", "network"),
            Resource::new("b", "network"),
        ]);
        let order = DependencyResolver::new().resolve(&g).unwrap();
        assert_eq!(order.ids(), ["c", "a", "b"]);
    }

    #[test]
    fn test_cycle_names_participants() {
        let g = graph(vec![
            Resource::new("vpc", "network"),
            Resource::new("a", "network").with_attribute("x", reference("b")),
            Resource::new("b", "network").with_attribute("x", reference("c")),
            Resource::new("c", "network").depends_on("a"),
        ]);

        let err = DependencyResolver::new().resolve(&g).unwrap_err();
        match err {
            GraphError::Cycle { participants } => {
                assert_eq!(participants, ["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let g = graph(vec![
            Resource::new("a", "network").with_attribute("x", reference("a")),
        ]);
        assert!(matches!(
            DependencyResolver::new().resolve(&g),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_unknown_reference() {
        let g = graph(vec![
            Resource::new("web1", "instance").with_attribute("network", reference("vpc")),
        ]);
        let err = DependencyResolver::new().resolve(&g).unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownReference { ref resource, ref target }
                if resource == "web1" && target == "vpc"
        ));
    }

    #[test]
    fn test_topological_order_ignores_foreign_ids() {
        let nodes = vec![
            ("web1".to_string(), vec!["vpc".to_string(), "gone".to_string()]),
            ("vpc".to_string(), vec![]),
        ];
        assert_eq!(topological_order(&nodes).unwrap(), ["vpc", "web1"]);
    }
}
