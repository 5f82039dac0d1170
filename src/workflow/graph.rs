//! Step dependency graph.
//!
//! Steps are nodes and an edge `a -> b` means `a` must succeed before `b`
//! starts. Steps with no path between them may run in parallel.

use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct StepGraph {
    graph: DiGraph<String, ()>,
    index: HashMap<String, NodeIndex>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a step by name.
    ///
    /// # Errors
    /// Returns `Error::Validation` if a step with this name already exists.
    pub fn add_step(&mut self, name: &str) -> Result<()> {
        if self.index.contains_key(name) {
            return Err(Error::Validation(format!("duplicate step name: {name}")));
        }
        let node = self.graph.add_node(name.to_string());
        self.index.insert(name.to_string(), node);
        Ok(())
    }

    /// Declare that `step` depends on `dependency`.
    ///
    /// # Errors
    /// Returns `Error::Validation` if either step is unknown or the edge
    /// would create a cycle. A rejected edge leaves the graph unchanged.
    pub fn add_dependency(&mut self, step: &str, dependency: &str) -> Result<()> {
        let to = self.node(step)?;
        let from = self.node(dependency)?;
        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }

        let edge = self.graph.add_edge(from, to, ());
        if is_cyclic_directed(&self.graph) {
            self.graph.remove_edge(edge);
            return Err(Error::Validation(format!(
                "dependency of {step} on {dependency} would create a cycle"
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Direct dependencies of a step, sorted by name.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        let Some(&node) = self.index.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<&str> = self
            .graph
            .neighbors_directed(node, Direction::Incoming)
            .filter_map(|n| self.graph.node_weight(n).map(String::as_str))
            .collect();
        deps.sort_unstable();
        deps
    }

    /// Group steps into layers that can run concurrently.
    ///
    /// A step's layer is the length of the longest dependency path leading
    /// to it, so every dependency sits in an earlier layer. Within a layer
    /// steps keep insertion order. A chain yields one step per layer.
    pub fn layers(&self) -> Result<Vec<Vec<String>>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(String::as_str)
                .unwrap_or("unknown");
            Error::Validation(format!("cycle detected at step: {name}"))
        })?;

        let mut depth: HashMap<NodeIndex, usize> = HashMap::new();
        for node in order {
            let d = self
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter_map(|dep| depth.get(&dep))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(node, d);
        }

        let layer_count = depth.values().max().map(|d| d + 1).unwrap_or(0);
        let mut layers = vec![Vec::new(); layer_count];
        for node in self.graph.node_indices() {
            if let (Some(&d), Some(name)) = (depth.get(&node), self.graph.node_weight(node)) {
                layers[d].push(name.clone());
            }
        }
        Ok(layers)
    }

    fn node(&self, name: &str) -> Result<NodeIndex> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| Error::Validation(format!("unknown step: {name}")))
    }
}
