//! Immutable processing graphs
//!
//! A `Graph` is produced once by `GraphBuilder::build` and never mutated
//! afterwards. Every graph carries two virtual identity nodes: `inputnode`,
//! whose ports are the graph inputs, and `outputnode`, whose ports are the
//! declared outputs.

use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;

use serde::{Deserialize, Serialize};

use crate::error::{RegflowError, Result};
use crate::node::Node;
use crate::types::{PortRef, PortSpec, ResourceHint, Selector};

/// Name of the virtual node exposing graph inputs
pub const INPUT_NODE: &str = "inputnode";

/// Name of the virtual node collecting graph outputs
pub const OUTPUT_NODE: &str = "outputnode";

/// A data dependency between two ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub source: PortRef,
    pub target: PortRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
}

/// State of a declared graph output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "source", rename_all = "camelCase")]
pub enum OutputState {
    /// Fed by exactly one producing port
    Bound(PortRef),
    /// Optional output whose producing branch was not instantiated
    NotTaken,
}

/// A declared graph output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphOutput {
    pub port: PortSpec,
    pub state: OutputState,
}

/// How a branch group was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    /// Exactly one alternative instantiated
    Exclusive,
    /// Any subset instantiated
    Additive,
}

/// Record of a conditional-topology decision taken at build time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BranchRecord {
    pub group: String,
    pub kind: BranchKind,
    /// Branches that were instantiated
    pub taken: Vec<String>,
    /// Branches that were considered but not instantiated
    pub skipped: Vec<String>,
}

/// An immutable, acyclic processing graph
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) name: String,
    pub(crate) nodes: Vec<Node>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) outputs: Vec<GraphOutput>,
    pub(crate) branches: Vec<BranchRecord>,
    pub(crate) embedded: BTreeSet<String>,
}

impl Graph {
    /// Graph name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// All nodes in insertion order, including the virtual ones
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// All edges in insertion order
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Look up a node by name
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Whether a node with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Names of all nodes in insertion order
    pub fn node_names(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.name.as_str()).collect()
    }

    /// Graph input ports
    pub fn input_ports(&self) -> &[PortSpec] {
        self.node(INPUT_NODE).map(|n| n.inputs.as_slice()).unwrap_or(&[])
    }

    /// Declared outputs and their states
    pub fn outputs(&self) -> &[GraphOutput] {
        &self.outputs
    }

    /// State of a declared output
    pub fn output_state(&self, name: &str) -> Option<&OutputState> {
        self.outputs
            .iter()
            .find(|o| o.port.name == name)
            .map(|o| &o.state)
    }

    /// Branch decisions recorded at build time
    pub fn branches(&self) -> &[BranchRecord] {
        &self.branches
    }

    /// The branch instantiated for an exclusive group
    pub fn branch_selection(&self, group: &str) -> Option<&str> {
        self.branches
            .iter()
            .find(|b| b.group == group && b.kind == BranchKind::Exclusive)
            .and_then(|b| b.taken.first())
            .map(|s| s.as_str())
    }

    /// Names of every graph embedded in this one, transitively
    pub fn embedded_graphs(&self) -> &BTreeSet<String> {
        &self.embedded
    }

    /// Edges feeding a node
    pub fn inbound_edges<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| e.target.node == node)
    }

    /// Distinct producers a node depends on, in edge order
    pub fn dependencies(&self, node: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for edge in self.edges.iter().filter(|e| e.target.node == node) {
            if !deps.contains(&edge.source.node.as_str()) {
                deps.push(&edge.source.node);
            }
        }
        deps
    }

    /// Distinct consumers of a node's outputs, in edge order
    pub fn dependents(&self, node: &str) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for edge in self.edges.iter().filter(|e| e.source.node == node) {
            if !deps.contains(&edge.target.node.as_str()) {
                deps.push(&edge.target.node);
            }
        }
        deps
    }

    /// Topological order of node indices
    ///
    /// Kahn's algorithm; among ready nodes the earliest inserted goes first,
    /// so the order is deterministic for identical assembly.
    pub fn topological_order(&self) -> Result<Vec<usize>> {
        topological_order(&self.name, &self.nodes, &self.index, &self.edges)
    }

    /// Node names in topological order
    pub fn execution_order(&self) -> Result<Vec<&str>> {
        Ok(self
            .topological_order()?
            .into_iter()
            .map(|i| self.nodes[i].name.as_str())
            .collect())
    }

    /// Structural summary used for determinism checks and diagnostics
    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            name: self.name.clone(),
            nodes: self
                .nodes
                .iter()
                .map(|n| NodeSummary {
                    name: n.name.clone(),
                    kind: n.kind().to_string(),
                    inputs: n.inputs.iter().map(|p| p.name.clone()).collect(),
                    outputs: n.outputs.iter().map(|p| p.name.clone()).collect(),
                    resources: n.resources,
                    params: n.params.clone(),
                    static_inputs: n.static_inputs.keys().cloned().collect(),
                })
                .collect(),
            edges: self.edges.clone(),
            outputs: self.outputs.clone(),
            branches: self.branches.clone(),
            embedded: self.embedded.iter().cloned().collect(),
        }
    }
}

pub(crate) fn topological_order(
    graph: &str,
    nodes: &[Node],
    index: &HashMap<String, usize>,
    edges: &[Edge],
) -> Result<Vec<usize>> {
    let mut in_degree = vec![0usize; nodes.len()];
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for edge in edges {
        let (Some(&src), Some(&dst)) = (index.get(&edge.source.node), index.get(&edge.target.node))
        else {
            continue;
        };
        adjacency[src].push(dst);
        in_degree[dst] += 1;
    }

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|&(_, &d)| d == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(nodes.len());
    while let Some(Reverse(current)) = ready.pop() {
        order.push(current);
        for &next in &adjacency[current] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &d)| d > 0)
            .map(|(i, _)| nodes[i].name.clone())
            .collect();
        return Err(RegflowError::CyclicGraph {
            graph: graph.to_string(),
            nodes: stuck,
        });
    }

    Ok(order)
}

/// Serializable structure of a graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub name: String,
    pub nodes: Vec<NodeSummary>,
    pub edges: Vec<Edge>,
    pub outputs: Vec<GraphOutput>,
    pub branches: Vec<BranchRecord>,
    pub embedded: Vec<String>,
}

/// Serializable structure of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSummary {
    pub name: String,
    pub kind: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub resources: Option<ResourceHint>,
    pub params: serde_json::Value,
    pub static_inputs: Vec<String>,
}

impl GraphSummary {
    /// Whether a node of this name is part of the graph
    pub fn has_node(&self, name: &str) -> bool {
        self.nodes.iter().any(|n| n.name == name)
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::GraphBuilder;
    use crate::node::Node;
    use crate::types::ArtifactKind;

    fn chain() -> crate::graph::Graph {
        let mut builder = GraphBuilder::new("chain");
        let input = builder.input("in_file", ArtifactKind::Volume);
        let out = builder.declare_output("out_file", ArtifactKind::Volume);

        // inserted out of dependency order on purpose
        let late = builder
            .add_node(Node::identity("late", &[("x", ArtifactKind::Any)]))
            .unwrap();
        let early = builder
            .add_node(Node::identity("early", &[("x", ArtifactKind::Any)]))
            .unwrap();
        let side = builder
            .add_node(Node::identity("side", &[("x", ArtifactKind::Any)]))
            .unwrap();

        builder.connect(input.clone(), early.input("x")).unwrap();
        builder.connect(early.output("x"), late.input("x")).unwrap();
        builder.connect(input, side.input("x")).unwrap();
        builder.connect(late.output("x"), out).unwrap();
        builder.build().unwrap()
    }

    #[test]
    fn test_topological_order_tie_break() {
        let graph = chain();
        let order = graph.execution_order().unwrap();
        assert_eq!(order, vec!["inputnode", "early", "late", "side", "outputnode"]);
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let graph = chain();
        assert_eq!(graph.dependencies("late"), vec!["early"]);
        assert_eq!(graph.dependents("inputnode"), vec!["early", "side"]);
        assert_eq!(graph.input_ports().len(), 1);
    }

    #[test]
    fn test_dependencies_outlive_the_queried_name() {
        let graph = chain();
        let deps = {
            let name = String::from("outputnode");
            graph.dependencies(&name)
        };
        assert_eq!(deps, vec!["late"]);
    }

    #[test]
    fn test_summary_is_deterministic() {
        assert_eq!(chain().summary(), chain().summary());
        let json = serde_json::to_value(chain().summary()).unwrap();
        assert_eq!(json["name"], "chain");
    }
}
