//! Fluent builder for processing graphs
//!
//! Assembly happens in a single pass: add nodes, connect ports, declare
//! outputs, then `build()` into an immutable `Graph`. Structural mistakes
//! (name clashes, undeclared ports, double-connected inputs, unconnected
//! required outputs, cycles) are reported here, before anything runs.
//!
//! # Example
//!
//! ```ignore
//! let mut builder = GraphBuilder::new("coreg_wf");
//! let t1w = builder.input("in_t1w", ArtifactKind::Volume);
//! let n4 = builder.add_node(registry.instantiate("final_n4", "n4-bias-correction")?)?;
//! builder.connect(t1w, n4.input("input_image"))?;
//! let out = builder.declare_output("t1w_preproc", ArtifactKind::Volume);
//! builder.connect(n4.output("output_image"), out)?;
//! let graph = builder.build()?;
//! ```

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::error::{PortDirection, RegflowError, Result};
use crate::graph::{
    topological_order, BranchRecord, Edge, Graph, GraphOutput, OutputState, INPUT_NODE,
    OUTPUT_NODE,
};
use crate::node::{Identity, Node, NodeHandle};
use crate::subgraph::SubgraphOperation;
use crate::types::{Artifact, ArtifactKind, PortRef, PortSpec, Selector, Source};

/// Single-pass graph builder
pub struct GraphBuilder {
    name: String,
    nodes: Vec<Node>,
    index: HashMap<String, usize>,
    edges: Vec<Edge>,
    /// Input ports that already have an inbound edge or static value
    connected: HashSet<PortRef>,
    branches: Vec<BranchRecord>,
    embedded: BTreeSet<String>,
}

impl GraphBuilder {
    /// Create a builder with empty virtual input and output nodes
    pub fn new(name: impl Into<String>) -> Self {
        let mut builder = Self {
            name: name.into(),
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
            connected: HashSet::new(),
            branches: Vec::new(),
            embedded: BTreeSet::new(),
        };
        builder.push_node(Node::new(INPUT_NODE, Arc::new(Identity)));
        builder.push_node(Node::new(OUTPUT_NODE, Arc::new(Identity)));
        builder
    }

    /// Graph name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a graph input and return its port on `inputnode`
    ///
    /// Declaring the same input twice returns the existing port.
    pub fn input(&mut self, name: &str, kind: ArtifactKind) -> PortRef {
        let node = &mut self.nodes[self.index[INPUT_NODE]];
        if node.find_input(name).is_none() {
            node.inputs.push(PortSpec::optional(name, kind));
            node.outputs.push(PortSpec::optional(name, kind));
        }
        PortRef::new(INPUT_NODE, name)
    }

    /// Declare several graph inputs at once
    pub fn inputs(&mut self, ports: &[(&str, ArtifactKind)]) -> NodeHandle {
        for (name, kind) in ports {
            self.input(name, *kind);
        }
        NodeHandle::new(INPUT_NODE)
    }

    /// Declare a required graph output
    ///
    /// `build()` fails with `UnconnectedOutput` unless it gets connected.
    pub fn declare_output(&mut self, name: &str, kind: ArtifactKind) -> PortRef {
        self.add_output(PortSpec::required(name, kind))
    }

    /// Declare an optional graph output
    ///
    /// Left unconnected, it becomes `NotTaken`.
    pub fn declare_optional_output(&mut self, name: &str, kind: ArtifactKind) -> PortRef {
        self.add_output(PortSpec::optional(name, kind))
    }

    fn add_output(&mut self, port: PortSpec) -> PortRef {
        let name = port.name.clone();
        let node = &mut self.nodes[self.index[OUTPUT_NODE]];
        if node.find_input(&name).is_none() {
            node.outputs.push(PortSpec::optional(&name, port.kind));
            node.inputs.push(port);
        }
        PortRef::new(OUTPUT_NODE, name)
    }

    /// Reference a declared graph output
    pub fn output(&self, name: &str) -> PortRef {
        PortRef::new(OUTPUT_NODE, name)
    }

    /// Add a node
    pub fn add_node(&mut self, node: Node) -> Result<NodeHandle> {
        if self.index.contains_key(&node.name) {
            return Err(RegflowError::DuplicateName {
                graph: self.name.clone(),
                node: node.name,
            });
        }

        for port in node.static_inputs.keys() {
            if node.find_input(port).is_none() {
                return Err(RegflowError::UnknownPort {
                    node: node.name.clone(),
                    port: port.clone(),
                    direction: PortDirection::Input,
                });
            }
            self.connected.insert(PortRef::new(&node.name, port));
        }

        let handle = NodeHandle::new(&node.name);
        log::trace!("Graph '{}': adding node '{}' ({})", self.name, node.name, node.kind());
        self.push_node(node);
        Ok(handle)
    }

    fn push_node(&mut self, node: Node) {
        self.index.insert(node.name.clone(), self.nodes.len());
        self.nodes.push(node);
    }

    /// Handle to an already added node
    pub fn handle(&self, name: &str) -> Result<NodeHandle> {
        if self.index.contains_key(name) {
            Ok(NodeHandle::new(name))
        } else {
            Err(self.unknown_node(name))
        }
    }

    /// Look up an already added node
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Whether a node with this name was added
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Whether an input port already has an inbound edge or static value
    pub fn is_connected(&self, port: &PortRef) -> bool {
        self.connected.contains(port)
    }

    /// Connect an output port to an input port
    pub fn connect(&mut self, source: PortRef, target: PortRef) -> Result<()> {
        self.add_edge(source, target, None)
    }

    /// Connect, picking part of a composite artifact on the way
    pub fn connect_with(
        &mut self,
        source: PortRef,
        target: PortRef,
        selector: Selector,
    ) -> Result<()> {
        self.add_edge(source, target, Some(selector))
    }

    /// Connect several (output, input) port pairs between two nodes
    pub fn connect_many(
        &mut self,
        source: &NodeHandle,
        target: &NodeHandle,
        ports: &[(&str, &str)],
    ) -> Result<()> {
        for (out_port, in_port) in ports {
            self.connect(source.output(out_port), target.input(in_port))?;
        }
        Ok(())
    }

    /// Fix an input port of an added node to a value
    pub fn set_static(&mut self, target: PortRef, value: Artifact) -> Result<()> {
        self.check_port(&target, PortDirection::Input)?;
        if !self.connected.insert(target.clone()) {
            return Err(RegflowError::PortArity {
                node: target.node,
                port: target.port,
            });
        }
        let idx = self.index[&target.node];
        self.nodes[idx].static_inputs.insert(target.port, value);
        Ok(())
    }

    /// Feed an input port from a `Source`
    pub fn bind(&mut self, source: impl Into<Source>, target: PortRef) -> Result<()> {
        match source.into() {
            Source::Port(port) => self.connect(port, target),
            Source::Value(value) => self.set_static(target, value),
        }
    }

    fn add_edge(
        &mut self,
        source: PortRef,
        target: PortRef,
        selector: Option<Selector>,
    ) -> Result<()> {
        self.check_port(&source, PortDirection::Output)?;
        self.check_port(&target, PortDirection::Input)?;

        if !self.connected.insert(target.clone()) {
            return Err(RegflowError::PortArity {
                node: target.node,
                port: target.port,
            });
        }

        log::trace!("Graph '{}': {} -> {}", self.name, source, target);
        self.edges.push(Edge {
            source,
            target,
            selector,
        });
        Ok(())
    }

    fn check_port(&self, port: &PortRef, direction: PortDirection) -> Result<()> {
        let node = self.node(&port.node).ok_or_else(|| self.unknown_node(&port.node))?;
        let declared = match direction {
            PortDirection::Input => node.find_input(&port.port),
            PortDirection::Output => node.find_output(&port.port),
        };
        if declared.is_none() {
            return Err(RegflowError::UnknownPort {
                node: port.node.clone(),
                port: port.port.clone(),
                direction,
            });
        }
        Ok(())
    }

    fn unknown_node(&self, node: &str) -> RegflowError {
        RegflowError::UnknownNode {
            graph: self.name.clone(),
            node: node.to_string(),
        }
    }

    /// Embed a built graph as a single black-box node
    ///
    /// The child's inputs become the node's inputs and its bound outputs the
    /// node's outputs.
    ///
    /// Graphs are identified by name. A child whose own name, or the name of
    /// any graph embedded in it, equals this graph's name is rejected as
    /// recursive, even when the two were assembled independently: give each
    /// pipeline graph a distinct name.
    pub fn embed_subgraph(&mut self, name: impl Into<String>, child: &Graph) -> Result<NodeHandle> {
        if child.name() == self.name || child.embedded_graphs().contains(&self.name) {
            return Err(RegflowError::RecursiveEmbedding {
                parent: self.name.clone(),
                child: child.name().to_string(),
            });
        }

        let node = SubgraphOperation::node(name, Arc::new(child.clone()));
        let handle = self.add_node(node)?;
        self.embedded.insert(child.name().to_string());
        self.embedded.extend(child.embedded_graphs().iter().cloned());
        Ok(handle)
    }

    /// Record a conditional-topology decision
    pub fn record_branch(&mut self, record: BranchRecord) {
        log::debug!(
            "Graph '{}': branch group '{}' took {:?}",
            self.name,
            record.group,
            record.taken
        );
        self.branches.push(record);
    }

    /// Finish assembly
    ///
    /// Fails if a required output is unconnected or the graph has a cycle.
    pub fn build(mut self) -> Result<Graph> {
        let output_idx = self.index[OUTPUT_NODE];
        let mut outputs = Vec::new();
        for port in &self.nodes[output_idx].inputs {
            let source = self
                .edges
                .iter()
                .find(|e| e.target.node == OUTPUT_NODE && e.target.port == port.name)
                .map(|e| e.source.clone());

            let state = match source {
                Some(source) => OutputState::Bound(source),
                None if port.required => {
                    return Err(RegflowError::UnconnectedOutput {
                        graph: self.name.clone(),
                        output: port.name.clone(),
                    });
                }
                None => OutputState::NotTaken,
            };
            outputs.push(GraphOutput {
                port: port.clone(),
                state,
            });
        }

        // The output node goes last so it never jumps ahead of unrelated work
        let output_node = self.nodes.remove(output_idx);
        self.nodes.push(output_node);
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        topological_order(&self.name, &self.nodes, &self.index, &self.edges)?;

        log::debug!(
            "Built graph '{}' with {} nodes and {} edges",
            self.name,
            self.nodes.len(),
            self.edges.len()
        );

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            index: self.index,
            edges: self.edges,
            outputs,
            branches: self.branches,
            embedded: self.embedded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::BranchKind;

    fn passthrough(name: &str) -> Node {
        Node::identity(name, &[("x", ArtifactKind::Any)])
    }

    #[test]
    fn test_duplicate_name() {
        let mut builder = GraphBuilder::new("wf");
        builder.add_node(passthrough("a")).unwrap();
        let err = builder.add_node(passthrough("a")).unwrap_err();
        assert!(matches!(err, RegflowError::DuplicateName { node, .. } if node == "a"));
    }

    #[test]
    fn test_unknown_port() {
        let mut builder = GraphBuilder::new("wf");
        let a = builder.add_node(passthrough("a")).unwrap();
        let b = builder.add_node(passthrough("b")).unwrap();

        let err = builder.connect(a.output("nope"), b.input("x")).unwrap_err();
        assert!(matches!(
            err,
            RegflowError::UnknownPort { direction: PortDirection::Output, .. }
        ));

        let err = builder
            .connect(a.output("x"), PortRef::new("ghost", "x"))
            .unwrap_err();
        assert!(matches!(err, RegflowError::UnknownNode { .. }));
    }

    #[test]
    fn test_input_port_accepts_one_connection() {
        let mut builder = GraphBuilder::new("wf");
        let a = builder.add_node(passthrough("a")).unwrap();
        let b = builder.add_node(passthrough("b")).unwrap();
        let c = builder.add_node(passthrough("c")).unwrap();

        builder.connect(a.output("x"), c.input("x")).unwrap();
        let err = builder.connect(b.output("x"), c.input("x")).unwrap_err();
        assert!(matches!(err, RegflowError::PortArity { node, .. } if node == "c"));

        // fan-out is fine
        builder.connect(a.output("x"), b.input("x")).unwrap();
    }

    #[test]
    fn test_static_value_counts_as_connection() {
        let mut builder = GraphBuilder::new("wf");
        let a = builder.add_node(passthrough("a")).unwrap();
        let b = builder
            .add_node(passthrough("b").with_static("x", Artifact::flag(true)))
            .unwrap();

        let err = builder.connect(a.output("x"), b.input("x")).unwrap_err();
        assert!(matches!(err, RegflowError::PortArity { .. }));
        let err = builder.set_static(b.input("x"), Artifact::flag(false)).unwrap_err();
        assert!(matches!(err, RegflowError::PortArity { .. }));
    }

    #[test]
    fn test_unconnected_required_output() {
        let mut builder = GraphBuilder::new("wf");
        builder.declare_output("t1w_preproc", ArtifactKind::Volume);
        let err = builder.build().unwrap_err();
        assert!(matches!(
            err,
            RegflowError::UnconnectedOutput { output, .. } if output == "t1w_preproc"
        ));
    }

    #[test]
    fn test_optional_output_not_taken() {
        let mut builder = GraphBuilder::new("wf");
        builder.declare_optional_output("t2w_mask", ArtifactKind::LabelMap);
        let graph = builder.build().unwrap();
        assert_eq!(graph.output_state("t2w_mask"), Some(&OutputState::NotTaken));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut builder = GraphBuilder::new("wf");
        let a = builder.add_node(passthrough("a")).unwrap();
        let b = builder.add_node(passthrough("b")).unwrap();
        builder.connect(a.output("x"), b.input("x")).unwrap();
        builder.connect(b.output("x"), a.input("x")).unwrap();

        let err = builder.build().unwrap_err();
        match err {
            RegflowError::CyclicGraph { nodes, .. } => {
                assert_eq!(nodes, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("expected CyclicGraph, got {other:?}"),
        }
    }

    #[test]
    fn test_embed_subgraph_exposes_ports() {
        let mut child = GraphBuilder::new("midthickness_wf");
        let white = child.input("white", ArtifactKind::Surface);
        let out = child.declare_output("midthickness", ArtifactKind::Surface);
        child.connect(white, out).unwrap();
        let child = child.build().unwrap();

        let mut parent = GraphBuilder::new("surface_recon_wf");
        let mid = parent.embed_subgraph("midthickness", &child).unwrap();
        let node = parent.node(mid.name()).unwrap();
        assert!(node.find_input("white").is_some());
        assert!(node.find_output("midthickness").is_some());
        assert!(node.operation.is_composite());

        let parent = parent.build().unwrap();
        assert!(parent.embedded_graphs().contains("midthickness_wf"));
    }

    #[test]
    fn test_recursive_embedding_is_keyed_on_graph_name() {
        // An independently built graph that shares the parent's name is rejected
        let child = GraphBuilder::new("outer").build().unwrap();
        let mut parent = GraphBuilder::new("outer");
        let err = parent.embed_subgraph("self", &child).unwrap_err();
        assert!(matches!(err, RegflowError::RecursiveEmbedding { .. }));

        // transitive: inner embeds something named like the parent
        let mut middle = GraphBuilder::new("middle");
        middle.embed_subgraph("leaf", &GraphBuilder::new("top").build().unwrap()).unwrap();
        let middle = middle.build().unwrap();
        let mut top = GraphBuilder::new("top");
        assert!(top.embed_subgraph("middle", &middle).is_err());

        // Differently named graphs embed freely, the same one more than once
        let leaf = GraphBuilder::new("leaf_wf").build().unwrap();
        let mut twice = GraphBuilder::new("outer");
        twice.embed_subgraph("lh", &leaf).unwrap();
        twice.embed_subgraph("rh", &leaf).unwrap();
        assert_eq!(twice.build().unwrap().embedded_graphs().len(), 1);
    }

    #[test]
    fn test_record_branch() {
        let mut builder = GraphBuilder::new("wf");
        builder.record_branch(BranchRecord {
            group: "mask".to_string(),
            kind: BranchKind::Exclusive,
            taken: vec!["probmap".to_string()],
            skipped: vec!["t1w_mask".to_string(), "precomputed".to_string()],
        });
        let graph = builder.build().unwrap();
        assert_eq!(graph.branch_selection("mask"), Some("probmap"));
    }
}
