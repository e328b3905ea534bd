//! Lint pass over built graphs
//!
//! `GraphBuilder::build` already rejects structurally broken graphs. This
//! pass looks for things that are legal but suspicious: edges between
//! incompatible artifact kinds, required inputs left unconnected, nodes whose
//! kind the registry does not know, and nodes with no connections at all.

use std::collections::HashSet;

use crate::graph::{Graph, INPUT_NODE, OUTPUT_NODE};
use crate::registry::OperationRegistry;
use crate::types::{ArtifactKind, PortRef};

/// Kinds the engine provides itself, never listed in a registry
const ENGINE_KINDS: &[&str] = &["identity", "merge", "subgraph", "describe-chain"];

/// Validation finding with location context
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    /// A node's kind is not in the registry
    UnknownNodeKind { node_id: String, kind: String },
    /// A required input port has neither an edge nor a static value
    UnconnectedRequiredInput { node_id: String, port_id: String },
    /// An edge connects incompatible artifact kinds
    IncompatiblePortKinds {
        source: PortRef,
        target: PortRef,
        source_kind: ArtifactKind,
        target_kind: ArtifactKind,
    },
    /// A node has no connections (orphaned)
    OrphanedNode { node_id: String },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownNodeKind { node_id, kind } => {
                write!(f, "Unknown kind '{}' for node '{}'", kind, node_id)
            }
            Self::UnconnectedRequiredInput { node_id, port_id } => {
                write!(
                    f,
                    "Required input '{}' on node '{}' is not connected",
                    port_id, node_id
                )
            }
            Self::IncompatiblePortKinds {
                source,
                target,
                source_kind,
                target_kind,
            } => {
                write!(
                    f,
                    "Edge {} -> {} connects incompatible kinds: {:?} -> {:?}",
                    source, target, source_kind, target_kind
                )
            }
            Self::OrphanedNode { node_id } => {
                write!(f, "Node '{}' has no connections", node_id)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Lint a built graph
///
/// Returns all findings (not just the first). Pass a registry to also check
/// that every node kind is registered.
pub fn validate_graph(graph: &Graph, registry: Option<&OperationRegistry>) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    validate_port_kinds(graph, &mut errors);
    validate_required_inputs(graph, &mut errors);
    detect_orphans(graph, &mut errors);

    if let Some(reg) = registry {
        validate_node_kinds(graph, reg, &mut errors);
    }

    if !errors.is_empty() {
        log::warn!("Graph '{}': {} validation findings", graph.name(), errors.len());
    }
    errors
}

fn is_virtual(name: &str) -> bool {
    name == INPUT_NODE || name == OUTPUT_NODE
}

/// Check that every edge joins compatible kinds
fn validate_port_kinds(graph: &Graph, errors: &mut Vec<ValidationError>) {
    for edge in graph.edges() {
        let source_kind = graph
            .node(&edge.source.node)
            .and_then(|n| n.find_output(&edge.source.port))
            .map(|p| p.kind);
        let target_kind = graph
            .node(&edge.target.node)
            .and_then(|n| n.find_input(&edge.target.port))
            .map(|p| p.kind);

        // Selectors take a part of a composite, so the whole's kind says little
        if edge.selector.is_some() {
            continue;
        }

        if let (Some(source_kind), Some(target_kind)) = (source_kind, target_kind) {
            if !source_kind.is_compatible_with(&target_kind) {
                errors.push(ValidationError::IncompatiblePortKinds {
                    source: edge.source.clone(),
                    target: edge.target.clone(),
                    source_kind,
                    target_kind,
                });
            }
        }
    }
}

/// Check that required inputs are connected or fixed
fn validate_required_inputs(graph: &Graph, errors: &mut Vec<ValidationError>) {
    let connected: HashSet<(&str, &str)> = graph
        .edges()
        .iter()
        .map(|e| (e.target.node.as_str(), e.target.port.as_str()))
        .collect();

    for node in graph.nodes().iter().filter(|n| !is_virtual(&n.name)) {
        for port in node.inputs.iter().filter(|p| p.required) {
            if !connected.contains(&(node.name.as_str(), port.name.as_str()))
                && !node.static_inputs.contains_key(&port.name)
            {
                errors.push(ValidationError::UnconnectedRequiredInput {
                    node_id: node.name.clone(),
                    port_id: port.name.clone(),
                });
            }
        }
    }
}

/// Report nodes that neither consume nor produce anything in the graph
fn detect_orphans(graph: &Graph, errors: &mut Vec<ValidationError>) {
    for node in graph.nodes().iter().filter(|n| !is_virtual(&n.name)) {
        let touched = graph
            .edges()
            .iter()
            .any(|e| e.source.node == node.name || e.target.node == node.name);
        if !touched && node.static_inputs.is_empty() {
            errors.push(ValidationError::OrphanedNode {
                node_id: node.name.clone(),
            });
        }
    }
}

/// Check that all nodes have known kinds in the registry
fn validate_node_kinds(
    graph: &Graph,
    registry: &OperationRegistry,
    errors: &mut Vec<ValidationError>,
) {
    for node in graph.nodes() {
        let kind = node.kind();
        if !ENGINE_KINDS.contains(&kind) && !registry.has_kind(kind) {
            errors.push(ValidationError::UnknownNodeKind {
                node_id: node.name.clone(),
                kind: kind.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::builder::GraphBuilder;
    use crate::node::{Identity, Node};

    fn volume_node(name: &str) -> Node {
        Node::new(name, Arc::new(Identity))
            .required_input("in_file", ArtifactKind::Volume)
            .output("out_file", ArtifactKind::Volume)
    }

    #[test]
    fn test_incompatible_kinds() {
        let mut builder = GraphBuilder::new("wf");
        let xfm = builder.input("xfm", ArtifactKind::Transform);
        let node = builder.add_node(volume_node("clip")).unwrap();
        builder.connect(xfm, node.input("in_file")).unwrap();
        let graph = builder.build().unwrap();

        let errors = validate_graph(&graph, None);
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ValidationError::IncompatiblePortKinds {
                source_kind: ArtifactKind::Transform,
                target_kind: ArtifactKind::Volume,
                ..
            }
        ));
    }

    #[test]
    fn test_unconnected_required_and_orphan() {
        let mut builder = GraphBuilder::new("wf");
        builder.add_node(volume_node("denoise")).unwrap();
        let graph = builder.build().unwrap();

        let errors = validate_graph(&graph, None);
        assert!(errors.contains(&ValidationError::UnconnectedRequiredInput {
            node_id: "denoise".to_string(),
            port_id: "in_file".to_string(),
        }));
        assert!(errors.contains(&ValidationError::OrphanedNode {
            node_id: "denoise".to_string(),
        }));
    }

    #[test]
    fn test_unknown_kind_with_registry() {
        let mut builder = GraphBuilder::new("wf");
        let t1w = builder.input("in_t1w", ArtifactKind::Volume);
        let custom = crate::node::FnOperation::new("custom-op", |_, i| Ok(i));
        let node = builder
            .add_node(Node::new("custom", Arc::new(custom)).input("in", ArtifactKind::Any))
            .unwrap();
        builder.connect(t1w, node.input("in")).unwrap();
        let graph = builder.build().unwrap();

        let errors = validate_graph(&graph, Some(&OperationRegistry::new()));
        assert_eq!(
            errors,
            vec![ValidationError::UnknownNodeKind {
                node_id: "custom".to_string(),
                kind: "custom-op".to_string(),
            }]
        );
        assert!(errors[0].to_string().contains("custom-op"));
    }
}
