//! Core types for processing graphs
//!
//! These types describe what flows along edges (artifacts), how ports are
//! declared and addressed, and the resource hints attached to nodes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Unique identifier for a node within its graph
pub type NodeId = String;

/// Identifier for a port on a node
pub type PortId = String;

/// Resolved values keyed by port name
pub type ArtifactMap = BTreeMap<PortId, Artifact>;

/// Informal kind of the artifact a port carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Accepts any kind
    Any,
    /// 3-D (or 4-D) image volume
    Volume,
    /// Spatial transform file
    Transform,
    /// Surface mesh
    Surface,
    /// Discrete label map (segmentation, binary mask)
    LabelMap,
    /// Small in-memory value (names, flags, numbers)
    Value,
}

impl ArtifactKind {
    /// Check if this kind can connect to another kind
    pub fn is_compatible_with(&self, other: &ArtifactKind) -> bool {
        if matches!(self, ArtifactKind::Any) || matches!(other, ArtifactKind::Any) {
            return true;
        }

        // Label maps are volumes with discrete values
        if matches!(
            (self, other),
            (ArtifactKind::LabelMap, ArtifactKind::Volume)
                | (ArtifactKind::Volume, ArtifactKind::LabelMap)
        ) {
            return true;
        }

        self == other
    }
}

/// A resolved value produced by an output port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    /// A file on disk
    Path(PathBuf),
    /// A small in-memory value
    Value(serde_json::Value),
    /// A list of artifacts (multi-transform outputs, merged inputs, ...)
    List(Vec<Artifact>),
}

impl Artifact {
    /// Create a path artifact
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Create a string value artifact
    pub fn text(value: impl Into<String>) -> Self {
        Self::Value(serde_json::Value::String(value.into()))
    }

    /// Create a boolean value artifact
    pub fn flag(value: bool) -> Self {
        Self::Value(serde_json::Value::Bool(value))
    }

    /// Create a list artifact
    pub fn list(items: impl IntoIterator<Item = Artifact>) -> Self {
        Self::List(items.into_iter().collect())
    }

    /// Get the path, if this is a path artifact
    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::Path(p) => Some(p.as_path()),
            _ => None,
        }
    }

    /// Get the string value, if this is a string value artifact
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Value(v) => v.as_str(),
            _ => None,
        }
    }

    /// Get the JSON value, if this is a value artifact
    pub fn as_value(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Get the items, if this is a list artifact
    pub fn as_list(&self) -> Option<&[Artifact]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// View this artifact as a list
    ///
    /// A non-list artifact is treated as a one-element list.
    pub fn to_list(&self) -> Vec<Artifact> {
        match self {
            Self::List(items) => items.clone(),
            other => vec![other.clone()],
        }
    }

    /// Render a path or string artifact as a command-line argument
    pub fn to_arg(&self) -> Option<String> {
        match self {
            Self::Path(p) => Some(p.display().to_string()),
            Self::Value(serde_json::Value::String(s)) => Some(s.clone()),
            Self::Value(serde_json::Value::Number(n)) => Some(n.to_string()),
            Self::Value(serde_json::Value::Bool(b)) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Apply an edge selector to this artifact
    pub fn select(&self, selector: &Selector) -> Option<Artifact> {
        match selector {
            Selector::Index(i) => self.as_list().and_then(|items| items.get(*i)).cloned(),
            Selector::Field(field) => self
                .as_value()
                .and_then(|v| v.get(field))
                .cloned()
                .map(Artifact::Value),
        }
    }
}

impl From<PathBuf> for Artifact {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for Artifact {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<serde_json::Value> for Artifact {
    fn from(value: serde_json::Value) -> Self {
        Self::Value(value)
    }
}

/// Picks part of a composite artifact when crossing an edge
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    /// Select an element of a list artifact
    Index(usize),
    /// Select a field of a JSON object value
    Field(String),
}

/// Approximate resources a node needs while it runs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceHint {
    /// Approximate peak memory in gigabytes
    pub approx_memory_gb: f64,
    /// Approximate number of threads
    pub approx_threads: usize,
}

impl ResourceHint {
    /// Create a resource hint
    pub fn new(approx_memory_gb: f64, approx_threads: usize) -> Self {
        Self {
            approx_memory_gb,
            approx_threads,
        }
    }

    /// A memory-only hint using a single thread
    pub fn memory(approx_memory_gb: f64) -> Self {
        Self::new(approx_memory_gb, 1)
    }

    /// Clamp this hint to the given ceilings
    pub fn clamped(&self, max_memory_gb: f64, max_threads: usize) -> Self {
        Self {
            approx_memory_gb: self.approx_memory_gb.min(max_memory_gb),
            approx_threads: self.approx_threads.min(max_threads),
        }
    }
}

/// Address of a port: (node, port)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node: NodeId,
    pub port: PortId,
}

impl PortRef {
    /// Create a port reference
    pub fn new(node: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            port: port.into(),
        }
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.node, self.port)
    }
}

/// Where an input port gets its value: another port, or a fixed artifact
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Port(PortRef),
    Value(Artifact),
}

impl From<PortRef> for Source {
    fn from(port: PortRef) -> Self {
        Self::Port(port)
    }
}

impl From<Artifact> for Source {
    fn from(value: Artifact) -> Self {
        Self::Value(value)
    }
}

/// Declaration of a port (input or output)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// Port name, unique per direction on a node
    pub name: PortId,
    /// Kind of artifact carried
    pub kind: ArtifactKind,
    /// Whether an input must be connected for the node to make sense
    pub required: bool,
}

impl PortSpec {
    /// Create a required port
    pub fn required(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    /// Create an optional port
    pub fn optional(name: impl Into<String>, kind: ArtifactKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}
