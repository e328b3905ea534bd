//! Operation descriptors and link-time registration
//!
//! An operation crate describes each of its operations once: the kind
//! string, the ports it exposes and a default resource hint. The registry
//! turns a descriptor into a ready-to-wire `Node`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::node::Operation;
use crate::types::{PortSpec, ResourceHint};

/// Trait for operations that can describe their metadata
pub trait DescribeOperation {
    /// Get the static metadata for this operation kind
    fn descriptor() -> OperationDescriptor
    where
        Self: Sized;
}

/// Complete metadata for an operation kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescriptor {
    /// Unique kind identifier (e.g., "apply-transforms")
    pub kind: String,
    /// Human-readable label
    pub label: String,
    /// Description of what the operation does
    pub description: String,
    /// Input port definitions
    pub inputs: Vec<PortSpec>,
    /// Output port definitions
    pub outputs: Vec<PortSpec>,
    /// Resource hint applied to nodes built from this descriptor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_resources: Option<ResourceHint>,
}

impl OperationDescriptor {
    /// Create a descriptor with no ports
    pub fn new(
        kind: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            label: label.into(),
            description: description.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            default_resources: None,
        }
    }

    /// Add an input port
    pub fn with_input(mut self, port: PortSpec) -> Self {
        self.inputs.push(port);
        self
    }

    /// Add an output port
    pub fn with_output(mut self, port: PortSpec) -> Self {
        self.outputs.push(port);
        self
    }

    /// Set the default resource hint
    pub fn with_resources(mut self, hint: ResourceHint) -> Self {
        self.default_resources = Some(hint);
        self
    }
}

/// Link-time registration of an operation kind.
///
/// Both fields are plain function pointers so the entry can live in a
/// `static` collected by `inventory`.
///
/// # Example
///
/// ```ignore
/// inventory::submit!(regflow_engine::OperationFn {
///     descriptor: ConcatTransforms::descriptor,
///     factory: || std::sync::Arc::new(ConcatTransforms),
/// });
/// ```
pub struct OperationFn {
    /// Returns the operation's metadata
    pub descriptor: fn() -> OperationDescriptor,
    /// Creates the operation instance
    pub factory: fn() -> Arc<dyn Operation>,
}

inventory::collect!(OperationFn);
