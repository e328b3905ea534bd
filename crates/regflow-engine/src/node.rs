//! Nodes and the operation capability they invoke
//!
//! A `Node` declares its ports, an optional resource hint and an opaque
//! `Operation`. The scheduler only ever calls `Operation::execute`; it never
//! looks at what the operation does.

use std::sync::Arc;

use async_trait::async_trait;

use crate::budget::ResourceBudget;
use crate::config::SchedulerConfig;
use crate::error::OperationError;
use crate::events::EventSink;
use crate::types::{Artifact, ArtifactKind, ArtifactMap, NodeId, PortRef, PortSpec, ResourceHint};

/// Result type for operations
pub type OperationResult = std::result::Result<ArtifactMap, OperationError>;

/// The unit of external work behind a node
///
/// Implementations receive the resolved input artifacts keyed by input-port
/// name and return the produced artifacts keyed by output-port name.
#[async_trait]
pub trait Operation: Send + Sync {
    /// Short identifier of the operation kind (e.g. "apply-transforms")
    fn kind(&self) -> &str;

    /// Execute the operation
    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult;

    /// Whether this operation runs its own nodes against the shared budget
    ///
    /// Composite operations (embedded graphs) take no lease themselves so
    /// their inner nodes can be admitted.
    fn is_composite(&self) -> bool {
        false
    }
}

/// Everything an operation may need besides its inputs
#[derive(Clone)]
pub struct OperationContext {
    pub(crate) node_id: NodeId,
    pub(crate) execution_id: String,
    pub(crate) params: serde_json::Value,
    pub(crate) budget: Arc<ResourceBudget>,
    pub(crate) config: SchedulerConfig,
    pub(crate) event_sink: Arc<dyn EventSink>,
}

impl OperationContext {
    /// Create a context outside of a scheduler run (tests, direct calls)
    pub fn detached(node_id: impl Into<String>, params: serde_json::Value) -> Self {
        let config = SchedulerConfig::default();
        Self {
            node_id: node_id.into(),
            execution_id: "detached".to_string(),
            params,
            budget: Arc::new(ResourceBudget::new(&config)),
            config,
            event_sink: Arc::new(crate::events::NullEventSink),
        }
    }

    /// Name of the node being executed
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// ID of the scheduler run
    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    /// Static parameters fixed at assembly time
    pub fn params(&self) -> &serde_json::Value {
        &self.params
    }

    /// Look up a single static parameter
    pub fn param(&self, key: &str) -> Option<&serde_json::Value> {
        self.params.get(key)
    }

    /// The shared resource budget of this run
    pub fn budget(&self) -> &Arc<ResourceBudget> {
        &self.budget
    }

    /// Scheduler configuration of this run
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Event sink of this run
    pub fn event_sink(&self) -> &Arc<dyn EventSink> {
        &self.event_sink
    }
}

/// Fetch a required input, failing with `MissingInput`
pub fn require<'a>(inputs: &'a ArtifactMap, port: &str) -> Result<&'a Artifact, OperationError> {
    inputs
        .get(port)
        .ok_or_else(|| OperationError::MissingInput(port.to_string()))
}

/// A unit of work in a graph
#[derive(Clone)]
pub struct Node {
    /// Unique name within the graph
    pub name: NodeId,
    /// Declared input ports, in order
    pub inputs: Vec<PortSpec>,
    /// Declared output ports, in order
    pub outputs: Vec<PortSpec>,
    /// Resource hint; `None` means light-weight and unconstrained
    pub resources: Option<ResourceHint>,
    /// Static parameters handed to the operation
    pub params: serde_json::Value,
    /// Input values fixed at assembly time
    pub static_inputs: ArtifactMap,
    /// The operation to invoke
    pub operation: Arc<dyn Operation>,
}

impl Node {
    /// Create a node with no ports
    pub fn new(name: impl Into<String>, operation: Arc<dyn Operation>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: None,
            params: serde_json::Value::Null,
            static_inputs: ArtifactMap::new(),
            operation,
        }
    }

    /// Create an identity node passing every input through to the output of the same name
    pub fn identity(name: impl Into<String>, ports: &[(&str, ArtifactKind)]) -> Self {
        let mut node = Self::new(name, Arc::new(Identity));
        for (port, kind) in ports {
            node.inputs.push(PortSpec::optional(*port, *kind));
            node.outputs.push(PortSpec::optional(*port, *kind));
        }
        node
    }

    /// Declare an optional input port
    pub fn input(mut self, name: impl Into<String>, kind: ArtifactKind) -> Self {
        self.inputs.push(PortSpec::optional(name, kind));
        self
    }

    /// Declare a required input port
    pub fn required_input(mut self, name: impl Into<String>, kind: ArtifactKind) -> Self {
        self.inputs.push(PortSpec::required(name, kind));
        self
    }

    /// Declare an output port
    pub fn output(mut self, name: impl Into<String>, kind: ArtifactKind) -> Self {
        self.outputs.push(PortSpec::optional(name, kind));
        self
    }

    /// Attach a resource hint
    pub fn with_resources(mut self, hint: ResourceHint) -> Self {
        self.resources = Some(hint);
        self
    }

    /// Set static parameters
    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Fix an input port to a value at assembly time
    pub fn with_static(mut self, port: impl Into<String>, value: Artifact) -> Self {
        self.static_inputs.insert(port.into(), value);
        self
    }

    /// The operation kind
    pub fn kind(&self) -> &str {
        self.operation.kind()
    }

    /// Find an input port by name
    pub fn find_input(&self, port: &str) -> Option<&PortSpec> {
        self.inputs.iter().find(|p| p.name == port)
    }

    /// Find an output port by name
    pub fn find_output(&self, port: &str) -> Option<&PortSpec> {
        self.outputs.iter().find(|p| p.name == port)
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("resources", &self.resources)
            .finish()
    }
}

/// Handle to a node added to a builder
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    name: NodeId,
}

impl NodeHandle {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reference one of the node's output ports
    pub fn output(&self, port: &str) -> PortRef {
        PortRef::new(&self.name, port)
    }

    /// Reference one of the node's input ports
    pub fn input(&self, port: &str) -> PortRef {
        PortRef::new(&self.name, port)
    }
}

/// Passes every input through unchanged
///
/// Backs the virtual `inputnode` / `outputnode` of every graph.
pub struct Identity;

#[async_trait]
impl Operation for Identity {
    fn kind(&self) -> &str {
        "identity"
    }

    async fn execute(&self, _ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        Ok(inputs)
    }
}

/// Collects `in1..inN` into a single list on `out`
///
/// List inputs are spliced in place, so merging a transform with a list of
/// transforms yields one flat chain.
pub struct Merge {
    count: usize,
}

impl Merge {
    /// Output port name
    pub const PORT_OUT: &'static str = "out";

    /// Create a merge of `count` inputs
    pub fn new(count: usize) -> Self {
        Self { count }
    }

    /// Build a merge node with ports `in1..inN` and `out`
    pub fn node(name: impl Into<String>, count: usize) -> Node {
        let mut node = Node::new(name, Arc::new(Self::new(count)));
        for i in 1..=count {
            node.inputs.push(PortSpec::optional(format!("in{i}"), ArtifactKind::Any));
        }
        node.output(Self::PORT_OUT, ArtifactKind::Any)
    }
}

#[async_trait]
impl Operation for Merge {
    fn kind(&self) -> &str {
        "merge"
    }

    async fn execute(&self, _ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let mut merged = Vec::new();
        for i in 1..=self.count {
            match inputs.get(&format!("in{i}")) {
                Some(Artifact::List(items)) => merged.extend(items.iter().cloned()),
                Some(other) => merged.push(other.clone()),
                None => {}
            }
        }

        let mut outputs = ArtifactMap::new();
        outputs.insert(Self::PORT_OUT.to_string(), Artifact::List(merged));
        Ok(outputs)
    }
}

/// Synchronous closure-backed operation
///
/// Handy for small pure helpers (string munging, lookups) and for tests.
pub struct FnOperation {
    kind: String,
    callback: Box<
        dyn Fn(&OperationContext, ArtifactMap) -> OperationResult + Send + Sync,
    >,
}

impl FnOperation {
    pub fn new(
        kind: impl Into<String>,
        callback: impl Fn(&OperationContext, ArtifactMap) -> OperationResult
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            kind: kind.into(),
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl Operation for FnOperation {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        (self.callback)(ctx, inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_passes_through() {
        let ctx = OperationContext::detached("inputnode", serde_json::Value::Null);
        let mut inputs = ArtifactMap::new();
        inputs.insert("in_t1w".to_string(), Artifact::path("/data/t1w.nii.gz"));

        let outputs = Identity.execute(&ctx, inputs.clone()).await.unwrap();
        assert_eq!(outputs, inputs);
    }

    #[tokio::test]
    async fn test_merge_splices_lists() {
        let ctx = OperationContext::detached("merge", serde_json::Value::Null);
        let mut inputs = ArtifactMap::new();
        inputs.insert("in1".to_string(), Artifact::path("/x/int2std.h5"));
        inputs.insert(
            "in2".to_string(),
            Artifact::list([Artifact::path("/x/warp.h5"), Artifact::path("/x/affine.mat")]),
        );

        let outputs = Merge::new(2).execute(&ctx, inputs).await.unwrap();
        assert_eq!(
            outputs["out"],
            Artifact::list([
                Artifact::path("/x/int2std.h5"),
                Artifact::path("/x/warp.h5"),
                Artifact::path("/x/affine.mat"),
            ])
        );
    }

    #[test]
    fn test_merge_node_ports() {
        let node = Merge::node("fixed_masks_arg", 3);
        assert_eq!(node.inputs.len(), 3);
        assert!(node.find_input("in3").is_some());
        assert!(node.find_output("out").is_some());
        assert_eq!(node.kind(), "merge");
    }

    #[test]
    fn test_node_handle_ports() {
        let handle = NodeHandle::new("coreg");
        assert_eq!(
            handle.output("reverse_transforms"),
            PortRef::new("coreg", "reverse_transforms")
        );
        assert_eq!(handle.name(), "coreg");
    }
}
