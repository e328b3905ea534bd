//! Operation registry for kind-based node construction
//!
//! Pipelines never construct operations directly; they ask the registry for
//! a node of a given kind. Swapping the registry (e.g. for recording mocks in
//! tests) swaps every operation without touching the assembly code.
//!
//! # Usage
//!
//! ```ignore
//! use regflow_engine::OperationRegistry;
//!
//! let registry = OperationRegistry::with_builtins();
//! let node = registry.instantiate("map_mask", "apply-transforms")?;
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::descriptor::{OperationDescriptor, OperationFn};
use crate::error::{RegflowError, Result};
use crate::node::{FnOperation, Node, Operation, OperationContext, OperationResult};
use crate::types::ArtifactMap;

/// A registration entry combining metadata with an optional operation
#[derive(Clone)]
struct RegistryEntry {
    descriptor: OperationDescriptor,
    operation: Option<Arc<dyn Operation>>,
}

/// Registry of operation kinds with their descriptors and implementations
///
/// Registries can be composed by merging; later entries override earlier
/// ones sharing the same kind.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl OperationRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding every operation submitted via `inventory`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for entry in inventory::iter::<OperationFn> {
            registry.register((entry.descriptor)(), (entry.factory)());
        }
        log::debug!("Registered {} built-in operations", registry.entries.len());
        registry
    }

    /// Register an operation kind with its implementation
    pub fn register(&mut self, descriptor: OperationDescriptor, operation: Arc<dyn Operation>) {
        self.entries.insert(
            descriptor.kind.clone(),
            RegistryEntry {
                descriptor,
                operation: Some(operation),
            },
        );
    }

    /// Register an operation kind backed by a synchronous closure
    pub fn register_fn(
        &mut self,
        descriptor: OperationDescriptor,
        callback: impl Fn(&OperationContext, ArtifactMap) -> OperationResult
            + Send
            + Sync
            + 'static,
    ) {
        let operation = Arc::new(FnOperation::new(descriptor.kind.clone(), callback));
        self.register(descriptor, operation);
    }

    /// Register metadata only (listing, validation)
    pub fn register_descriptor(&mut self, descriptor: OperationDescriptor) {
        self.entries.insert(
            descriptor.kind.clone(),
            RegistryEntry {
                descriptor,
                operation: None,
            },
        );
    }

    /// Replace the implementation of an already registered kind
    ///
    /// Keeps the descriptor (ports, resource hint) intact.
    pub fn replace_operation(&mut self, kind: &str, operation: Arc<dyn Operation>) -> Result<()> {
        let entry = self
            .entries
            .get_mut(kind)
            .ok_or_else(|| RegflowError::UnknownOperation(kind.to_string()))?;
        entry.operation = Some(operation);
        Ok(())
    }

    /// Get the descriptor for a kind
    pub fn descriptor(&self, kind: &str) -> Option<&OperationDescriptor> {
        self.entries.get(kind).map(|e| &e.descriptor)
    }

    /// Get all registered descriptors, ordered by kind
    pub fn descriptors(&self) -> Vec<&OperationDescriptor> {
        self.entries.values().map(|e| &e.descriptor).collect()
    }

    /// Get the implementation for a kind
    pub fn operation(&self, kind: &str) -> Option<Arc<dyn Operation>> {
        self.entries.get(kind).and_then(|e| e.operation.clone())
    }

    /// Check if a kind is registered
    pub fn has_kind(&self, kind: &str) -> bool {
        self.entries.contains_key(kind)
    }

    /// List all registered kinds, ordered
    pub fn kinds(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Merge another registry into this one
    pub fn merge(&mut self, other: OperationRegistry) {
        self.entries.extend(other.entries);
    }

    /// Build a node of the given kind
    ///
    /// Ports and default resource hint come from the descriptor.
    pub fn instantiate(&self, name: impl Into<String>, kind: &str) -> Result<Node> {
        let entry = self
            .entries
            .get(kind)
            .ok_or_else(|| RegflowError::UnknownOperation(kind.to_string()))?;
        let operation = entry
            .operation
            .clone()
            .ok_or_else(|| RegflowError::UnknownOperation(kind.to_string()))?;

        let mut node = Node::new(name, operation);
        node.inputs = entry.descriptor.inputs.clone();
        node.outputs = entry.descriptor.outputs.clone();
        node.resources = entry.descriptor.default_resources;
        Ok(node)
    }
}
