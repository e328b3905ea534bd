//! Regflow Engine - conditional processing graphs for registration pipelines
//!
//! This crate assembles data-dependent processing graphs and runs them on a
//! single host under a memory/thread budget. It supports:
//!
//! - Single-pass graph assembly with structural checks before anything runs
//! - Exclusive, additive and count-driven (replicated) conditional topology
//! - Transform chains with index-aligned invert flags and multi-hop
//!   composition through an intermediate space
//! - Graphs embedded as black-box nodes of other graphs
//! - Budget-aware parallel scheduling with failure isolation
//!
//! # Architecture
//!
//! - `GraphBuilder`: assembles nodes and edges into an immutable `Graph`
//! - `Operation`: the opaque unit of work behind each node
//! - `OperationRegistry`: kind string -> descriptor + operation
//! - `Scheduler`: runs a `Graph`, reporting per-node state in a `RunReport`
//! - `EventSink`: execution event streaming
//!
//! # Example
//!
//! ```ignore
//! use regflow_engine::{GraphBuilder, Scheduler, SchedulerConfig};
//!
//! let graph = build_coregistration(&flags, &config, &registry)?;
//! let report = Scheduler::new(SchedulerConfig::from_env())
//!     .run(&graph, inputs)
//!     .await?;
//! let outputs = report.into_outputs()?;
//! ```

pub mod budget;
pub mod builder;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod events;
pub mod graph;
pub mod node;
pub mod registry;
pub mod scheduler;
pub mod subgraph;
pub mod topology;
pub mod transform;
pub mod types;
pub mod validation;

// Re-export key types
pub use budget::{BudgetLease, ResourceBudget};
pub use builder::GraphBuilder;
pub use config::SchedulerConfig;
pub use descriptor::{DescribeOperation, OperationDescriptor, OperationFn};
pub use error::{OperationError, PortDirection, RegflowError, Result};
pub use events::{EventSink, LogEventSink, NullEventSink, RunEvent, VecEventSink};
pub use graph::{
    BranchKind, BranchRecord, Edge, Graph, GraphOutput, GraphSummary, OutputState, INPUT_NODE,
    OUTPUT_NODE,
};
pub use node::{
    require, FnOperation, Identity, Merge, Node, NodeHandle, Operation, OperationContext,
    OperationResult,
};
pub use registry::OperationRegistry;
pub use scheduler::{GraphOutputs, NodeState, OutputValue, RunReport, Scheduler};
pub use subgraph::SubgraphOperation;
pub use topology::{
    gather, replicate, AdditiveBranches, Branch, ExclusiveBranches, ParallelLists, Row, Selected,
};
pub use transform::{
    DescribeChain, MultiHopOutputs, MultiHopRequest, Transform, TransformChain, TransformComposer,
};
pub use types::{
    Artifact, ArtifactKind, ArtifactMap, NodeId, PortId, PortRef, PortSpec, ResourceHint, Selector,
    Source,
};
pub use validation::{validate_graph, ValidationError};

// Re-exported so operation crates can submit descriptors without a direct dependency
pub use inventory;
