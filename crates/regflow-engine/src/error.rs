//! Error types for the regflow engine

use thiserror::Error;

/// Result type alias using RegflowError
pub type Result<T> = std::result::Result<T, RegflowError>;

/// Direction of a port, used in error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    Input,
    Output,
}

impl std::fmt::Display for PortDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
        }
    }
}

/// Errors raised while assembling or scheduling a graph
///
/// Everything except `NodeFailed` is a build-time error: the graph is
/// malformed and no node has executed.
#[derive(Debug, Clone, Error)]
pub enum RegflowError {
    /// A node name is already taken in the graph
    #[error("Duplicate node name '{node}' in graph '{graph}'")]
    DuplicateName { graph: String, node: String },

    /// An edge or output references a node that does not exist
    #[error("Unknown node '{node}' in graph '{graph}'")]
    UnknownNode { graph: String, node: String },

    /// An edge references a port the node does not declare
    #[error("Node '{node}' has no {direction} port '{port}'")]
    UnknownPort {
        node: String,
        port: String,
        direction: PortDirection,
    },

    /// An input port already has an inbound connection
    #[error("Input port '{node}.{port}' already has an inbound connection")]
    PortArity { node: String, port: String },

    /// Parallel lists disagree in length
    #[error("Length mismatch in {context}: expected {expected}, got {actual}")]
    ArityMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// A required graph output was never connected
    #[error("Output '{output}' of graph '{graph}' is not connected")]
    UnconnectedOutput { graph: String, output: String },

    /// A graph would embed itself, directly or transitively
    #[error("Graph '{child}' cannot be embedded in '{parent}': recursive embedding")]
    RecursiveEmbedding { parent: String, child: String },

    /// No operation registered under the requested kind
    #[error("No operation registered for kind '{0}'")]
    UnknownOperation(String),

    /// No topological order exists
    #[error("Cycle detected in graph '{graph}' involving: {}", nodes.join(", "))]
    CyclicGraph { graph: String, nodes: Vec<String> },

    /// Scheduler ceilings that can never admit a node
    #[error("Invalid scheduler configuration: {0}")]
    InvalidConfig(String),

    /// A node's operation failed at run time
    #[error("Node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },
}

impl RegflowError {
    /// Create an arity mismatch error
    pub fn arity(context: impl Into<String>, expected: usize, actual: usize) -> Self {
        Self::ArityMismatch {
            context: context.into(),
            expected,
            actual,
        }
    }

    /// Whether this error was raised before any node executed
    pub fn is_build_error(&self) -> bool {
        !matches!(self, Self::NodeFailed { .. })
    }
}

/// Opaque, node-scoped failure returned by an operation
///
/// The scheduler never inspects the cause; it only records it and marks the
/// node's dependents unreachable.
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    /// A connected input was not present when the node ran
    #[error("Missing input artifact: {0}")]
    MissingInput(String),

    /// An input artifact has the wrong shape for this operation
    #[error("Invalid input for '{port}': expected {expected}")]
    InvalidInput { port: String, expected: String },

    /// Lists passed to the operation disagree in length
    #[error("Length mismatch in {context}: expected {expected}, got {actual}")]
    ArityMismatch {
        context: String,
        expected: usize,
        actual: usize,
    },

    /// The resource budget cannot admit the node even when idle
    #[error("Not admitted by the resource budget: {0}")]
    Unadmitted(String),

    /// The external tool or computation failed
    #[error("Execution failed: {0}")]
    Failed(String),

    /// An embedded graph failed
    #[error(transparent)]
    Graph(#[from] RegflowError),
}

impl OperationError {
    /// Create an execution failed error with a message
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}
