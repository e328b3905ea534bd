//! Event types for streaming run progress
//!
//! Events are sent from the scheduler to any consumer (log shipper, progress
//! display, test recorder) to report node state changes.

use serde::{Deserialize, Serialize};

/// Trait for sending run events
///
/// This abstracts over the transport mechanism (mpsc, log, in-memory)
/// allowing the scheduler to be used in different contexts.
pub trait EventSink: Send + Sync {
    /// Send an event
    ///
    /// Returns an error if the event could not be sent (e.g., channel closed)
    fn send(&self, event: RunEvent) -> Result<(), EventError>;
}

/// Error when sending events fails
#[derive(Debug, Clone)]
pub struct EventError {
    pub message: String,
}

impl std::fmt::Display for EventError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Event error: {}", self.message)
    }
}

impl std::error::Error for EventError {}

impl EventError {
    pub fn channel_closed() -> Self {
        Self {
            message: "Channel closed".to_string(),
        }
    }
}

/// Events emitted during a scheduler run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunEvent {
    /// Graph execution started
    #[serde(rename_all = "camelCase")]
    GraphStarted {
        graph_id: String,
        execution_id: String,
        node_count: usize,
    },

    /// Every node reached a terminal state and none failed
    #[serde(rename_all = "camelCase")]
    GraphCompleted {
        graph_id: String,
        execution_id: String,
    },

    /// At least one node failed
    #[serde(rename_all = "camelCase")]
    GraphFailed {
        graph_id: String,
        execution_id: String,
        error: String,
    },

    /// A ready node is waiting for budget capacity
    #[serde(rename_all = "camelCase")]
    NodeDeferred {
        node_id: String,
        execution_id: String,
    },

    /// A node started executing
    #[serde(rename_all = "camelCase")]
    NodeStarted {
        node_id: String,
        execution_id: String,
    },

    /// A node completed successfully
    #[serde(rename_all = "camelCase")]
    NodeCompleted {
        node_id: String,
        execution_id: String,
    },

    /// A node failed
    #[serde(rename_all = "camelCase")]
    NodeFailed {
        node_id: String,
        execution_id: String,
        error: String,
    },

    /// A node will never run because an upstream node failed
    #[serde(rename_all = "camelCase")]
    NodeUnreachable {
        node_id: String,
        execution_id: String,
        failed_upstream: String,
    },
}

impl RunEvent {
    /// Node the event refers to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeDeferred { node_id, .. }
            | Self::NodeStarted { node_id, .. }
            | Self::NodeCompleted { node_id, .. }
            | Self::NodeFailed { node_id, .. }
            | Self::NodeUnreachable { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// A no-op event sink that discards all events
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn send(&self, _event: RunEvent) -> Result<(), EventError> {
        Ok(())
    }
}

/// A vector-based event sink that collects events
///
/// Useful for testing to verify events were emitted correctly.
pub struct VecEventSink {
    events: parking_lot::Mutex<Vec<RunEvent>>,
}

impl VecEventSink {
    pub fn new() -> Self {
        Self {
            events: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Get all collected events
    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().clone()
    }

    /// Names of nodes that started, in start order
    pub fn started_nodes(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                RunEvent::NodeStarted { node_id, .. } => Some(node_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Clear all collected events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Default for VecEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for VecEventSink {
    fn send(&self, event: RunEvent) -> Result<(), EventError> {
        self.events.lock().push(event);
        Ok(())
    }
}

/// Forwards every event to the `log` facade
pub struct LogEventSink;

impl EventSink for LogEventSink {
    fn send(&self, event: RunEvent) -> Result<(), EventError> {
        match &event {
            RunEvent::NodeFailed { node_id, error, .. } => {
                log::error!("Node '{}' failed: {}", node_id, error)
            }
            RunEvent::GraphFailed { graph_id, error, .. } => {
                log::error!("Graph '{}' failed: {}", graph_id, error)
            }
            other => log::info!("{:?}", other),
        }
        Ok(())
    }
}
