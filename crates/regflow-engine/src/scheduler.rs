//! Budget-aware DAG scheduler
//!
//! Nodes are visited in topological order. A node becomes ready once every
//! producer it depends on has completed; it starts as soon as the shared
//! resource budget can hold its hint. A failed node poisons its downstream
//! nodes (they become `Unreachable` and never run) while unrelated branches
//! keep going.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::budget::ResourceBudget;
use crate::config::SchedulerConfig;
use crate::error::{OperationError, RegflowError, Result};
use crate::events::{EventSink, NullEventSink, RunEvent};
use crate::graph::{Graph, OutputState, INPUT_NODE, OUTPUT_NODE};
use crate::node::{OperationContext, OperationResult};
use crate::types::{Artifact, ArtifactMap};

/// Terminal (or pending) state of a node after a run
#[derive(Debug, Clone, PartialEq)]
pub enum NodeState {
    /// Never reached a terminal state
    Pending,
    /// Ran successfully and produced these outputs
    Completed(ArtifactMap),
    /// Ran and failed
    Failed(String),
    /// Skipped because this upstream node failed
    Unreachable { failed_upstream: String },
}

impl NodeState {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Value of a declared output after a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "camelCase")]
pub enum OutputValue {
    /// The producing port delivered an artifact
    Produced(Artifact),
    /// The producing branch was never instantiated
    NotTaken,
    /// Bound, but the producer did not complete or did not emit the port
    Unavailable,
}

/// Declared outputs of a finished run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphOutputs {
    values: BTreeMap<String, OutputValue>,
}

impl GraphOutputs {
    /// Produced artifact of an output
    pub fn get(&self, name: &str) -> Option<&Artifact> {
        match self.values.get(name) {
            Some(OutputValue::Produced(artifact)) => Some(artifact),
            _ => None,
        }
    }

    /// Full state of an output
    pub fn value(&self, name: &str) -> Option<&OutputValue> {
        self.values.get(name)
    }

    /// Whether an output's branch was not instantiated
    pub fn is_not_taken(&self, name: &str) -> bool {
        matches!(self.values.get(name), Some(OutputValue::NotTaken))
    }

    /// All produced artifacts keyed by output name
    pub fn produced(&self) -> ArtifactMap {
        self.values
            .iter()
            .filter_map(|(name, value)| match value {
                OutputValue::Produced(artifact) => Some((name.clone(), artifact.clone())),
                _ => None,
            })
            .collect()
    }

    /// Iterate over every declared output
    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputValue)> {
        self.values.iter()
    }
}

/// Outcome of a scheduler run
///
/// Artifacts of completed nodes are kept even when the run failed.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub execution_id: String,
    pub graph: String,
    /// State per node name
    pub node_states: BTreeMap<String, NodeState>,
    /// Node names in the order they finished (completed or failed)
    pub completion_order: Vec<String>,
    /// Declared outputs
    pub outputs: GraphOutputs,
    /// First node failure, if any
    pub failure: Option<RegflowError>,
}

impl RunReport {
    /// Whether every node completed
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// State of a node
    pub fn state(&self, node: &str) -> Option<&NodeState> {
        self.node_states.get(node)
    }

    /// Outputs of a completed node
    pub fn artifacts(&self, node: &str) -> Option<&ArtifactMap> {
        match self.node_states.get(node) {
            Some(NodeState::Completed(artifacts)) => Some(artifacts),
            _ => None,
        }
    }

    /// Names of nodes that were skipped because of a failure upstream
    pub fn unreachable_nodes(&self) -> Vec<&str> {
        self.node_states
            .iter()
            .filter(|(_, s)| matches!(s, NodeState::Unreachable { .. }))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Position of a node in the completion order
    pub fn completion_index(&self, node: &str) -> Option<usize> {
        self.completion_order.iter().position(|n| n == node)
    }

    /// Convert into the graph outputs, or the run failure
    pub fn into_outputs(self) -> Result<GraphOutputs> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.outputs),
        }
    }
}

/// Executes graphs on the tokio runtime
pub struct Scheduler {
    config: SchedulerConfig,
    budget: Arc<ResourceBudget>,
    event_sink: Arc<dyn EventSink>,
}

impl Scheduler {
    /// Create a scheduler with its own budget
    pub fn new(config: SchedulerConfig) -> Self {
        let budget = Arc::new(ResourceBudget::new(&config));
        Self {
            config,
            budget,
            event_sink: Arc::new(NullEventSink),
        }
    }

    /// Share an existing budget (nested runs)
    pub fn with_budget(mut self, budget: Arc<ResourceBudget>) -> Self {
        self.budget = budget;
        self
    }

    /// Set the event sink
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    /// The budget this scheduler admits nodes against
    pub fn budget(&self) -> &Arc<ResourceBudget> {
        &self.budget
    }

    fn emit(&self, event: RunEvent) {
        if let Err(e) = self.event_sink.send(event) {
            log::warn!("Dropping run event: {}", e);
        }
    }

    /// Run a graph to completion
    ///
    /// `inputs` feed the graph's input ports. Returns `Err` only for
    /// structural problems found before any node starts; node failures are
    /// reported in the `RunReport`.
    pub async fn run(&self, graph: &Graph, inputs: ArtifactMap) -> Result<RunReport> {
        self.config.validate()?;
        let order = graph.topological_order()?;
        let execution_id = uuid::Uuid::new_v4().to_string();
        let nodes = graph.nodes();

        log::info!(
            "Running graph '{}' ({} nodes, execution {})",
            graph.name(),
            nodes.len(),
            execution_id
        );
        self.emit(RunEvent::GraphStarted {
            graph_id: graph.name().to_string(),
            execution_id: execution_id.clone(),
            node_count: nodes.len(),
        });

        let position: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.as_str(), i))
            .collect();
        let dependencies: Vec<Vec<usize>> = nodes
            .iter()
            .map(|n| {
                graph
                    .dependencies(&n.name)
                    .into_iter()
                    .filter_map(|d| position.get(d).copied())
                    .collect()
            })
            .collect();

        let mut states: Vec<NodeState> = vec![NodeState::Pending; nodes.len()];
        let mut waiting: Vec<usize> = order;
        let mut deferred: HashSet<usize> = HashSet::new();
        let mut running: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut completion_order = Vec::new();
        let mut failure: Option<RegflowError> = None;
        let mut tasks: JoinSet<OperationResult> = JoinSet::new();

        loop {
            // Armed before any admission attempt so a lease dropped elsewhere
            // during this pass still wakes the wait below
            let released = self.budget.released();
            tokio::pin!(released);
            released.as_mut().enable();
            let releases_seen = self.budget.release_count();
            let mut blocked: Vec<usize> = Vec::new();

            // Resolve every waiting node whose fate is decided, in topological order
            let mut still_waiting = Vec::with_capacity(waiting.len());
            for idx in waiting {
                let node = &nodes[idx];

                if let Some(upstream) = dependencies[idx].iter().find_map(|&d| match &states[d] {
                    NodeState::Failed(_) => Some(nodes[d].name.clone()),
                    NodeState::Unreachable { failed_upstream } => Some(failed_upstream.clone()),
                    _ => None,
                }) {
                    log::debug!(
                        "Node '{}' unreachable (upstream '{}' failed)",
                        node.name,
                        upstream
                    );
                    self.emit(RunEvent::NodeUnreachable {
                        node_id: node.name.clone(),
                        execution_id: execution_id.clone(),
                        failed_upstream: upstream.clone(),
                    });
                    states[idx] = NodeState::Unreachable {
                        failed_upstream: upstream,
                    };
                    continue;
                }

                if !dependencies[idx].iter().all(|&d| states[d].is_completed()) {
                    still_waiting.push(idx);
                    continue;
                }

                let resolved = self.resolve_inputs(graph, idx, &states, &position, &inputs);
                let node_inputs = match resolved {
                    Ok(node_inputs) => node_inputs,
                    Err(e) => {
                        let state = &mut states[idx];
                        self.fail_node(&execution_id, &node.name, e, state, &mut failure);
                        completion_order.push(node.name.clone());
                        continue;
                    }
                };

                let lease = if node.operation.is_composite() {
                    None
                } else {
                    match self.budget.try_acquire(node.resources.as_ref()) {
                        Some(lease) => Some(lease),
                        None => {
                            if deferred.insert(idx) {
                                log::debug!("Node '{}' waiting for budget", node.name);
                                self.emit(RunEvent::NodeDeferred {
                                    node_id: node.name.clone(),
                                    execution_id: execution_id.clone(),
                                });
                            }
                            blocked.push(idx);
                            still_waiting.push(idx);
                            continue;
                        }
                    }
                };

                let ctx = OperationContext {
                    node_id: node.name.clone(),
                    execution_id: execution_id.clone(),
                    params: node.params.clone(),
                    budget: Arc::clone(&self.budget),
                    config: self.config.clone(),
                    event_sink: Arc::clone(&self.event_sink),
                };
                let operation = Arc::clone(&node.operation);

                log::debug!("Starting node '{}' ({})", node.name, node.kind());
                self.emit(RunEvent::NodeStarted {
                    node_id: node.name.clone(),
                    execution_id: execution_id.clone(),
                });

                let handle = tasks.spawn(async move {
                    // Held until the operation returns
                    let _lease = lease;
                    operation.execute(&ctx, node_inputs).await
                });
                running.insert(handle.id(), idx);
            }
            waiting = still_waiting;

            if tasks.is_empty() {
                if waiting.is_empty() {
                    break;
                }
                if self.budget.release_count() != releases_seen {
                    continue;
                }
                if self.budget.nodes_in_flight() > 0 {
                    // Capacity is held outside this run, e.g. by a sibling of
                    // the node embedding this graph
                    log::debug!(
                        "Graph '{}': {} nodes waiting for capacity held elsewhere",
                        graph.name(),
                        blocked.len()
                    );
                    released.await;
                    continue;
                }

                // Idle budget and still nothing fits: these nodes can never start
                let stuck = if blocked.is_empty() {
                    waiting.clone()
                } else {
                    blocked
                };
                for idx in &stuck {
                    let error = OperationError::Unadmitted(format!(
                        "node '{}' does not fit an idle budget",
                        nodes[*idx].name
                    ));
                    self.fail_node(
                        &execution_id,
                        &nodes[*idx].name,
                        error,
                        &mut states[*idx],
                        &mut failure,
                    );
                    completion_order.push(nodes[*idx].name.clone());
                }
                waiting.retain(|idx| !stuck.contains(idx));
                continue;
            }

            let joined = tokio::select! {
                joined = tasks.join_next_with_id() => joined,
                _ = released.as_mut(), if !blocked.is_empty() => continue,
            };
            let Some(joined) = joined else {
                break;
            };

            let (idx, result) = match joined {
                Ok((id, result)) => match running.remove(&id) {
                    Some(idx) => (idx, result),
                    None => continue,
                },
                Err(join_error) => {
                    let Some(idx) = running.remove(&join_error.id()) else {
                        continue;
                    };
                    let message = if join_error.is_panic() {
                        "Node task panicked".to_string()
                    } else {
                        "Node task was cancelled".to_string()
                    };
                    (idx, Err(OperationError::Failed(message)))
                }
            };

            let name = nodes[idx].name.clone();
            completion_order.push(name.clone());
            match result {
                Ok(outputs) => {
                    log::debug!("Node '{}' completed", name);
                    self.emit(RunEvent::NodeCompleted {
                        node_id: name,
                        execution_id: execution_id.clone(),
                    });
                    states[idx] = NodeState::Completed(outputs);
                }
                Err(e) => self.fail_node(&execution_id, &name, e, &mut states[idx], &mut failure),
            }
        }

        let outputs = collect_outputs(graph, &states, &position);

        match &failure {
            Some(err) => self.emit(RunEvent::GraphFailed {
                graph_id: graph.name().to_string(),
                execution_id: execution_id.clone(),
                error: err.to_string(),
            }),
            None => self.emit(RunEvent::GraphCompleted {
                graph_id: graph.name().to_string(),
                execution_id: execution_id.clone(),
            }),
        }

        let node_states = nodes
            .iter()
            .zip(states)
            .map(|(n, s)| (n.name.clone(), s))
            .collect();

        Ok(RunReport {
            execution_id,
            graph: graph.name().to_string(),
            node_states,
            completion_order,
            outputs,
            failure,
        })
    }

    fn fail_node(
        &self,
        execution_id: &str,
        name: &str,
        error: OperationError,
        state: &mut NodeState,
        failure: &mut Option<RegflowError>,
    ) {
        let message = error.to_string();
        log::error!("Node '{}' failed: {}", name, message);
        self.emit(RunEvent::NodeFailed {
            node_id: name.to_string(),
            execution_id: execution_id.to_string(),
            error: message.clone(),
        });
        if failure.is_none() {
            *failure = Some(RegflowError::NodeFailed {
                node: name.to_string(),
                message: message.clone(),
            });
        }
        *state = NodeState::Failed(message);
    }

    /// Artifacts for every connected input of a ready node
    ///
    /// A connection whose producer completed without the port, or whose
    /// selector matches nothing, fails the consumer.
    fn resolve_inputs(
        &self,
        graph: &Graph,
        idx: usize,
        states: &[NodeState],
        position: &HashMap<&str, usize>,
        run_inputs: &ArtifactMap,
    ) -> std::result::Result<ArtifactMap, OperationError> {
        let node = &graph.nodes()[idx];
        let mut resolved = node.static_inputs.clone();

        if node.name == INPUT_NODE {
            for (port, artifact) in run_inputs {
                if node.find_input(port).is_some() {
                    resolved.insert(port.clone(), artifact.clone());
                } else {
                    log::warn!("Graph '{}' has no input '{}'; ignoring", graph.name(), port);
                }
            }
        }

        for edge in graph.inbound_edges(&node.name) {
            let Some(NodeState::Completed(produced)) =
                position.get(edge.source.node.as_str()).map(|&p| &states[p])
            else {
                continue;
            };
            let artifact = produced.get(&edge.source.port).ok_or_else(|| {
                OperationError::MissingInput(format!(
                    "'{}' produced nothing for '{}'",
                    edge.source, edge.target.port
                ))
            })?;
            let value = match &edge.selector {
                Some(selector) => artifact.select(selector).ok_or_else(|| {
                    OperationError::MissingInput(format!(
                        "selector {:?} matched nothing on '{}' for '{}'",
                        selector, edge.source, edge.target.port
                    ))
                })?,
                None => artifact.clone(),
            };
            resolved.insert(edge.target.port.clone(), value);
        }

        Ok(resolved)
    }
}

fn collect_outputs(
    graph: &Graph,
    states: &[NodeState],
    position: &HashMap<&str, usize>,
) -> GraphOutputs {
    let mut values = BTreeMap::new();
    for output in graph.outputs() {
        let value = match &output.state {
            OutputState::NotTaken => OutputValue::NotTaken,
            OutputState::Bound(_) => graph
                .inbound_edges(OUTPUT_NODE)
                .find(|e| e.target.port == output.port.name)
                .and_then(|edge| {
                    let state = position.get(edge.source.node.as_str()).map(|&p| &states[p]);
                    let produced = match state {
                        Some(NodeState::Completed(produced)) => produced,
                        _ => return None,
                    };
                    let artifact = produced.get(&edge.source.port)?;
                    match &edge.selector {
                        Some(selector) => artifact.select(selector),
                        None => Some(artifact.clone()),
                    }
                })
                .map(OutputValue::Produced)
                .unwrap_or(OutputValue::Unavailable),
        };
        values.insert(output.port.name.clone(), value);
    }
    GraphOutputs { values }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::builder::GraphBuilder;
    use crate::events::VecEventSink;
    use crate::budget::ResourceBudget;
    use crate::node::{FnOperation, Node, Operation};
    use crate::types::{ArtifactKind, ResourceHint};

    /// Records start/finish and tracks the peak memory in flight
    struct Tracker {
        log: Arc<Mutex<Vec<String>>>,
        in_flight: Arc<Mutex<(f64, f64)>>,
        memory: f64,
        fail: bool,
    }

    #[async_trait]
    impl Operation for Tracker {
        fn kind(&self) -> &str {
            "tracker"
        }

        async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
            {
                let mut flight = self.in_flight.lock();
                flight.0 += self.memory;
                flight.1 = flight.1.max(flight.0);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.lock().0 -= self.memory;
            self.log.lock().push(ctx.node_id().to_string());

            if self.fail {
                return Err(OperationError::failed("exit status 1"));
            }
            let mut out = inputs;
            out.insert("out".to_string(), Artifact::text(ctx.node_id()));
            Ok(out)
        }
    }

    struct Harness {
        log: Arc<Mutex<Vec<String>>>,
        in_flight: Arc<Mutex<(f64, f64)>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                log: Arc::new(Mutex::new(Vec::new())),
                in_flight: Arc::new(Mutex::new((0.0, 0.0))),
            }
        }

        fn node(&self, name: &str, memory: Option<f64>, fail: bool) -> Node {
            let tracker = Tracker {
                log: Arc::clone(&self.log),
                in_flight: Arc::clone(&self.in_flight),
                memory: memory.unwrap_or(0.0),
                fail,
            };
            let node = Node::new(name, Arc::new(tracker))
                .input("in", ArtifactKind::Any)
                .output("out", ArtifactKind::Any);
            match memory {
                Some(gb) => node.with_resources(ResourceHint::memory(gb)),
                None => node,
            }
        }

        fn peak_memory(&self) -> f64 {
            self.in_flight.lock().1
        }
    }

    fn volume_input() -> ArtifactMap {
        let mut inputs = ArtifactMap::new();
        inputs.insert("in_file".to_string(), Artifact::path("t1w.nii.gz"));
        inputs
    }

    /// Completes without emitting any output port
    fn silent(name: &str) -> Node {
        Node::new(name, Arc::new(FnOperation::new("silent", |_, _| Ok(ArtifactMap::new()))))
            .output("out", ArtifactKind::Any)
    }

    #[tokio::test]
    async fn test_budget_limits_concurrency() {
        let _ = env_logger::builder().is_test(true).try_init();
        let harness = Harness::new();
        let mut builder = GraphBuilder::new("fanout");
        let src = builder.input("in_file", ArtifactKind::Volume);
        for i in 0..4 {
            let n = builder.add_node(harness.node(&format!("n{i}"), Some(2.0), false)).unwrap();
            builder.connect(src.clone(), n.input("in")).unwrap();
        }
        let graph = builder.build().unwrap();

        let scheduler = Scheduler::new(SchedulerConfig::new(4.0, 8));
        let report = scheduler.run(&graph, volume_input()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(harness.log.lock().len(), 4);
        assert!(harness.peak_memory() <= 4.0 + 1e-9);
        assert_eq!(scheduler.budget().memory_in_use(), 0.0);
    }

    #[tokio::test]
    async fn test_oversized_hint_runs_alone() {
        let harness = Harness::new();
        let mut builder = GraphBuilder::new("big");
        builder.add_node(harness.node("huge", Some(64.0), false)).unwrap();
        builder.add_node(harness.node("small", Some(1.0), false)).unwrap();
        let graph = builder.build().unwrap();

        let sink = Arc::new(VecEventSink::new());
        let scheduler =
            Scheduler::new(SchedulerConfig::new(4.0, 4)).with_event_sink(sink.clone());
        let report = scheduler.run(&graph, ArtifactMap::new()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(*harness.log.lock(), vec!["huge".to_string(), "small".to_string()]);
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, RunEvent::NodeDeferred { node_id, .. } if node_id == "small")));
    }

    #[tokio::test]
    async fn test_failure_marks_downstream_unreachable() {
        let harness = Harness::new();
        let mut builder = GraphBuilder::new("wf");
        let src = builder.input("in_file", ArtifactKind::Volume);
        let bad = builder.add_node(harness.node("bad", None, true)).unwrap();
        let after = builder.add_node(harness.node("after", None, false)).unwrap();
        let after2 = builder.add_node(harness.node("after2", None, false)).unwrap();
        let other = builder.add_node(harness.node("other", None, false)).unwrap();
        builder.connect(src.clone(), bad.input("in")).unwrap();
        builder.connect(bad.output("out"), after.input("in")).unwrap();
        builder.connect(after.output("out"), after2.input("in")).unwrap();
        builder.connect(src, other.input("in")).unwrap();
        let out = builder.declare_output("other_out", ArtifactKind::Any);
        builder.connect(other.output("out"), out).unwrap();
        let graph = builder.build().unwrap();

        let report = Scheduler::new(SchedulerConfig::default())
            .run(&graph, volume_input())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert!(matches!(report.state("bad"), Some(NodeState::Failed(_))));
        assert_eq!(
            report.state("after2"),
            Some(&NodeState::Unreachable {
                failed_upstream: "bad".to_string()
            })
        );
        assert!(report.artifacts("other").is_some());
        assert_eq!(report.outputs.get("other_out"), Some(&Artifact::text("other")));
        assert!(!harness.log.lock().contains(&"after".to_string()));

        let err = report.into_outputs().unwrap_err();
        assert!(matches!(err, RegflowError::NodeFailed { node, .. } if node == "bad"));
    }

    #[tokio::test]
    async fn test_inputs_and_selectors_flow() {
        let mut builder = GraphBuilder::new("wf");
        let xfms = builder.input("xfms", ArtifactKind::Transform);
        let out = builder.declare_output("first", ArtifactKind::Transform);
        let pick = builder
            .add_node(Node::identity("pick", &[("x", ArtifactKind::Transform)]))
            .unwrap();
        builder
            .connect_with(xfms, pick.input("x"), crate::types::Selector::Index(1))
            .unwrap();
        builder.connect(pick.output("x"), out).unwrap();
        builder.declare_optional_output("unused", ArtifactKind::Any);
        let graph = builder.build().unwrap();

        let mut inputs = ArtifactMap::new();
        inputs.insert(
            "xfms".to_string(),
            Artifact::list([Artifact::path("a.h5"), Artifact::path("b.h5")]),
        );
        let outputs = Scheduler::new(SchedulerConfig::default())
            .run(&graph, inputs)
            .await
            .unwrap()
            .into_outputs()
            .unwrap();

        assert_eq!(outputs.get("first"), Some(&Artifact::path("b.h5")));
        assert!(outputs.is_not_taken("unused"));
    }

    #[tokio::test]
    async fn test_producer_completes_before_consumer_starts() {
        let harness = Harness::new();
        let mut builder = GraphBuilder::new("wf");
        let a = builder.add_node(harness.node("map_mask", Some(1.0), false)).unwrap();
        let b = builder.add_node(harness.node("thr_mask", None, false)).unwrap();
        builder.connect(a.output("out"), b.input("in")).unwrap();
        let graph = builder.build().unwrap();

        let report = Scheduler::new(SchedulerConfig::default())
            .run(&graph, ArtifactMap::new())
            .await
            .unwrap();
        assert!(report.completion_index("map_mask") < report.completion_index("thr_mask"));
        assert_eq!(
            report.artifacts("thr_mask").and_then(|a| a.get("in")),
            Some(&Artifact::text("map_mask"))
        );
    }

    #[tokio::test]
    async fn test_missing_port_fails_consumer() {
        let harness = Harness::new();
        let mut builder = GraphBuilder::new("wf");
        let quiet = builder.add_node(silent("n4_correct")).unwrap();
        let clip = builder.add_node(harness.node("final_clip", None, false)).unwrap();
        let after = builder.add_node(harness.node("apply_mask", None, false)).unwrap();
        builder.connect(quiet.output("out"), clip.input("in")).unwrap();
        builder.connect(clip.output("out"), after.input("in")).unwrap();
        let graph = builder.build().unwrap();

        let report = Scheduler::new(SchedulerConfig::default())
            .run(&graph, ArtifactMap::new())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert!(matches!(
            report.state("final_clip"),
            Some(NodeState::Failed(message)) if message.contains("produced nothing")
        ));
        assert_eq!(
            report.state("apply_mask"),
            Some(&NodeState::Unreachable {
                failed_upstream: "final_clip".to_string()
            })
        );
        assert!(harness.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unmatched_selector_fails_consumer() {
        let mut builder = GraphBuilder::new("wf");
        let xfms = builder.input("xfms", ArtifactKind::Transform);
        let out = builder.declare_output("picked", ArtifactKind::Transform);
        let pick = builder
            .add_node(Node::identity("pick", &[("x", ArtifactKind::Transform)]))
            .unwrap();
        builder
            .connect_with(xfms, pick.input("x"), crate::types::Selector::Index(3))
            .unwrap();
        builder.connect(pick.output("x"), out).unwrap();
        let graph = builder.build().unwrap();

        let mut inputs = ArtifactMap::new();
        inputs.insert("xfms".to_string(), Artifact::list([Artifact::path("a.h5")]));
        let report = Scheduler::new(SchedulerConfig::default())
            .run(&graph, inputs)
            .await
            .unwrap();

        assert!(matches!(report.state("pick"), Some(NodeState::Failed(_))));
        assert_eq!(report.outputs.value("picked"), Some(&OutputValue::Unavailable));
        let err = report.into_outputs().unwrap_err();
        assert!(matches!(err, RegflowError::NodeFailed { node, .. } if node == "pick"));
    }

    #[tokio::test]
    async fn test_zero_node_cap_rejected_before_running() {
        let harness = Harness::new();
        let mut builder = GraphBuilder::new("wf");
        builder.add_node(harness.node("clip", None, false)).unwrap();
        let graph = builder.build().unwrap();

        let config = SchedulerConfig::default().with_max_concurrent_nodes(0);
        let err = Scheduler::new(config)
            .run(&graph, ArtifactMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RegflowError::InvalidConfig(_)));
        assert!(harness.log.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unadmittable_nodes_fail_the_run() {
        let harness = Harness::new();
        let mut builder = GraphBuilder::new("wf");
        let first = builder.add_node(harness.node("denoise", Some(1.0), false)).unwrap();
        let second = builder.add_node(harness.node("n4_correct", None, false)).unwrap();
        builder.connect(first.output("out"), second.input("in")).unwrap();
        let graph = builder.build().unwrap();

        // A shared budget that admits nothing, even when idle
        let closed = SchedulerConfig::new(4.0, 4).with_max_concurrent_nodes(0);
        let report = Scheduler::new(SchedulerConfig::new(4.0, 4))
            .with_budget(Arc::new(ResourceBudget::new(&closed)))
            .run(&graph, ArtifactMap::new())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert!(matches!(
            report.state("denoise"),
            Some(NodeState::Failed(message)) if message.contains("budget")
        ));
        assert!(matches!(report.state("n4_correct"), Some(NodeState::Unreachable { .. })));
        assert!(report.node_states.values().all(|s| *s != NodeState::Pending));
        assert!(harness.log.lock().is_empty());
    }
}
