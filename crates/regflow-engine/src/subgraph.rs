//! Graphs embedded as single nodes
//!
//! The embedded graph runs through a nested scheduler that shares the
//! parent's budget and event sink, so resource ceilings hold across levels.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::OperationError;
use crate::graph::{Graph, OutputState};
use crate::node::{Node, Operation, OperationContext, OperationResult};
use crate::scheduler::{OutputValue, Scheduler};
use crate::types::{ArtifactMap, PortSpec};

/// Runs a whole graph as one operation
pub struct SubgraphOperation {
    graph: Arc<Graph>,
}

impl SubgraphOperation {
    pub fn new(graph: Arc<Graph>) -> Self {
        Self { graph }
    }

    /// Build a node exposing the graph's inputs and bound outputs
    pub fn node(name: impl Into<String>, graph: Arc<Graph>) -> Node {
        let inputs = graph.input_ports().to_vec();
        let outputs = graph
            .outputs()
            .iter()
            .filter(|o| matches!(o.state, OutputState::Bound(_)))
            .map(|o| PortSpec::optional(&o.port.name, o.port.kind))
            .collect();

        let mut node = Node::new(name, Arc::new(Self::new(graph)));
        node.inputs = inputs;
        node.outputs = outputs;
        node
    }

    /// The embedded graph
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

#[async_trait]
impl Operation for SubgraphOperation {
    fn kind(&self) -> &str {
        "subgraph"
    }

    fn is_composite(&self) -> bool {
        true
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        log::debug!(
            "Node '{}': running embedded graph '{}'",
            ctx.node_id(),
            self.graph.name()
        );

        let scheduler = Scheduler::new(ctx.config().clone())
            .with_budget(Arc::clone(ctx.budget()))
            .with_event_sink(Arc::clone(ctx.event_sink()));

        let report = scheduler.run(&self.graph, inputs).await?;
        let outputs = report.into_outputs().map_err(OperationError::from)?;

        // Bound outputs must all arrive; `NotTaken` ones are simply absent
        if let Some((name, _)) = outputs
            .iter()
            .find(|(_, value)| matches!(value, OutputValue::Unavailable))
        {
            return Err(OperationError::failed(format!(
                "embedded graph '{}' did not produce bound output '{}'",
                self.graph.name(),
                name
            )));
        }
        Ok(outputs.produced())
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::builder::GraphBuilder;
    use crate::config::SchedulerConfig;
    use crate::node::FnOperation;
    use crate::scheduler::NodeState;
    use crate::types::{Artifact, ArtifactKind, ResourceHint};

    fn midthickness_graph() -> Graph {
        let mut builder = GraphBuilder::new("midthickness_wf");
        let white = builder.input("white", ArtifactKind::Surface);
        let out = builder.declare_output("midthickness", ArtifactKind::Surface);
        let avg = builder
            .add_node(
                Node::new(
                    "average",
                    Arc::new(FnOperation::new("average", |_, inputs| {
                        let white = crate::node::require(&inputs, "white")?;
                        let mut out = ArtifactMap::new();
                        let name = format!("{}.mid", white.to_arg().unwrap_or_default());
                        out.insert("out".to_string(), Artifact::path(name));
                        Ok(out)
                    })),
                )
                .input("white", ArtifactKind::Surface)
                .output("out", ArtifactKind::Surface),
            )
            .unwrap();
        builder.connect(white, avg.input("white")).unwrap();
        builder.connect(avg.output("out"), out).unwrap();
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn test_embedded_graph_runs_as_one_node() {
        let child = midthickness_graph();

        let mut parent = GraphBuilder::new("surface_recon_wf");
        let white = parent.input("white", ArtifactKind::Surface);
        let out = parent.declare_output("midthickness", ArtifactKind::Surface);
        let mid = parent.embed_subgraph("midthickness", &child).unwrap();
        parent.connect(white, mid.input("white")).unwrap();
        parent.connect(mid.output("midthickness"), out).unwrap();
        let parent = parent.build().unwrap();

        let mut inputs = ArtifactMap::new();
        inputs.insert("white".to_string(), Artifact::path("lh.white"));

        let scheduler = Scheduler::new(SchedulerConfig::new(1.0, 1).with_max_concurrent_nodes(1));
        let outputs = scheduler
            .run(&parent, inputs)
            .await
            .unwrap()
            .into_outputs()
            .unwrap();
        assert_eq!(
            outputs.get("midthickness"),
            Some(&Artifact::path("lh.white.mid"))
        );
    }

    /// Holds its lease for a while before completing
    struct Slow {
        millis: u64,
    }

    #[async_trait]
    impl Operation for Slow {
        fn kind(&self) -> &str {
            "slow"
        }

        async fn execute(&self, ctx: &OperationContext, _inputs: ArtifactMap) -> OperationResult {
            tokio::time::sleep(std::time::Duration::from_millis(self.millis)).await;
            let mut out = ArtifactMap::new();
            out.insert("out".to_string(), Artifact::text(ctx.node_id()));
            Ok(out)
        }
    }

    #[tokio::test]
    async fn test_embedded_node_waits_for_sibling_lease() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut child = GraphBuilder::new("midthickness_wf");
        let out = child.declare_output("midthickness", ArtifactKind::Any);
        let mid = child
            .add_node(
                Node::new("midthickness", Arc::new(Slow { millis: 1 }))
                    .output("out", ArtifactKind::Any)
                    .with_resources(ResourceHint::memory(1.0)),
            )
            .unwrap();
        child.connect(mid.output("out"), out).unwrap();
        let child = child.build().unwrap();

        let mut parent = GraphBuilder::new("surface_recon_wf");
        let out = parent.declare_output("midthickness", ArtifactKind::Any);
        // Inserted first, so it takes the whole budget before the subgraph starts
        parent
            .add_node(
                Node::new("reconall", Arc::new(Slow { millis: 100 }))
                    .output("out", ArtifactKind::Any)
                    .with_resources(ResourceHint::memory(4.0)),
            )
            .unwrap();
        let sub = parent.embed_subgraph("make_midthickness", &child).unwrap();
        parent.connect(sub.output("midthickness"), out).unwrap();
        let parent = parent.build().unwrap();

        let report = Scheduler::new(SchedulerConfig::new(4.0, 4))
            .run(&parent, ArtifactMap::new())
            .await
            .unwrap();

        assert!(report.is_success());
        assert!(report.completion_index("reconall") < report.completion_index("make_midthickness"));
        let outputs = report.into_outputs().unwrap();
        assert_eq!(outputs.get("midthickness"), Some(&Artifact::text("midthickness")));
    }

    #[tokio::test]
    async fn test_missing_bound_output_fails_embedding_node() {
        let mut child = GraphBuilder::new("midthickness_wf");
        let out = child.declare_output("midthickness", ArtifactKind::Any);
        let quiet = child
            .add_node(
                Node::new(
                    "midthickness",
                    Arc::new(FnOperation::new("silent", |_, _| Ok(ArtifactMap::new()))),
                )
                .output("out", ArtifactKind::Any),
            )
            .unwrap();
        child.connect(quiet.output("out"), out).unwrap();
        let child = child.build().unwrap();

        let mut parent = GraphBuilder::new("surface_recon_wf");
        let out = parent.declare_output("midthickness", ArtifactKind::Any);
        let sub = parent.embed_subgraph("make_midthickness", &child).unwrap();
        parent.connect(sub.output("midthickness"), out).unwrap();
        let parent = parent.build().unwrap();

        let report = Scheduler::new(SchedulerConfig::default())
            .run(&parent, ArtifactMap::new())
            .await
            .unwrap();

        assert!(!report.is_success());
        assert!(matches!(
            report.state("make_midthickness"),
            Some(NodeState::Failed(_))
        ));
        assert!(report.into_outputs().is_err());
    }
}
