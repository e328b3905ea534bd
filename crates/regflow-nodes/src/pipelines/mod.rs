//! Registration pipelines
//!
//! Each pipeline is a pure function of its flags, the shared
//! `PipelineConfig` and an `OperationRegistry`. Calling it twice with the
//! same arguments yields structurally identical graphs; nothing runs until
//! the graph is handed to a `Scheduler`.

pub mod brain_extraction;
pub mod concat_registrations;
pub mod coregistration;
pub mod derivatives;
pub mod preproc;
pub mod surfaces;

pub use brain_extraction::{build_brain_extraction, BrainExtractionFlags};
pub use concat_registrations::{build_concat_registrations, ConcatRegistrationsFlags};
pub use coregistration::{build_coregistration, CoregistrationFlags};
pub use derivatives::{build_coregister_derivatives, DerivativesFlags};
pub use preproc::{build_preproc, PreprocFlags};
pub use surfaces::{
    build_infantfs_surfaces, build_mcribs_surfaces, build_midthickness, SurfaceFlags,
};

use serde_json::Value;

use regflow_engine::{Node, OperationRegistry};

use crate::config::PipelineConfig;

/// Instantiate a registered step carrying the pipeline's shared parameters
pub(crate) fn step(
    registry: &OperationRegistry,
    config: &PipelineConfig,
    name: &str,
    kind: &str,
    extra: Value,
) -> regflow_engine::Result<Node> {
    Ok(registry
        .instantiate(name, kind)?
        .with_params(config.step_params(extra)))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use regflow_engine::{Artifact, ArtifactMap, FnOperation, OperationRegistry};

    /// Node ids in the order their operations ran
    pub type Calls = Arc<Mutex<Vec<String>>>;

    pub fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// Built-in registry whose operations only record their calls
    ///
    /// Every declared output port receives a fake path named after the node.
    pub fn recording_registry() -> (OperationRegistry, Calls) {
        let mut registry = OperationRegistry::with_builtins();
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));

        let descriptors: Vec<_> = registry.descriptors().into_iter().cloned().collect();
        for descriptor in descriptors {
            let calls = calls.clone();
            let outputs: Vec<String> = descriptor.outputs.iter().map(|p| p.name.clone()).collect();
            let operation = FnOperation::new(descriptor.kind.clone(), move |ctx, _inputs| {
                calls.lock().push(ctx.node_id().to_string());
                Ok(outputs
                    .iter()
                    .map(|port| {
                        (
                            port.clone(),
                            Artifact::path(format!("/mock/{}/{}", ctx.node_id(), port)),
                        )
                    })
                    .collect::<ArtifactMap>())
            });
            registry
                .replace_operation(&descriptor.kind, Arc::new(operation))
                .unwrap();
        }
        (registry, calls)
    }

    /// Graph inputs, each a fake path named after its port
    pub fn inputs(ports: &[&str]) -> ArtifactMap {
        ports
            .iter()
            .map(|port| (port.to_string(), Artifact::path(format!("/in/{port}"))))
            .collect()
    }
}
