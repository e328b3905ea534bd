//! Transform concatenation
//!
//! Streams a transform chain through `antsApplyTransforms` to write a single
//! composite transform file. The tool applies the listed transforms
//! last-to-first; `[ path, 1 ]` marks an element to be inverted.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use regflow_engine::transform::{chain_ports, PORT_OUT_XFM, PORT_REFERENCE};
use regflow_engine::{
    require, Artifact, ArtifactMap, DescribeOperation, Operation, OperationContext,
    OperationDescriptor, OperationError, OperationResult, ResourceHint, TransformChain,
};

use crate::command::{run_tool, step_dir, timeout_of};
use crate::config::DEFAULT_MEMORY_MIN_GB;

/// Program used to write composite transforms
pub const PROGRAM: &str = "antsApplyTransforms";

/// File name of the composite transform
pub const OUT_XFM: &str = "concat_xfm.h5";

/// Concatenate a transform chain into one file
pub struct ConcatXfm;

impl ConcatXfm {
    pub const KIND: &'static str = "concat-xfm";

    /// Full argument list for one concatenation
    pub fn arguments(
        chain: &TransformChain,
        out_xfm: &Path,
        reference: &Artifact,
    ) -> Result<Vec<String>, OperationError> {
        let reference = reference.to_arg().ok_or_else(|| OperationError::InvalidInput {
            port: PORT_REFERENCE.to_string(),
            expected: "an image path".to_string(),
        })?;

        let mut args = vec![
            "--output".to_string(),
            format!("[ {}, 1 ]", out_xfm.display()),
        ];
        args.extend(chain.to_arguments()?);
        args.push("--reference-image".to_string());
        args.push(reference);
        Ok(args)
    }
}

impl DescribeOperation for ConcatXfm {
    fn descriptor() -> OperationDescriptor {
        let (inputs, outputs) = chain_ports();
        let mut descriptor = OperationDescriptor::new(
            Self::KIND,
            "Concatenate Transforms",
            "Combine a transform chain into a single composite transform",
        )
        .with_resources(ResourceHint::memory(DEFAULT_MEMORY_MIN_GB));
        descriptor.inputs = inputs;
        descriptor.outputs = outputs;
        descriptor
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: ConcatXfm::descriptor,
    factory: || Arc::new(ConcatXfm),
});

#[async_trait]
impl Operation for ConcatXfm {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let chain = TransformChain::from_inputs(&inputs)?;
        let reference = require(&inputs, PORT_REFERENCE)?;

        let dir = step_dir(ctx);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            OperationError::failed(format!("Failed to create '{}': {}", dir.display(), e))
        })?;

        let out_xfm = dir.join(OUT_XFM);
        let args = Self::arguments(&chain, &out_xfm, reference)?;
        log::debug!(
            "Node '{}': concatenating {} transforms",
            ctx.node_id(),
            chain.len()
        );
        run_tool(PROGRAM, &args, &dir, timeout_of(ctx)).await?;

        let mut outputs = ArtifactMap::new();
        outputs.insert(PORT_OUT_XFM.to_string(), Artifact::path(out_xfm));
        Ok(outputs)
    }
}
