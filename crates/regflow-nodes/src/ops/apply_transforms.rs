//! Resample an image through a transform chain

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use regflow_engine::transform::{PORT_INVERT_FLAGS, PORT_REFERENCE, PORT_TRANSFORMS};
use regflow_engine::{
    require, Artifact, ArtifactKind, ArtifactMap, DescribeOperation, Operation, OperationContext,
    OperationDescriptor, OperationError, OperationResult, PortSpec, ResourceHint, TransformChain,
};

use crate::command::{run_tool, step_dir, timeout_of};
use crate::ops::concat_xfm::PROGRAM;

/// Interpolation used when the node sets none
pub const DEFAULT_INTERPOLATION: &str = "Linear";

/// Apply a transform chain to an image
///
/// # Parameters
/// - `interpolation` - `Linear`, `Gaussian`, `BSpline`, `MultiLabel`, ...
/// - `float` - compute in single precision
pub struct ApplyTransforms;

impl ApplyTransforms {
    pub const KIND: &'static str = "apply-transforms";

    pub const PORT_INPUT_IMAGE: &'static str = "input_image";
    pub const PORT_OUTPUT_IMAGE: &'static str = "output_image";

    const OUTPUT_FILE: &'static str = "resampled.nii.gz";

    /// Full argument list for one resampling
    pub fn arguments(
        input: &Artifact,
        reference: &Artifact,
        chain: &TransformChain,
        output: &std::path::Path,
        params: &Value,
    ) -> Result<Vec<String>, OperationError> {
        let path_of = |artifact: &Artifact, port: &str| {
            artifact.to_arg().ok_or_else(|| OperationError::InvalidInput {
                port: port.to_string(),
                expected: "an image path".to_string(),
            })
        };
        let interpolation = params
            .get("interpolation")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_INTERPOLATION);

        let mut args = vec![
            "--dimensionality".to_string(),
            "3".to_string(),
            "--input".to_string(),
            path_of(input, Self::PORT_INPUT_IMAGE)?,
            "--reference-image".to_string(),
            path_of(reference, PORT_REFERENCE)?,
            "--output".to_string(),
            output.display().to_string(),
            "--interpolation".to_string(),
            interpolation.to_string(),
        ];
        if params.get("float").and_then(Value::as_bool).unwrap_or(false) {
            args.push("--float".to_string());
            args.push("1".to_string());
        }
        args.extend(chain.to_arguments()?);
        Ok(args)
    }
}

impl DescribeOperation for ApplyTransforms {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Apply Transforms",
            "Resample an image into a reference space through a transform chain",
        )
        .with_input(PortSpec::required(Self::PORT_INPUT_IMAGE, ArtifactKind::Volume))
        .with_input(PortSpec::required(PORT_REFERENCE, ArtifactKind::Volume))
        .with_input(PortSpec::required(PORT_TRANSFORMS, ArtifactKind::Transform))
        .with_input(PortSpec::optional(PORT_INVERT_FLAGS, ArtifactKind::Value))
        .with_output(PortSpec::optional(Self::PORT_OUTPUT_IMAGE, ArtifactKind::Volume))
        .with_resources(ResourceHint::memory(1.0))
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: ApplyTransforms::descriptor,
    factory: || Arc::new(ApplyTransforms),
});

#[async_trait]
impl Operation for ApplyTransforms {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let chain = TransformChain::from_inputs(&inputs)?;
        let input = require(&inputs, Self::PORT_INPUT_IMAGE)?;
        let reference = require(&inputs, PORT_REFERENCE)?;

        let dir = step_dir(ctx);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            OperationError::failed(format!("Failed to create '{}': {}", dir.display(), e))
        })?;

        let output = dir.join(Self::OUTPUT_FILE);
        let args = Self::arguments(input, reference, &chain, &output, ctx.params())?;
        run_tool(PROGRAM, &args, &dir, timeout_of(ctx)).await?;

        let mut outputs = ArtifactMap::new();
        outputs.insert(Self::PORT_OUTPUT_IMAGE.to_string(), Artifact::path(output));
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::path::Path;

    #[test]
    fn test_arguments_carry_interpolation_and_inversion() {
        let chain = TransformChain::from_parts(
            vec![Artifact::path("fwd_affine.mat"), Artifact::path("fwd_warp.h5")],
            Some(vec![true, false]),
        )
        .unwrap();
        let args = ApplyTransforms::arguments(
            &Artifact::path("aseg.nii.gz"),
            &Artifact::path("t1w.nii.gz"),
            &chain,
            Path::new("out.nii.gz"),
            &json!({"interpolation": "MultiLabel"}),
        )
        .unwrap();

        let line = args.join(" ");
        assert!(line.contains("--interpolation MultiLabel"));
        assert!(line.ends_with("--transform [ fwd_affine.mat, 1 ] --transform fwd_warp.h5"));
        assert!(!line.contains("--float"));
    }

    #[test]
    fn test_default_interpolation_and_float() {
        let chain = TransformChain::from_parts(vec![Artifact::path("x.h5")], None).unwrap();
        let args = ApplyTransforms::arguments(
            &Artifact::path("in.nii.gz"),
            &Artifact::path("ref.nii.gz"),
            &chain,
            Path::new("out.nii.gz"),
            &json!({"float": true}),
        )
        .unwrap();
        let line = args.join(" ");
        assert!(line.contains("--interpolation Linear"));
        assert!(line.contains("--float 1"));
    }
}
