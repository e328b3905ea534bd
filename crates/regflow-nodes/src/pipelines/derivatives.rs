//! Move precomputed derivatives between T1w and T2w space
//!
//! Each derivative that is available adds one resampling step feeding its own
//! optional output; missing ones leave their output `NotTaken`.
//!
//! # Inputs
//! - `t1w_ref`, `t2w_ref` - reference images of both spaces
//! - `t1w2t2w_xfm` - forward transform chain from co-registration
//! - `t1w_mask`, `t1w_aseg`, `t2w_aseg` - the derivatives
//!
//! # Outputs (optional)
//! - `t2w_mask`, `t2w_aseg`, `t1w_aseg`

use serde_json::json;

use regflow_engine::{
    AdditiveBranches, Artifact, ArtifactKind, Graph, GraphBuilder, OperationRegistry,
};

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::ops::ApplyTransforms;
use crate::pipelines::step;

#[derive(Debug, Clone, PartialEq)]
pub struct DerivativesFlags {
    pub name: String,
    pub t1w_mask: bool,
    pub t1w_aseg: bool,
    pub t2w_aseg: bool,
}

impl Default for DerivativesFlags {
    fn default() -> Self {
        Self {
            name: "coregister_derivatives_wf".to_string(),
            t1w_mask: false,
            t1w_aseg: false,
            t2w_aseg: false,
        }
    }
}

pub fn build_coregister_derivatives(
    flags: &DerivativesFlags,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<Graph> {
    let mut b = GraphBuilder::new(&flags.name);

    let t1w_ref = b.input("t1w_ref", ArtifactKind::Volume);
    let t2w_ref = b.input("t2w_ref", ArtifactKind::Volume);
    let xfm = b.input("t1w2t2w_xfm", ArtifactKind::Transform);
    let t1w_mask = b.input("t1w_mask", ArtifactKind::LabelMap);
    let t1w_aseg = b.input("t1w_aseg", ArtifactKind::LabelMap);
    let t2w_aseg = b.input("t2w_aseg", ArtifactKind::LabelMap);

    let out_t2w_mask = b.declare_optional_output("t2w_mask", ArtifactKind::LabelMap);
    let out_t2w_aseg = b.declare_optional_output("t2w_aseg", ArtifactKind::LabelMap);
    let out_t1w_aseg = b.declare_optional_output("t1w_aseg", ArtifactKind::LabelMap);

    let multilabel = json!({ "interpolation": "MultiLabel" });
    let mut branches = AdditiveBranches::new("derivatives");

    branches.optional(&mut b, "t1wmask2t2w", flags.t1w_mask, "t2w_mask", |b| {
        let params = multilabel.clone();
        let node = step(registry, config, "t1wmask2t2w", ApplyTransforms::KIND, params)?;
        let node = b.add_node(node)?;
        b.connect(t1w_mask, node.input(ApplyTransforms::PORT_INPUT_IMAGE))?;
        b.connect(xfm.clone(), node.input("transforms"))?;
        b.connect(t2w_ref.clone(), node.input("reference_image"))?;
        b.connect(node.output(ApplyTransforms::PORT_OUTPUT_IMAGE), out_t2w_mask)
    })?;

    branches.optional(&mut b, "t1waseg2t2w", flags.t1w_aseg, "t2w_aseg", |b| {
        let params = multilabel.clone();
        let node = step(registry, config, "t1waseg2t2w", ApplyTransforms::KIND, params)?;
        let node = b.add_node(node)?;
        b.connect(t1w_aseg, node.input(ApplyTransforms::PORT_INPUT_IMAGE))?;
        b.connect(xfm.clone(), node.input("transforms"))?;
        b.connect(t2w_ref, node.input("reference_image"))?;
        b.connect(node.output(ApplyTransforms::PORT_OUTPUT_IMAGE), out_t2w_aseg)
    })?;

    branches.optional(&mut b, "t2waseg2t1w", flags.t2w_aseg, "t1w_aseg", |b| {
        // The forward chain is walked backwards: affine inverted, warp as is
        let node = step(registry, config, "t2waseg2t1w", ApplyTransforms::KIND, multilabel.clone())?
            .with_static(
                "invert_transform_flags",
                Artifact::list([Artifact::flag(true), Artifact::flag(false)]),
            );
        let node = b.add_node(node)?;
        b.connect(t2w_aseg, node.input(ApplyTransforms::PORT_INPUT_IMAGE))?;
        b.connect(xfm.clone(), node.input("transforms"))?;
        b.connect(t1w_ref, node.input("reference_image"))?;
        b.connect(node.output(ApplyTransforms::PORT_OUTPUT_IMAGE), out_t1w_aseg)
    })?;

    branches.finish(&mut b);
    Ok(b.build()?)
}
