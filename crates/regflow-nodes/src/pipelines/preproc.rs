//! Anatomical preprocessing: clip -> denoise -> N4 -> final clip
//!
//! # Inputs
//! - `in_anat` - a single T1w or T2w volume
//!
//! # Outputs
//! - `anat_preproc` - denoised, bias-corrected and clipped volume

use serde_json::json;

use regflow_engine::{ArtifactKind, Graph, GraphBuilder, OperationRegistry};

use crate::catalog::{DenoiseImage, IntensityClip, N4BiasCorrection};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::pipelines::step;

#[derive(Debug, Clone, PartialEq)]
pub struct PreprocFlags {
    pub name: String,
}

impl Default for PreprocFlags {
    fn default() -> Self {
        Self {
            name: "preproc_anat_wf".to_string(),
        }
    }
}

pub fn build_preproc(
    flags: &PreprocFlags,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<Graph> {
    let mut b = GraphBuilder::new(&flags.name);
    let in_anat = b.input("in_anat", ArtifactKind::Volume);
    let anat_preproc = b.declare_output("anat_preproc", ArtifactKind::Volume);

    let clip = b.add_node(step(
        registry,
        config,
        "clip",
        IntensityClip::KIND,
        IntensityClip::params(10.0, 99.5),
    )?)?;
    let denoise = b.add_node(
        step(registry, config, "denoise", DenoiseImage::KIND, json!({}))?
            .with_resources(config.threaded()),
    )?;
    let n4_correct = b.add_node(
        step(
            registry,
            config,
            "n4_correct",
            N4BiasCorrection::KIND,
            json!({ "bspline_fitting_distance": config.bspline_fitting_distance }),
        )?
        .with_resources(config.threaded()),
    )?;
    let final_clip = b.add_node(step(
        registry,
        config,
        "final_clip",
        IntensityClip::KIND,
        IntensityClip::params(5.0, 99.5),
    )?)?;

    b.connect(in_anat, clip.input("in_file"))?;
    b.connect(clip.output("out_file"), denoise.input("input_image"))?;
    b.connect(denoise.output("output_image"), n4_correct.input("input_image"))?;
    b.connect(n4_correct.output("output_image"), final_clip.input("in_file"))?;
    b.connect(final_clip.output("out_file"), anat_preproc)?;

    Ok(b.build()?)
}
