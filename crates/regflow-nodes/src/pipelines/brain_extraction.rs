//! Atlas-based brain extraction of a T2w image
//!
//! The template and the T2w are registered on two channels (intensity and a
//! normalised Laplacian). The template's brain probability map is then pulled
//! into T2w space through the reverse transforms, thresholded into a mask and
//! used to refine the bias correction.
//!
//! # Inputs
//! - `in_t2w` - the unprocessed T2w image
//!
//! # Outputs
//! - `t2w_preproc` - bias-corrected and clipped T2w
//! - `t2w_brain` - the same, brain-extracted
//! - `out_mask` - binary brain mask in T2w space
//! - `out_probmap` - brain probability map in T2w space, before thresholding

use serde_json::json;

use regflow_engine::{
    Artifact, ArtifactKind, BranchKind, BranchRecord, Graph, GraphBuilder, Merge, OperationRegistry,
};

use crate::catalog::{
    AffineSearch, AntsAi, ApplyMask, Binarize, ImageMath, IntensityClip, N4BiasCorrection,
};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::ops::{AntsRegistration, ApplyTransforms, TemplateFiles, TemplateId};
use crate::pipelines::step;

/// Threshold turning the mapped probability map into a mask
pub const MASK_THRESHOLD: f64 = 0.80;

#[derive(Debug, Clone, PartialEq)]
pub struct BrainExtractionFlags {
    pub name: String,
    /// Template files, resolved before assembly
    pub template: TemplateFiles,
    /// Search for an initial affine before registering
    pub ants_affine_init: Option<AffineSearch>,
}

impl BrainExtractionFlags {
    pub fn new(template: TemplateFiles) -> Self {
        Self {
            name: "infant_brain_extraction_wf".to_string(),
            template,
            ants_affine_init: None,
        }
    }

    pub fn with_affine_init(mut self, search: AffineSearch) -> Self {
        self.ants_affine_init = Some(search);
        self
    }

    /// Resolve the files of a template (`Name:cohort-N:...`) from the store
    ///
    /// MNIInfant comes at 1 mm, or 2 mm in sloppy mode.
    pub fn resolve_template(config: &PipelineConfig, template: &str) -> Result<TemplateFiles> {
        let mut id = TemplateId::parse(template)?;
        if id.name == "MNIInfant" {
            let res = if config.sloppy { "2" } else { "1" };
            id.spec.insert("res".to_string(), res.to_string());
        }
        TemplateFiles::locate(&config.templateflow_home, &id)
    }
}

pub fn build_brain_extraction(
    flags: &BrainExtractionFlags,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<Graph> {
    let template = &flags.template;
    let mut b = GraphBuilder::new(&flags.name);

    let in_t2w = b.input("in_t2w", ArtifactKind::Volume);
    let t2w_preproc = b.declare_output("t2w_preproc", ArtifactKind::Volume);
    let t2w_brain = b.declare_output("t2w_brain", ArtifactKind::Volume);
    let out_mask = b.declare_output("out_mask", ArtifactKind::LabelMap);
    let out_probmap = b.declare_output("out_probmap", ArtifactKind::Volume);

    let default_clip = IntensityClip::params(35.0, 99.98);
    let laplacian = json!({ "operation": "Laplacian", "op2": [0.4, 1] });

    // Template intensities in a range the registration handles well
    let clip_tmpl = b.add_node(
        step(registry, config, "clip_tmpl", IntensityClip::KIND, default_clip.clone())?
            .with_static("in_file", Artifact::path(&template.target)),
    )?;

    // Laplacian registration targets
    let lap_tmpl = step(registry, config, "lap_tmpl", ImageMath::KIND, laplacian.clone())?;
    let lap_tmpl = b.add_node(lap_tmpl)?;
    let lap_t2w = b.add_node(step(registry, config, "lap_t2w", ImageMath::KIND, laplacian)?)?;
    let norm_lap_tmpl = b.add_node(step(
        registry,
        config,
        "norm_lap_tmpl",
        IntensityClip::KIND,
        default_clip.clone(),
    )?)?;
    let norm_lap_t2w = b.add_node(step(
        registry,
        config,
        "norm_lap_t2w",
        IntensityClip::KIND,
        default_clip,
    )?)?;

    let mrg_tmpl = b.add_node(Merge::node("mrg_tmpl", 2))?;
    let mrg_t2w = b.add_node(Merge::node("mrg_t2w", 2))?;

    let preset = if config.sloppy { "testing" } else { "precise" };
    let mut norm = step(
        registry,
        config,
        "norm",
        AntsRegistration::KIND,
        json!({ "preset": preset, "float": config.sloppy }),
    )?
    .with_resources(config.heavy());
    if let Some(regmask) = &template.registration_mask {
        norm = norm.with_static(AntsRegistration::PORT_FIXED_MASKS, Artifact::path(regmask));
    }
    let norm = b.add_node(norm)?;

    let map_mask_t2w = b.add_node(
        step(
            registry,
            config,
            "map_mask_t2w",
            ApplyTransforms::KIND,
            json!({ "interpolation": "Gaussian", "float": true }),
        )?
        .with_static(ApplyTransforms::PORT_INPUT_IMAGE, Artifact::path(&template.brain_mask)),
    )?;
    let thr_t2w_mask = b.add_node(step(
        registry,
        config,
        "thr_t2w_mask",
        Binarize::KIND,
        json!({ "thresh_low": MASK_THRESHOLD }),
    )?)?;

    // Bias correction refined with the brain probability map as weight
    let final_n4 = b.add_node(
        step(
            registry,
            config,
            "final_n4",
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
        IntensityClip::params(5.0, 98.0),
    )?)?;
    let apply_mask = b.add_node(step(registry, config, "apply_mask", ApplyMask::KIND, json!({}))?)?;

    // 1. T2w channels
    b.connect(in_t2w.clone(), final_n4.input("input_image"))?;
    b.connect(in_t2w.clone(), mrg_t2w.input("in1"))?;
    b.connect(in_t2w.clone(), lap_t2w.input("op1"))?;
    b.connect(in_t2w.clone(), map_mask_t2w.input("reference_image"))?;
    b.connect(lap_t2w.output("output_image"), norm_lap_t2w.input("in_file"))?;
    b.connect(norm_lap_t2w.output("out_file"), mrg_t2w.input("in2"))?;
    // 2. Template channels
    b.connect(clip_tmpl.output("out_file"), lap_tmpl.input("op1"))?;
    b.connect(lap_tmpl.output("output_image"), norm_lap_tmpl.input("in_file"))?;
    b.connect(clip_tmpl.output("out_file"), mrg_tmpl.input("in1"))?;
    b.connect(norm_lap_tmpl.output("out_file"), mrg_tmpl.input("in2"))?;
    // 3. Registration
    b.connect(mrg_tmpl.output(Merge::PORT_OUT), norm.input(AntsRegistration::PORT_FIXED))?;
    b.connect(mrg_t2w.output(Merge::PORT_OUT), norm.input(AntsRegistration::PORT_MOVING))?;
    // 4. Template mask into T2w space
    b.connect_many(
        &norm,
        &map_mask_t2w,
        &[
            (AntsRegistration::PORT_REVERSE, "transforms"),
            (AntsRegistration::PORT_REVERSE_FLAGS, "invert_transform_flags"),
        ],
    )?;
    b.connect(map_mask_t2w.output("output_image"), thr_t2w_mask.input("in_file"))?;
    b.connect(thr_t2w_mask.output("out_mask"), apply_mask.input("in_mask"))?;
    b.connect(final_n4.output("output_image"), apply_mask.input("in_file"))?;
    // 5. Refined bias correction
    b.connect(map_mask_t2w.output("output_image"), final_n4.input("weight_image"))?;
    b.connect(final_n4.output("output_image"), final_clip.input("in_file"))?;

    b.connect(final_clip.output("out_file"), t2w_preproc)?;
    b.connect(map_mask_t2w.output("output_image"), out_probmap)?;
    b.connect(thr_t2w_mask.output("out_mask"), out_mask)?;
    b.connect(apply_mask.output("out_file"), t2w_brain)?;

    let mut record = BranchRecord {
        group: "affine_init".to_string(),
        kind: BranchKind::Additive,
        taken: Vec::new(),
        skipped: Vec::new(),
    };
    match flags.ants_affine_init {
        Some(search) => {
            let params = AntsAi::params(search);
            let mut init_aff = step(registry, config, "init_aff", AntsAi::KIND, params)?
                .with_resources(config.threaded());
            if let Some(regmask) = &template.registration_mask {
                init_aff = init_aff.with_static("fixed_image_mask", Artifact::path(regmask));
            }
            let init_aff = b.add_node(init_aff)?;
            b.connect(clip_tmpl.output("out_file"), init_aff.input("fixed_image"))?;
            b.connect(in_t2w, init_aff.input("moving_image"))?;
            b.connect(
                init_aff.output("output_transform"),
                norm.input(AntsRegistration::PORT_INITIAL),
            )?;
            record.taken.push("init_aff".to_string());
        }
        None => record.skipped.push("init_aff".to_string()),
    }
    b.record_branch(record);

    Ok(b.build()?)
}
