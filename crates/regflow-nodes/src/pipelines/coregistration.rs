//! Within-subject T1w -> T2w co-registration
//!
//! Where the brain mask comes from decides the shape of the graph. Exactly
//! one of three alternatives is built, first match wins:
//!
//! 1. `t1w_mask` - a mask already in T1w space; a quick T2w mask only
//!    assists the registration
//! 2. `probmap` - a T2w probability map, mapped into T1w space and
//!    thresholded
//! 3. `precomputed` - a discrete T2w mask, mapped with label interpolation
//!
//! # Inputs
//! - `in_t1w`, `in_t2w` - preprocessed anatomical images
//! - `in_mask` - brain mask (T1w space for `t1w_mask`, T2w space otherwise)
//! - `in_probmap` - T2w brain probability map
//!
//! # Outputs
//! - `t1w_preproc`, `t1w_brain`, `t1w_mask`
//! - `t1w2t2w_xfm`, `t2w2t1w_xfm` - forward and reverse transform chains
//! - `t2w_preproc` - the T2w resampled into T1w space

use serde_json::json;

use regflow_engine::{
    ArtifactKind, ExclusiveBranches, Graph, GraphBuilder, Merge, OperationRegistry,
};

use crate::catalog::{ApplyMask, Binarize, BinaryDilation, N4BiasCorrection, QuickBrainMask};
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::ops::{AntsRegistration, ApplyTransforms};
use crate::pipelines::brain_extraction::MASK_THRESHOLD;
use crate::pipelines::step;

/// Branch group recording which mask source was used
pub const MASK_SOURCE: &str = "mask_source";

#[derive(Debug, Clone, PartialEq)]
pub struct CoregistrationFlags {
    pub name: String,
    /// A precomputed mask in T1w space is available
    pub t1w_mask: bool,
    /// A brain probability map in T2w space is available
    pub probmap: bool,
    /// Write intermediate registration volumes
    pub debug: bool,
}

impl Default for CoregistrationFlags {
    fn default() -> Self {
        Self {
            name: "coregistration_wf".to_string(),
            t1w_mask: false,
            probmap: true,
            debug: false,
        }
    }
}

pub fn build_coregistration(
    flags: &CoregistrationFlags,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<Graph> {
    let mut b = GraphBuilder::new(&flags.name);

    let in_t1w = b.input("in_t1w", ArtifactKind::Volume);
    let in_t2w = b.input("in_t2w", ArtifactKind::Volume);
    let in_mask = b.input("in_mask", ArtifactKind::LabelMap);
    let in_probmap = b.input("in_probmap", ArtifactKind::Volume);

    let t1w_preproc = b.declare_output("t1w_preproc", ArtifactKind::Volume);
    let t1w_brain = b.declare_output("t1w_brain", ArtifactKind::Volume);
    let t1w_mask = b.declare_output("t1w_mask", ArtifactKind::LabelMap);
    let t1w2t2w_xfm = b.declare_output("t1w2t2w_xfm", ArtifactKind::Transform);
    let t2w2t1w_xfm = b.declare_output("t2w2t1w_xfm", ArtifactKind::Transform);
    let t2w_preproc = b.declare_output("t2w_preproc", ArtifactKind::Volume);

    // Dilated T2w masks: a wide one for the first two stages, a tighter one
    // for the last
    let fixed_masks_arg = b.add_node(Merge::node("fixed_masks_arg", 3))?;
    let reg_mask = b.add_node(step(
        registry,
        config,
        "reg_mask",
        BinaryDilation::KIND,
        BinaryDilation::params(8, 3),
    )?)?;
    let refine_mask = b.add_node(step(
        registry,
        config,
        "refine_mask",
        BinaryDilation::KIND,
        BinaryDilation::params(8, 1),
    )?)?;

    let coreg = b.add_node(
        step(
            registry,
            config,
            "coreg",
            AntsRegistration::KIND,
            json!({
                "preset": "within_subject",
                "float": config.sloppy,
                "debug": flags.debug,
            }),
        )?
        .with_resources(config.heavy()),
    )?;
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
    let map_t2w = b.add_node(step(
        registry,
        config,
        "map_t2w",
        ApplyTransforms::KIND,
        json!({ "interpolation": "BSpline" }),
    )?)?;
    let apply_mask = b.add_node(step(registry, config, "apply_mask", ApplyMask::KIND, json!({}))?)?;

    b.connect(in_t1w.clone(), final_n4.input("input_image"))?;
    b.connect(in_t1w.clone(), coreg.input(AntsRegistration::PORT_MOVING))?;
    b.connect(in_t2w.clone(), coreg.input(AntsRegistration::PORT_FIXED))?;
    b.connect(reg_mask.output("out_file"), fixed_masks_arg.input("in1"))?;
    b.connect(reg_mask.output("out_file"), fixed_masks_arg.input("in2"))?;
    b.connect(refine_mask.output("out_file"), fixed_masks_arg.input("in3"))?;
    b.connect(in_t1w.clone(), map_t2w.input("reference_image"))?;
    b.connect(in_t2w.clone(), map_t2w.input(ApplyTransforms::PORT_INPUT_IMAGE))?;
    b.connect(
        fixed_masks_arg.output(Merge::PORT_OUT),
        coreg.input(AntsRegistration::PORT_FIXED_MASKS),
    )?;
    let reverse = [
        (AntsRegistration::PORT_REVERSE, "transforms"),
        (AntsRegistration::PORT_REVERSE_FLAGS, "invert_transform_flags"),
    ];
    b.connect_many(&coreg, &map_t2w, &reverse)?;
    b.connect(final_n4.output("output_image"), apply_mask.input("in_file"))?;
    b.connect(final_n4.output("output_image"), t1w_preproc)?;
    b.connect(map_t2w.output(ApplyTransforms::PORT_OUTPUT_IMAGE), t2w_preproc)?;
    b.connect(apply_mask.output("out_file"), t1w_brain)?;
    b.connect(coreg.output(AntsRegistration::PORT_FORWARD), t1w2t2w_xfm)?;
    b.connect(coreg.output(AntsRegistration::PORT_REVERSE), t2w2t1w_xfm)?;

    let selected = ExclusiveBranches::new(MASK_SOURCE)
        .when("t1w_mask", flags.t1w_mask, |b| {
            // Mask already in T1w space; a rough T2w mask only guides registration
            let masker = step(registry, config, "t2w_masker", QuickBrainMask::KIND, json!({}))?;
            let masker = b.add_node(masker)?;
            b.connect(in_t2w.clone(), masker.input("in_file"))?;
            b.connect(masker.output("out_mask"), reg_mask.input("in_file"))?;
            b.connect(masker.output("out_mask"), refine_mask.input("in_file"))?;
            b.connect(in_mask.clone(), apply_mask.input("in_mask"))?;
            b.connect(in_mask.clone(), t1w_mask.clone())
        })
        .when("probmap", flags.probmap, |b| {
            let map_mask = b.add_node(step(
                registry,
                config,
                "map_mask",
                ApplyTransforms::KIND,
                json!({ "interpolation": "Gaussian" }),
            )?)?;
            let thr_mask = b.add_node(step(
                registry,
                config,
                "thr_mask",
                Binarize::KIND,
                json!({ "thresh_low": MASK_THRESHOLD }),
            )?)?;
            b.connect(in_mask.clone(), reg_mask.input("in_file"))?;
            b.connect(in_mask.clone(), refine_mask.input("in_file"))?;
            b.connect(in_t1w.clone(), map_mask.input("reference_image"))?;
            b.connect(in_probmap.clone(), map_mask.input(ApplyTransforms::PORT_INPUT_IMAGE))?;
            b.connect_many(&coreg, &map_mask, &reverse)?;
            b.connect(map_mask.output("output_image"), thr_mask.input("in_file"))?;
            b.connect(map_mask.output("output_image"), final_n4.input("weight_image"))?;
            b.connect(thr_mask.output("out_mask"), t1w_mask.clone())?;
            b.connect(thr_mask.output("out_mask"), apply_mask.input("in_mask"))
        })
        .otherwise(&mut b, "precomputed", |b| {
            let map_precomp_mask = b.add_node(step(
                registry,
                config,
                "map_precomp_mask",
                ApplyTransforms::KIND,
                json!({ "interpolation": "MultiLabel" }),
            )?)?;
            b.connect(in_mask.clone(), reg_mask.input("in_file"))?;
            b.connect(in_mask.clone(), refine_mask.input("in_file"))?;
            b.connect(in_t1w.clone(), map_precomp_mask.input("reference_image"))?;
            b.connect(in_mask.clone(), map_precomp_mask.input(ApplyTransforms::PORT_INPUT_IMAGE))?;
            b.connect_many(&coreg, &map_precomp_mask, &reverse)?;
            let mapped = map_precomp_mask.output("output_image");
            b.connect(mapped.clone(), final_n4.input("weight_image"))?;
            b.connect(mapped.clone(), t1w_mask.clone())?;
            b.connect(mapped, apply_mask.input("in_mask"))
        })?;
    log::debug!("Graph '{}': mask source '{}'", flags.name, selected.name);

    Ok(b.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipelines::testing::{init_logging, inputs, recording_registry};
    use regflow_engine::{NodeState, Scheduler, SchedulerConfig};

    const BRANCH_NODES: [&str; 4] = ["t2w_masker", "map_mask", "thr_mask", "map_precomp_mask"];

    fn flags(t1w_mask: bool, probmap: bool) -> CoregistrationFlags {
        CoregistrationFlags {
            t1w_mask,
            probmap,
            ..Default::default()
        }
    }

    fn branch_nodes(graph: &Graph) -> Vec<&str> {
        BRANCH_NODES.into_iter().filter(|n| graph.contains(n)).collect()
    }

    #[test]
    fn test_mask_source_priority() {
        let (registry, _) = recording_registry();
        let config = PipelineConfig::default();

        let both = build_coregistration(&flags(true, true), &config, &registry).unwrap();
        assert_eq!(both.branch_selection(MASK_SOURCE), Some("t1w_mask"));
        assert_eq!(branch_nodes(&both), vec!["t2w_masker"]);

        let probmap = build_coregistration(&flags(false, true), &config, &registry).unwrap();
        assert_eq!(probmap.branch_selection(MASK_SOURCE), Some("probmap"));
        assert_eq!(branch_nodes(&probmap), vec!["map_mask", "thr_mask"]);

        let fallback = build_coregistration(&flags(false, false), &config, &registry).unwrap();
        assert_eq!(fallback.branch_selection(MASK_SOURCE), Some("precomputed"));
        assert_eq!(branch_nodes(&fallback), vec!["map_precomp_mask"]);
    }

    #[test]
    fn test_rebuild_is_identical() {
        let (registry, _) = recording_registry();
        let config = PipelineConfig::default().with_omp_nthreads(4);
        let first = build_coregistration(&flags(false, true), &config, &registry).unwrap();
        let second = build_coregistration(&flags(false, true), &config, &registry).unwrap();
        assert_eq!(first.summary(), second.summary());
    }

    #[test]
    fn test_registration_masks_and_resources() {
        let (registry, _) = recording_registry();
        let config = PipelineConfig::default().with_mem_gb(6.0).with_omp_nthreads(8);
        let graph = build_coregistration(&flags(false, true), &config, &registry).unwrap();

        assert_eq!(graph.node("reg_mask").unwrap().params["radius"], 24);
        assert_eq!(graph.node("refine_mask").unwrap().params["radius"], 8);
        let coreg = graph.node("coreg").unwrap();
        assert_eq!(coreg.params["preset"], "within_subject");
        assert_eq!(coreg.resources.unwrap().approx_threads, 8);
        assert_eq!(coreg.resources.unwrap().approx_memory_gb, 6.0);
        assert_eq!(graph.node("map_t2w").unwrap().params["interpolation"], "BSpline");

        // Resampling steps carry the descriptor's 1 GB hint
        for name in ["map_t2w", "map_mask"] {
            let hint = graph.node(name).unwrap().resources.unwrap();
            assert_eq!(hint.approx_memory_gb, 1.0, "{name}");
        }
    }

    #[tokio::test]
    async fn test_probmap_run_thresholds_after_mapping() {
        init_logging();
        let (registry, calls) = recording_registry();
        let graph =
            build_coregistration(&flags(false, true), &PipelineConfig::default(), &registry)
                .unwrap();

        let report = Scheduler::new(SchedulerConfig::new(8.0, 2))
            .run(&graph, inputs(&["in_t1w", "in_t2w", "in_mask", "in_probmap"]))
            .await
            .unwrap();
        assert!(report.is_success());

        let ran = calls.lock().clone();
        assert!(ran.contains(&"thr_mask".to_string()));
        assert!(!ran.contains(&"t2w_masker".to_string()));
        assert!(!ran.contains(&"map_precomp_mask".to_string()));
        let position = |node: &str| ran.iter().position(|n| n == node).unwrap();
        assert!(position("map_mask") < position("thr_mask"));
        assert!(position("coreg") < position("map_mask"));
        assert!(matches!(report.state("thr_mask"), Some(NodeState::Completed(_))));

        let outputs = report.into_outputs().unwrap();
        assert_eq!(
            outputs.get("t1w_mask").and_then(|a| a.as_path()).map(|p| p.to_path_buf()),
            Some("/mock/thr_mask/out_mask".into())
        );
    }
}
