//! Cortical surface reconstruction
//!
//! Two reconstruction back ends share the same tail: the subject's white and
//! graymid surfaces are located, a midthickness surface is derived from them
//! and stored next to the originals, and the subject directory fields are read
//! back from the stored files so downstream steps depend on the whole chain.
//!
//! # Inputs
//! - `t2w`, `skullstripped_t1` - anatomical references
//! - `in_aseg`, `in_mask` - precomputed segmentation and brain mask
//! - `subjects_dir`, `subject_id` - where the reconstruction is written
//!
//! # Outputs
//! - `subjects_dir`, `subject_id`
//! - `fsnative2anat_xfm`, `anat2fsnative_xfm` - optional, skipped when the
//!   transforms are precomputed

use serde_json::json;

use regflow_engine::{
    AdditiveBranches, ArtifactKind, BranchKind, BranchRecord, Graph, GraphBuilder, NodeHandle,
    OperationRegistry, PortRef,
};

use crate::catalog::{
    BinaryDilation, InfantReconAll, LtaConvert, MakeMidthickness, MapLabels, McribsPostRecon,
    McribsRecon, ReorientImage, RobustRegister,
};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ops::freesurfer::{PORT_SUBJECTS_DIR, PORT_SUBJECT_ID};
use crate::ops::{FreeSurferSource, LabelMapping, ReconOutdir, SaveSurfaces, SubjectFields};
use crate::pipelines::step;

/// Upper bound on threads for the per-hemisphere surface expansion
const MIDTHICKNESS_MAX_THREADS: usize = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct SurfaceFlags {
    pub name: String,
    /// A precomputed segmentation is available on `in_aseg`
    pub use_aseg: bool,
    /// A precomputed brain mask is available on `in_mask`
    pub use_mask: bool,
    /// The fsnative <-> anatomical transforms were precomputed
    pub precomputed_fsnative: bool,
    /// Age at scan, passed to the infant reconstruction
    pub age_months: Option<u32>,
    /// Relabelling applied to the segmentation before M-CRIB-S
    pub label_mapping: LabelMapping,
}

impl SurfaceFlags {
    pub fn mcribs() -> Self {
        Self {
            name: "mcribs_surface_recon_wf".to_string(),
            use_aseg: true,
            use_mask: false,
            precomputed_fsnative: false,
            age_months: None,
            label_mapping: LabelMapping::fs2mcribs(),
        }
    }

    pub fn infantfs() -> Self {
        Self {
            name: "infantfs_surface_recon_wf".to_string(),
            use_aseg: false,
            use_mask: false,
            precomputed_fsnative: false,
            age_months: None,
            label_mapping: LabelMapping::default(),
        }
    }

    pub fn with_aseg(mut self, use_aseg: bool) -> Self {
        self.use_aseg = use_aseg;
        self
    }

    pub fn with_mask(mut self, use_mask: bool) -> Self {
        self.use_mask = use_mask;
        self
    }

    pub fn with_precomputed_fsnative(mut self, precomputed: bool) -> Self {
        self.precomputed_fsnative = precomputed;
        self
    }

    pub fn with_age_months(mut self, age: u32) -> Self {
        self.age_months = Some(age);
        self
    }
}

/// Midthickness surfaces stored into the subject directory
///
/// Inputs `white` and `graymid` are per-hemisphere lists; outputs are the
/// subject directory fields recovered from the stored surfaces.
pub fn build_midthickness(config: &PipelineConfig, registry: &OperationRegistry) -> Result<Graph> {
    let mut b = GraphBuilder::new("make_midthickness_wf");

    let white = b.input("white", ArtifactKind::Surface);
    let graymid = b.input("graymid", ArtifactKind::Surface);
    let out_subjects_dir = b.declare_output(PORT_SUBJECTS_DIR, ArtifactKind::Any);
    let out_subject_id = b.declare_output(PORT_SUBJECT_ID, ArtifactKind::Value);

    let mut hint = config.threaded();
    hint.approx_threads = hint.approx_threads.min(MIDTHICKNESS_MAX_THREADS);
    let midthickness = step(registry, config, "midthickness", MakeMidthickness::KIND, json!({}))?
        .with_resources(hint);
    let midthickness = b.add_node(midthickness)?;

    let save = b.add_node(step(
        registry,
        config,
        "save_midthickness",
        SaveSurfaces::KIND,
        json!({ "suffix": "midthickness" }),
    )?)?;
    let sync = b.add_node(step(registry, config, "sync", SubjectFields::KIND, json!({}))?)?;

    b.connect(white.clone(), midthickness.input("in_file"))?;
    b.connect(graymid, midthickness.input("graymid"))?;
    b.connect(midthickness.output("out_file"), save.input("in_files"))?;
    b.connect(white, save.input("reference"))?;
    b.connect(save.output("out_file"), sync.input("filenames"))?;
    b.connect(sync.output(PORT_SUBJECTS_DIR), out_subjects_dir)?;
    b.connect(sync.output(PORT_SUBJECT_ID), out_subject_id)?;

    Ok(b.build()?)
}

/// Ports shared by both reconstruction graphs
struct SurfacePorts {
    t2w: PortRef,
    skullstripped_t1: PortRef,
    in_aseg: PortRef,
    in_mask: PortRef,
    subjects_dir: PortRef,
    subject_id: PortRef,
}

fn declare_ports(b: &mut GraphBuilder) -> SurfacePorts {
    let ports = SurfacePorts {
        t2w: b.input("t2w", ArtifactKind::Volume),
        skullstripped_t1: b.input("skullstripped_t1", ArtifactKind::Volume),
        in_aseg: b.input("in_aseg", ArtifactKind::LabelMap),
        in_mask: b.input("in_mask", ArtifactKind::LabelMap),
        subjects_dir: b.input(PORT_SUBJECTS_DIR, ArtifactKind::Any),
        subject_id: b.input(PORT_SUBJECT_ID, ArtifactKind::Value),
    };
    b.declare_output(PORT_SUBJECTS_DIR, ArtifactKind::Any);
    b.declare_output(PORT_SUBJECT_ID, ArtifactKind::Value);
    b.declare_optional_output("fsnative2anat_xfm", ArtifactKind::Transform);
    b.declare_optional_output("anat2fsnative_xfm", ArtifactKind::Transform);
    ports
}

/// Embed the midthickness graph after `fssource` and bind its outputs
fn finish_surfaces(
    b: &mut GraphBuilder,
    fssource: &NodeHandle,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<()> {
    let midthickness = b.embed_subgraph("midthickness_wf", &build_midthickness(config, registry)?)?;
    b.connect(fssource.output("white"), midthickness.input("white"))?;
    b.connect(fssource.output("graymid"), midthickness.input("graymid"))?;

    let out_subjects_dir = b.output(PORT_SUBJECTS_DIR);
    let out_subject_id = b.output(PORT_SUBJECT_ID);
    b.connect(midthickness.output(PORT_SUBJECTS_DIR), out_subjects_dir)?;
    b.connect(midthickness.output(PORT_SUBJECT_ID), out_subject_id)?;
    Ok(())
}

/// fsnative -> anatomical registration and its inverse, unless precomputed
fn fsnative_xfms(
    b: &mut GraphBuilder,
    flags: &SurfaceFlags,
    target: PortRef,
    source: PortRef,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<()> {
    let mut branches = AdditiveBranches::new("fsnative_xfm");
    branches.optional(
        b,
        "fsnative2anat_xfm",
        !flags.precomputed_fsnative,
        "fsnative2anat_xfm",
        |b| {
            let forward = b.add_node(step(
                registry,
                config,
                "fsnative2anat_xfm",
                RobustRegister::KIND,
                json!({}),
            )?)?;
            let inverse = b.add_node(step(
                registry,
                config,
                "anat2fsnative_xfm",
                LtaConvert::KIND,
                json!({}),
            )?)?;
            b.connect(target, forward.input("target_file"))?;
            b.connect(source, forward.input("source_file"))?;
            b.connect(forward.output("out_reg_file"), inverse.input("in_lta"))?;

            let out_forward = b.output("fsnative2anat_xfm");
            let out_inverse = b.output("anat2fsnative_xfm");
            b.connect(forward.output("out_reg_file"), out_forward)?;
            b.connect(inverse.output("out_lta"), out_inverse)
        },
    )?;
    branches.finish(b);
    Ok(())
}

/// Neonatal reconstruction with M-CRIB-S
///
/// M-CRIB-S cannot run without a segmentation, so `use_aseg` must be set.
pub fn build_mcribs_surfaces(
    flags: &SurfaceFlags,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<Graph> {
    if !flags.use_aseg {
        return Err(PipelineError::Unsupported(
            "M-CRIB-S surface reconstruction requires a precomputed segmentation".to_string(),
        ));
    }

    let mut b = GraphBuilder::new(&flags.name);
    let ports = declare_ports(&mut b);

    let map_labels = b.add_node(step(
        registry,
        config,
        "map_labels",
        MapLabels::KIND,
        json!({ "mappings": flags.label_mapping.to_param() }),
    )?)?;
    let las = json!({ "target_orientation": "LAS" });
    let t2w_las = b.add_node(step(registry, config, "t2w_las", ReorientImage::KIND, las.clone())?)?;
    let seg_las = b.add_node(step(registry, config, "seg_las", ReorientImage::KIND, las.clone())?)?;

    let mut recon = step(registry, config, "mcribs_recon", McribsRecon::KIND, json!({}))?;
    if let Some(hint) = recon.resources.as_mut() {
        hint.approx_threads = config.omp_nthreads;
    }
    let recon = b.add_node(recon)?;

    let mut postrecon =
        step(registry, config, "mcribs_postrecon", McribsPostRecon::KIND, json!({}))?;
    if let Some(hint) = postrecon.resources.as_mut() {
        hint.approx_threads = config.omp_nthreads;
    }
    let postrecon = b.add_node(postrecon)?;
    let fssource = step(registry, config, "fssource", FreeSurferSource::KIND, json!({}))?;
    let fssource = b.add_node(fssource)?;

    b.connect(ports.in_aseg, map_labels.input("in_file"))?;
    b.connect(ports.t2w.clone(), t2w_las.input("in_file"))?;
    b.connect(map_labels.output("out_file"), seg_las.input("in_file"))?;
    b.connect(t2w_las.output("out_file"), recon.input("t2w_file"))?;
    b.connect(seg_las.output("out_file"), recon.input("segmentation_file"))?;
    b.connect(ports.subjects_dir.clone(), recon.input(PORT_SUBJECTS_DIR))?;
    b.connect(ports.subject_id.clone(), recon.input(PORT_SUBJECT_ID))?;

    // Optional mask, dilated so the surfaces are not clipped at the boundary
    let mut record = BranchRecord {
        group: "mask".to_string(),
        kind: BranchKind::Additive,
        taken: Vec::new(),
        skipped: Vec::new(),
    };
    if flags.use_mask {
        let mask_dil = b.add_node(step(
            registry,
            config,
            "mask_dil",
            BinaryDilation::KIND,
            BinaryDilation::params(3, 1),
        )?)?;
        let mask_las = b.add_node(step(registry, config, "mask_las", ReorientImage::KIND, las)?)?;
        b.connect(ports.in_mask, mask_dil.input("in_file"))?;
        b.connect(mask_dil.output("out_file"), mask_las.input("in_file"))?;
        b.connect(mask_las.output("out_file"), recon.input("mask_file"))?;
        record.taken.push("mask_dil".to_string());
    } else {
        record.skipped.push("mask_dil".to_string());
    }
    b.record_branch(record);

    b.connect(ports.subjects_dir, postrecon.input(PORT_SUBJECTS_DIR))?;
    b.connect(ports.subject_id.clone(), postrecon.input(PORT_SUBJECT_ID))?;
    b.connect(recon.output("mcribs_dir"), postrecon.input("outdir"))?;
    b.connect(postrecon.output(PORT_SUBJECTS_DIR), fssource.input(PORT_SUBJECTS_DIR))?;
    b.connect(ports.subject_id, fssource.input(PORT_SUBJECT_ID))?;

    finish_surfaces(&mut b, &fssource, config, registry)?;
    fsnative_xfms(&mut b, flags, ports.t2w, fssource.output("T2"), config, registry)?;

    Ok(b.build()?)
}

/// Infant FreeSurfer reconstruction
///
/// The skull-stripped T1w doubles as the brain mask; the segmentation is used
/// when `use_aseg` is set.
pub fn build_infantfs_surfaces(
    flags: &SurfaceFlags,
    config: &PipelineConfig,
    registry: &OperationRegistry,
) -> Result<Graph> {
    let mut b = GraphBuilder::new(&flags.name);
    let ports = declare_ports(&mut b);

    let outdir = step(registry, config, "gen_recon_outdir", ReconOutdir::KIND, json!({}))?;
    let outdir = b.add_node(outdir)?;
    let age = match flags.age_months {
        Some(age) => json!({ "age": age }),
        None => json!({}),
    };
    let reconall = step(registry, config, "reconall", InfantReconAll::KIND, age)?
        .with_resources(config.threaded());
    let reconall = b.add_node(reconall)?;
    let fssource = step(registry, config, "fssource", FreeSurferSource::KIND, json!({}))?;
    let fssource = b.add_node(fssource)?;

    b.connect(ports.subjects_dir.clone(), outdir.input(PORT_SUBJECTS_DIR))?;
    b.connect(ports.subject_id.clone(), outdir.input(PORT_SUBJECT_ID))?;
    b.connect(ports.subject_id, reconall.input(PORT_SUBJECT_ID))?;
    b.connect(outdir.output("out"), reconall.input("outdir"))?;
    b.connect(ports.skullstripped_t1.clone(), reconall.input("mask_file"))?;
    if flags.use_aseg {
        b.connect(ports.in_aseg, reconall.input("aseg_file"))?;
    }

    // The reconstruction writes into `{subjects_dir}/{subject_id}`
    b.connect(ports.subjects_dir, fssource.input(PORT_SUBJECTS_DIR))?;
    b.connect(reconall.output(PORT_SUBJECT_ID), fssource.input(PORT_SUBJECT_ID))?;

    finish_surfaces(&mut b, &fssource, config, registry)?;
    fsnative_xfms(
        &mut b,
        flags,
        ports.skullstripped_t1,
        fssource.output("norm_nii"),
        config,
        registry,
    )?;

    Ok(b.build()?)
}
