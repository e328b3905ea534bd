//! External step kinds wrapped as command operations
//!
//! Each kind pairs a descriptor (ports, default resources) with the
//! `CommandOperation` that runs it. Both are collected at link time, so
//! `OperationRegistry::with_builtins()` knows every kind listed here.

use std::sync::Arc;

use serde_json::{json, Value};

use regflow_engine::{ArtifactKind, DescribeOperation, OperationDescriptor, PortSpec, ResourceHint};

use crate::command::CommandOperation;
use crate::config::PARAM_NUM_THREADS;
use crate::ops::freesurfer::{PORT_SUBJECTS_DIR, PORT_SUBJECT_ID};

macro_rules! register_command {
    ($step:ty) => {
        inventory::submit!(regflow_engine::OperationFn {
            descriptor: <$step>::descriptor,
            factory: || Arc::new(<$step>::command()),
        });
    };
}

fn volume_in(name: &str) -> PortSpec {
    PortSpec::required(name, ArtifactKind::Volume)
}

fn volume_out(name: &str) -> PortSpec {
    PortSpec::optional(name, ArtifactKind::Volume)
}

// --- Intensity ------------------------------------------------------------

/// Clip intensities to a percentile range
pub struct IntensityClip;

impl IntensityClip {
    pub const KIND: &'static str = "intensity-clip";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "ImageMath")
            .lit(&["3"])
            .output("out_file", "clipped.nii.gz")
            .lit(&["TruncateImageIntensity"])
            .input("in_file")
            .param("lower_quantile")
            .param("upper_quantile")
    }

    /// Step parameters for a percentile range
    pub fn params(p_min: f64, p_max: f64) -> Value {
        json!({
            "lower_quantile": p_min / 100.0,
            "upper_quantile": p_max / 100.0,
        })
    }
}

impl DescribeOperation for IntensityClip {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Intensity Clip",
            "Clip intensities to a percentile range",
        )
        .with_input(volume_in("in_file"))
        .with_output(volume_out("out_file"))
    }
}

register_command!(IntensityClip);

/// Rician denoising
pub struct DenoiseImage;

impl DenoiseImage {
    pub const KIND: &'static str = "denoise-image";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "DenoiseImage")
            .lit(&["-d", "3", "-n", "Rician", "-i"])
            .input("input_image")
            .lit(&["-o"])
            .output("output_image", "denoised.nii.gz")
    }
}

impl DescribeOperation for DenoiseImage {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "Denoise Image", "Non-local means denoising")
            .with_input(volume_in("input_image"))
            .with_output(volume_out("output_image"))
    }
}

register_command!(DenoiseImage);

/// N4 bias field correction, optionally weighted by a mask
///
/// # Parameters
/// - `bspline_fitting_distance` - mm between B-spline control points
pub struct N4BiasCorrection;

impl N4BiasCorrection {
    pub const KIND: &'static str = "n4-bias-correction";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "N4BiasFieldCorrection")
            .lit(&["-d", "3", "-i"])
            .input("input_image")
            .opt_input("-w", "weight_image")
            .lit(&["-b"])
            .format("[ {bspline_fitting_distance} ]")
            .lit(&["-c", "[ 50x50x50x50x50, 1e-07 ]", "-s", "4", "-r", "1", "-o"])
            .produces("output_image", "corrected.nii.gz")
            .produces("bias_image", "bias.nii.gz")
            .format("[ {@output_image}, {@bias_image} ]")
    }
}

impl DescribeOperation for N4BiasCorrection {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "N4 Bias Correction",
            "Intensity non-uniformity correction",
        )
        .with_input(volume_in("input_image"))
        .with_input(PortSpec::optional("weight_image", ArtifactKind::Volume))
        .with_output(volume_out("output_image"))
        .with_output(volume_out("bias_image"))
    }
}

register_command!(N4BiasCorrection);

/// Generic `ImageMath` operation on one image
///
/// # Parameters
/// - `operation` - e.g. `Laplacian`
/// - `op2` - trailing operation arguments (array)
pub struct ImageMath;

impl ImageMath {
    pub const KIND: &'static str = "image-math";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "ImageMath")
            .lit(&["3"])
            .output("output_image", "math.nii.gz")
            .param("operation")
            .input("op1")
            .param("op2")
    }
}

impl DescribeOperation for ImageMath {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "Image Math", "Apply an ImageMath operation")
            .with_input(volume_in("op1"))
            .with_output(volume_out("output_image"))
    }
}

register_command!(ImageMath);

// --- Masks ----------------------------------------------------------------

/// Threshold a probability map into a binary mask
///
/// # Parameters
/// - `thresh_low` - lower threshold, inclusive
pub struct Binarize;

impl Binarize {
    pub const KIND: &'static str = "binarize";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "ThresholdImage")
            .lit(&["3"])
            .input("in_file")
            .output("out_mask", "mask.nii.gz")
            .param("thresh_low")
            .lit(&["1e9", "1", "0"])
    }
}

impl DescribeOperation for Binarize {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "Binarize", "Threshold a map into a mask")
            .with_input(volume_in("in_file"))
            .with_output(PortSpec::optional("out_mask", ArtifactKind::LabelMap))
    }
}

register_command!(Binarize);

/// Zero everything outside a mask
pub struct ApplyMask;

impl ApplyMask {
    pub const KIND: &'static str = "apply-mask";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "ImageMath")
            .lit(&["3"])
            .output("out_file", "masked.nii.gz")
            .lit(&["m"])
            .input("in_file")
            .input("in_mask")
    }
}

impl DescribeOperation for ApplyMask {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "Apply Mask", "Mask an image")
            .with_input(volume_in("in_file"))
            .with_input(PortSpec::required("in_mask", ArtifactKind::LabelMap))
            .with_output(volume_out("out_file"))
    }
}

register_command!(ApplyMask);

/// Morphological dilation of a binary mask
///
/// # Parameters
/// - `radius` - dilation radius in voxels
pub struct BinaryDilation;

impl BinaryDilation {
    pub const KIND: &'static str = "binary-dilation";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "ImageMath")
            .lit(&["3"])
            .output("out_file", "dilated.nii.gz")
            .lit(&["MD"])
            .input("in_file")
            .param("radius")
    }

    /// Parameters equivalent to `iterations` passes of `radius`
    pub fn params(radius: u32, iterations: u32) -> Value {
        json!({ "radius": radius * iterations.max(1) })
    }
}

impl DescribeOperation for BinaryDilation {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "Binary Dilation", "Dilate a binary mask")
            .with_input(PortSpec::required("in_file", ArtifactKind::LabelMap))
            .with_output(PortSpec::optional("out_file", ArtifactKind::LabelMap))
    }
}

register_command!(BinaryDilation);

/// Rough brain mask, used only to assist registration
pub struct QuickBrainMask;

impl QuickBrainMask {
    pub const KIND: &'static str = "quick-brain-mask";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "mri_synthstrip")
            .lit(&["-i"])
            .input("in_file")
            .lit(&["-m"])
            .output("out_mask", "brain_mask.nii.gz")
    }
}

impl DescribeOperation for QuickBrainMask {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Quick Brain Mask",
            "Fast learning-based skull stripping",
        )
        .with_input(volume_in("in_file"))
        .with_output(PortSpec::optional("out_mask", ArtifactKind::LabelMap))
        .with_resources(ResourceHint::memory(2.0))
    }
}

register_command!(QuickBrainMask);

// --- Registration helpers -------------------------------------------------

/// How the affine initialisation searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AffineSearch {
    #[default]
    Regular,
    Random,
    Search,
}

/// Affine initialisation by exhaustive search (`antsAI`)
///
/// # Parameters
/// - `sampling` - metric sampling strategy
/// - `search_grid` - `[ step, ranges ]`
pub struct AntsAi;

impl AntsAi {
    pub const KIND: &'static str = "ants-ai";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "antsAI")
            .lit(&["-d", "3", "-m"])
            .format("Mattes[ {fixed_image}, {moving_image}, 32, {sampling}, 0.2 ]")
            .lit(&["-t", "Affine[ 0.1 ]", "-s", "[ 20, 0.12 ]", "-g"])
            .format("{search_grid}")
            .lit(&["-c", "[ 10, 1e-6, 10 ]", "-p", "0"])
            .opt_input("-x", "fixed_image_mask")
            .lit(&["-o"])
            .output("output_transform", "initialization.mat")
            .lit(&["-v", "1"])
    }

    pub fn params(search: AffineSearch) -> Value {
        let sampling = match search {
            AffineSearch::Random => "Random",
            AffineSearch::Regular | AffineSearch::Search => "Regular",
        };
        let grid = match search {
            AffineSearch::Search => "[ 20, 20x40x40 ]",
            AffineSearch::Regular | AffineSearch::Random => "[ 40, 0x40x40 ]",
        };
        json!({ "sampling": sampling, "search_grid": grid })
    }
}

impl DescribeOperation for AntsAi {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "ANTs AI", "Search for an initial affine alignment")
            .with_input(volume_in("fixed_image"))
            .with_input(volume_in("moving_image"))
            .with_input(PortSpec::optional("fixed_image_mask", ArtifactKind::LabelMap))
            .with_output(PortSpec::optional("output_transform", ArtifactKind::Transform))
    }
}

register_command!(AntsAi);

// --- Surface reconstruction inputs ----------------------------------------

/// Replace segmentation labels
///
/// # Parameters
/// - `mappings` - flat `[from, to, ...]` list, see `LabelMapping::to_param`
pub struct MapLabels;

impl MapLabels {
    pub const KIND: &'static str = "map-labels";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "c3d")
            .input("in_file")
            .lit(&["-replace"])
            .param("mappings")
            .lit(&["-o"])
            .output("out_file", "relabeled.nii.gz")
    }
}

impl DescribeOperation for MapLabels {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "Map Labels", "Translate segmentation labels")
            .with_input(PortSpec::required("in_file", ArtifactKind::LabelMap))
            .with_output(PortSpec::optional("out_file", ArtifactKind::LabelMap))
    }
}

register_command!(MapLabels);

/// Resample an image into a target axis orientation
///
/// # Parameters
/// - `target_orientation` - e.g. `LAS`
pub struct ReorientImage;

impl ReorientImage {
    pub const KIND: &'static str = "reorient-image";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "mri_convert")
            .opt_param("--out_orientation", "target_orientation")
            .input("in_file")
            .output("out_file", "reoriented.nii.gz")
    }
}

impl DescribeOperation for ReorientImage {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Reorient Image",
            "Change the axis orientation of an image",
        )
        .with_input(volume_in("in_file"))
        .with_output(volume_out("out_file"))
    }
}

register_command!(ReorientImage);

// --- Surface reconstruction -----------------------------------------------

/// Neonatal surface reconstruction from a T2w and a segmentation
pub struct McribsRecon;

impl McribsRecon {
    pub const KIND: &'static str = "mcribs-recon";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "MCRIBReconAll")
            .lit(&[
                "--surfrecon",
                "--surfreconmethod",
                "Deformable",
                "--deformablejointhresh",
                "1.0",
                "--deformablefastcollision",
            ])
            .opt_param("--nthreads", PARAM_NUM_THREADS)
            .opt_input("--t2w", "t2w_file")
            .opt_input("--segmentation", "segmentation_file")
            .opt_input("--mask", "mask_file")
            .opt_input("--subjects-dir", PORT_SUBJECTS_DIR)
            .lit(&["--outdir"])
            .output("mcribs_dir", "mcribs")
            .input(PORT_SUBJECT_ID)
    }
}

impl DescribeOperation for McribsRecon {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "M-CRIB-S Recon",
            "Neonatal cortical surface reconstruction",
        )
        .with_input(PortSpec::required(PORT_SUBJECTS_DIR, ArtifactKind::Any))
        .with_input(PortSpec::required(PORT_SUBJECT_ID, ArtifactKind::Value))
        .with_input(volume_in("t2w_file"))
        .with_input(PortSpec::required("segmentation_file", ArtifactKind::LabelMap))
        .with_input(PortSpec::optional("mask_file", ArtifactKind::LabelMap))
        .with_output(PortSpec::optional("mcribs_dir", ArtifactKind::Any))
        .with_resources(ResourceHint::memory(5.0))
    }
}

register_command!(McribsRecon);

/// FreeSurfer-compatible steps after M-CRIB-S surface reconstruction
pub struct McribsPostRecon;

impl McribsPostRecon {
    pub const KIND: &'static str = "mcribs-postrecon";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "MCRIBReconAll")
            .lit(&["--autoreconaftersurf"])
            .opt_param("--nthreads", PARAM_NUM_THREADS)
            .opt_input("--outdir", "outdir")
            .opt_input("--subjects-dir", PORT_SUBJECTS_DIR)
            .input(PORT_SUBJECT_ID)
            .passthrough(PORT_SUBJECTS_DIR, PORT_SUBJECTS_DIR)
            .passthrough(PORT_SUBJECT_ID, PORT_SUBJECT_ID)
    }
}

impl DescribeOperation for McribsPostRecon {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "M-CRIB-S Post-Recon", "Finish an M-CRIB-S subject")
            .with_input(PortSpec::required(PORT_SUBJECTS_DIR, ArtifactKind::Any))
            .with_input(PortSpec::required(PORT_SUBJECT_ID, ArtifactKind::Value))
            .with_input(PortSpec::required("outdir", ArtifactKind::Any))
            .with_output(PortSpec::optional(PORT_SUBJECTS_DIR, ArtifactKind::Any))
            .with_output(PortSpec::optional(PORT_SUBJECT_ID, ArtifactKind::Value))
            .with_resources(ResourceHint::memory(5.0))
    }
}

register_command!(McribsPostRecon);

/// Infant FreeSurfer reconstruction
///
/// # Parameters
/// - `age` - age in months
pub struct InfantReconAll;

impl InfantReconAll {
    pub const KIND: &'static str = "infant-recon-all";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "infant_recon_all")
            .lit(&["--s"])
            .input(PORT_SUBJECT_ID)
            .lit(&["--outdir"])
            .input("outdir")
            .opt_param("--age", "age")
            .opt_input("--masked", "mask_file")
            .opt_input("--segfile", "aseg_file")
            .passthrough(PORT_SUBJECT_ID, PORT_SUBJECT_ID)
            .passthrough("outdir", "outdir")
    }
}

impl DescribeOperation for InfantReconAll {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "Infant Recon-All", "Infant FreeSurfer reconstruction")
            .with_input(PortSpec::required(PORT_SUBJECT_ID, ArtifactKind::Value))
            .with_input(PortSpec::required("outdir", ArtifactKind::Any))
            .with_input(PortSpec::required("mask_file", ArtifactKind::Volume))
            .with_input(PortSpec::optional("aseg_file", ArtifactKind::LabelMap))
            .with_output(PortSpec::optional(PORT_SUBJECT_ID, ArtifactKind::Value))
            .with_output(PortSpec::optional("outdir", ArtifactKind::Any))
    }
}

register_command!(InfantReconAll);

/// Robust rigid registration between a reconstruction and an anatomical image
pub struct RobustRegister;

impl RobustRegister {
    pub const KIND: &'static str = "robust-register";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "mri_robust_register")
            .lit(&["--mov"])
            .input("source_file")
            .lit(&["--dst"])
            .input("target_file")
            .lit(&["--lta"])
            .output("out_reg_file", "fsnative2anat.lta")
            .lit(&["--satit", "--iscale"])
    }
}

impl DescribeOperation for RobustRegister {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Robust Register",
            "Symmetric robust rigid registration",
        )
        .with_input(volume_in("source_file"))
        .with_input(volume_in("target_file"))
        .with_output(PortSpec::optional("out_reg_file", ArtifactKind::Transform))
    }
}

register_command!(RobustRegister);

/// Invert an LTA transform
pub struct LtaConvert;

impl LtaConvert {
    pub const KIND: &'static str = "lta-convert";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "lta_convert")
            .lit(&["--inlta"])
            .input("in_lta")
            .lit(&["--outlta"])
            .output("out_lta", "inverted.lta")
            .lit(&["--invert"])
    }
}

impl DescribeOperation for LtaConvert {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(Self::KIND, "LTA Convert", "Invert a linear transform")
            .with_input(PortSpec::required("in_lta", ArtifactKind::Transform))
            .with_output(PortSpec::optional("out_lta", ArtifactKind::Transform))
    }
}

register_command!(LtaConvert);

/// Midthickness surface half way between white and graymid, per hemisphere
pub struct MakeMidthickness;

impl MakeMidthickness {
    pub const KIND: &'static str = "make-midthickness";

    pub fn command() -> CommandOperation {
        CommandOperation::new(Self::KIND, "mris_expand")
            .lit(&["-thickness"])
            .opt_input("-pial", "graymid")
            .input("in_file")
            .lit(&["0.5"])
            .output("out_file", "midthickness")
            .mapped(&["in_file", "graymid"])
    }
}

impl DescribeOperation for MakeMidthickness {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Make Midthickness",
            "Expand white surfaces half way to pial",
        )
        .with_input(PortSpec::required("in_file", ArtifactKind::Surface))
        .with_input(PortSpec::optional("graymid", ArtifactKind::Surface))
        .with_output(PortSpec::optional("out_file", ArtifactKind::Surface))
    }
}

register_command!(MakeMidthickness);

#[cfg(test)]
mod tests {
    use super::*;
    use regflow_engine::{Artifact, ArtifactMap};
    use std::path::Path;

    fn inputs(pairs: &[(&str, &str)]) -> ArtifactMap {
        pairs
            .iter()
            .map(|(port, path)| (port.to_string(), Artifact::path(*path)))
            .collect()
    }

    #[test]
    fn test_clip_renders_quantiles() {
        let line = IntensityClip::command()
            .command_line(
                &inputs(&[("in_file", "t2w.nii.gz")]),
                &IntensityClip::params(10.0, 99.5),
                Path::new("/w"),
            )
            .unwrap();
        assert_eq!(
            line,
            vec!["3", "/w/clipped.nii.gz", "TruncateImageIntensity", "t2w.nii.gz", "0.1", "0.995"]
        );
    }

    #[test]
    fn test_n4_weight_is_optional() {
        let params = json!({"bspline_fitting_distance": 200});
        let n4 = N4BiasCorrection::command();

        let plain = n4
            .command_line(&inputs(&[("input_image", "t1w.nii.gz")]), &params, Path::new("/w"))
            .unwrap()
            .join(" ");
        assert!(!plain.contains("-w"));
        assert!(plain.contains("-b [ 200 ]"));
        assert!(plain.ends_with("-o [ /w/corrected.nii.gz, /w/bias.nii.gz ]"));

        let weighted = n4
            .command_line(
                &inputs(&[("input_image", "t1w.nii.gz"), ("weight_image", "prob.nii.gz")]),
                &params,
                Path::new("/w"),
            )
            .unwrap()
            .join(" ");
        assert!(weighted.contains("-i t1w.nii.gz -w prob.nii.gz"));
    }

    #[test]
    fn test_laplacian_op2_expands() {
        let line = ImageMath::command()
            .command_line(
                &inputs(&[("op1", "t2w.nii.gz")]),
                &json!({"operation": "Laplacian", "op2": [0.4, 1]}),
                Path::new("/w"),
            )
            .unwrap();
        assert_eq!(line[2..], ["Laplacian", "t2w.nii.gz", "0.4", "1"]);
    }

    #[test]
    fn test_dilation_iterations_scale_radius() {
        assert_eq!(BinaryDilation::params(8, 3), json!({"radius": 24}));
        assert_eq!(BinaryDilation::params(3, 0), json!({"radius": 3}));
    }

    #[test]
    fn test_ants_ai_search_modes() {
        let line = AntsAi::command()
            .command_line(
                &inputs(&[("fixed_image", "tpl.nii.gz"), ("moving_image", "t2w.nii.gz")]),
                &AntsAi::params(AffineSearch::Random),
                Path::new("/w"),
            )
            .unwrap()
            .join(" ");
        assert!(line.contains("Mattes[ tpl.nii.gz, t2w.nii.gz, 32, Random, 0.2 ]"));
        assert!(line.contains("-g [ 40, 0x40x40 ]"));
        assert!(!line.contains("-x"));
        assert_eq!(AntsAi::params(AffineSearch::Search)["search_grid"], "[ 20, 20x40x40 ]");
    }

    #[test]
    fn test_descriptors_match_commands() {
        // Every input a command line reads is declared on the descriptor
        let descriptor = RobustRegister::descriptor();
        for port in ["source_file", "target_file"] {
            assert!(descriptor.inputs.iter().any(|p| p.name == port));
        }
        assert_eq!(
            McribsRecon::descriptor().default_resources,
            Some(ResourceHint::memory(5.0))
        );
    }
}
