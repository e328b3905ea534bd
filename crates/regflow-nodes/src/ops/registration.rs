//! Image registration with `antsRegistration`
//!
//! Stage settings come from named presets. Several fixed/moving pairs give a
//! multi-metric registration (e.g. intensity + Laplacian channels). Output
//! transforms are collapsed into one affine and, when a SyN stage is present,
//! one warp field:
//!
//! - forward (moving -> fixed): `[ 1Warp, 0GenericAffine ]`
//! - reverse (fixed -> moving): `[ 0GenericAffine, 1InverseWarp ]`, with the
//!   affine inverted

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use regflow_engine::{
    require, Artifact, ArtifactKind, ArtifactMap, DescribeOperation, Operation, OperationContext,
    OperationDescriptor, OperationError, OperationResult, PortSpec,
};

use crate::command::{run_tool, step_dir, timeout_of};

pub const PROGRAM: &str = "antsRegistration";

const PREFIX: &str = "reg_";

/// One registration stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Stage {
    pub transform: &'static str,
    pub metric: &'static str,
    pub metric_params: &'static str,
    pub convergence: &'static str,
    pub shrink_factors: &'static str,
    pub smoothing_sigmas: &'static str,
}

impl Stage {
    pub fn is_deformable(&self) -> bool {
        self.transform.starts_with("SyN")
    }
}

/// Stage settings by preset name
pub fn preset(name: &str) -> Option<&'static [Stage]> {
    const PRECISE: &[Stage] = &[
        Stage {
            transform: "Rigid[ 0.1 ]",
            metric: "MI",
            metric_params: "1, 32, Regular, 0.25",
            convergence: "[ 1000x500x250x100, 1e-7, 10 ]",
            shrink_factors: "8x4x2x1",
            smoothing_sigmas: "4x2x1x0vox",
        },
        Stage {
            transform: "Affine[ 0.1 ]",
            metric: "MI",
            metric_params: "1, 32, Regular, 0.25",
            convergence: "[ 1000x500x250x100, 1e-7, 10 ]",
            shrink_factors: "8x4x2x1",
            smoothing_sigmas: "4x2x1x0vox",
        },
        Stage {
            transform: "SyN[ 0.1, 3, 0 ]",
            metric: "CC",
            metric_params: "0.5, 4, None, 1",
            convergence: "[ 100x70x50x20, 1e-9, 15 ]",
            shrink_factors: "8x4x2x1",
            smoothing_sigmas: "3x2x1x0vox",
        },
    ];
    const TESTING: &[Stage] = &[
        Stage {
            transform: "Rigid[ 0.1 ]",
            metric: "MI",
            metric_params: "1, 32, Regular, 0.25",
            convergence: "[ 500x250, 1e-6, 10 ]",
            shrink_factors: "4x2",
            smoothing_sigmas: "2x1vox",
        },
        Stage {
            transform: "Affine[ 0.1 ]",
            metric: "MI",
            metric_params: "1, 32, Regular, 0.25",
            convergence: "[ 500x250, 1e-6, 10 ]",
            shrink_factors: "4x2",
            smoothing_sigmas: "2x1vox",
        },
        Stage {
            transform: "SyN[ 0.2, 3, 0 ]",
            metric: "CC",
            metric_params: "0.5, 4, None, 1",
            convergence: "[ 20x10, 1e-6, 10 ]",
            shrink_factors: "4x2",
            smoothing_sigmas: "2x1vox",
        },
    ];
    const WITHIN_SUBJECT: &[Stage] = &[
        Stage {
            transform: "Rigid[ 0.1 ]",
            metric: "MI",
            metric_params: "1, 32, Regular, 0.25",
            convergence: "[ 1000x500x250, 1e-6, 10 ]",
            shrink_factors: "4x2x1",
            smoothing_sigmas: "2x1x0vox",
        },
        Stage {
            transform: "Affine[ 0.1 ]",
            metric: "MI",
            metric_params: "1, 32, Regular, 0.25",
            convergence: "[ 500x250, 1e-6, 10 ]",
            shrink_factors: "2x1",
            smoothing_sigmas: "1x0vox",
        },
        Stage {
            transform: "SyN[ 0.1, 3, 0 ]",
            metric: "CC",
            metric_params: "1, 4, None, 1",
            convergence: "[ 50x20, 1e-6, 10 ]",
            shrink_factors: "2x1",
            smoothing_sigmas: "1x0vox",
        },
    ];

    match name {
        "precise" => Some(PRECISE),
        "testing" => Some(TESTING),
        "within_subject" => Some(WITHIN_SUBJECT),
        _ => None,
    }
}

/// Multi-stage registration of moving image(s) onto fixed image(s)
///
/// # Parameters
/// - `preset` - stage settings (`precise`, `testing`, `within_subject`)
/// - `float` - compute in single precision
/// - `debug` - write intermediate volumes
pub struct AntsRegistration;

impl AntsRegistration {
    pub const KIND: &'static str = "ants-registration";

    pub const PORT_FIXED: &'static str = "fixed_image";
    pub const PORT_MOVING: &'static str = "moving_image";
    pub const PORT_FIXED_MASKS: &'static str = "fixed_image_masks";
    pub const PORT_INITIAL: &'static str = "initial_moving_transform";

    pub const PORT_FORWARD: &'static str = "forward_transforms";
    pub const PORT_FORWARD_FLAGS: &'static str = "forward_invert_flags";
    pub const PORT_REVERSE: &'static str = "reverse_transforms";
    pub const PORT_REVERSE_FLAGS: &'static str = "reverse_invert_flags";

    /// Full argument list for one registration
    pub fn arguments(
        stages: &[Stage],
        inputs: &ArtifactMap,
        params: &Value,
        prefix: &Path,
    ) -> Result<Vec<String>, OperationError> {
        let fixed = args_of(inputs, Self::PORT_FIXED)?;
        let moving = args_of(inputs, Self::PORT_MOVING)?;
        if fixed.len() != moving.len() {
            return Err(OperationError::ArityMismatch {
                context: "fixed/moving image pairs".to_string(),
                expected: fixed.len(),
                actual: moving.len(),
            });
        }
        let masks = match inputs.get(Self::PORT_FIXED_MASKS) {
            Some(_) => args_of(inputs, Self::PORT_FIXED_MASKS)?,
            None => Vec::new(),
        };
        let flag = |key: &str| params.get(key).and_then(Value::as_bool).unwrap_or(false);

        let mut args: Vec<String> = vec![
            "--dimensionality".into(),
            "3".into(),
            "--float".into(),
            if flag("float") { "1" } else { "0" }.into(),
            "--collapse-output-transforms".into(),
            "1".into(),
            "--output".into(),
            prefix.display().to_string(),
            "--interpolation".into(),
            "Linear".into(),
            "--winsorize-image-intensities".into(),
            "[ 0.005, 0.995 ]".into(),
            "--initial-moving-transform".into(),
        ];
        match inputs.get(Self::PORT_INITIAL).and_then(Artifact::to_arg) {
            Some(initial) => args.push(initial),
            None => args.push(format!("[ {}, {}, 1 ]", fixed[0], moving[0])),
        }
        if flag("debug") {
            args.extend(["--write-interval-volumes".into(), "5".into()]);
        }
        // One mask for every stage, or a single one up front
        let per_stage_masks = masks.len() == stages.len();
        if !per_stage_masks {
            if let Some(mask) = masks.first() {
                args.extend(["--masks".into(), format!("[ {mask}, NULL ]")]);
            }
        }

        for (i, stage) in stages.iter().enumerate() {
            args.extend(["--transform".into(), stage.transform.into()]);
            for (f, m) in fixed.iter().zip(&moving) {
                args.push("--metric".into());
                args.push(format!("{}[ {}, {}, {} ]", stage.metric, f, m, stage.metric_params));
            }
            args.extend([
                "--convergence".into(),
                stage.convergence.into(),
                "--shrink-factors".into(),
                stage.shrink_factors.into(),
                "--smoothing-sigmas".into(),
                stage.smoothing_sigmas.into(),
            ]);
            if per_stage_masks {
                args.extend(["--masks".into(), format!("[ {}, NULL ]", masks[i])]);
            }
        }
        Ok(args)
    }

    /// Output artifacts for the given stages
    pub fn products(stages: &[Stage], dir: &Path) -> ArtifactMap {
        let file = |name: &str| Artifact::path(dir.join(format!("{PREFIX}{name}")));
        let flags = |values: &[bool]| Artifact::list(values.iter().copied().map(Artifact::flag));

        let mut outputs = ArtifactMap::new();
        if stages.iter().any(Stage::is_deformable) {
            outputs.insert(
                Self::PORT_FORWARD.to_string(),
                Artifact::list([file("1Warp.nii.gz"), file("0GenericAffine.mat")]),
            );
            outputs.insert(Self::PORT_FORWARD_FLAGS.to_string(), flags(&[false, false]));
            outputs.insert(
                Self::PORT_REVERSE.to_string(),
                Artifact::list([file("0GenericAffine.mat"), file("1InverseWarp.nii.gz")]),
            );
            outputs.insert(Self::PORT_REVERSE_FLAGS.to_string(), flags(&[true, false]));
        } else {
            outputs.insert(
                Self::PORT_FORWARD.to_string(),
                Artifact::list([file("0GenericAffine.mat")]),
            );
            outputs.insert(Self::PORT_FORWARD_FLAGS.to_string(), flags(&[false]));
            outputs.insert(
                Self::PORT_REVERSE.to_string(),
                Artifact::list([file("0GenericAffine.mat")]),
            );
            outputs.insert(Self::PORT_REVERSE_FLAGS.to_string(), flags(&[true]));
        }
        outputs
    }
}

fn args_of(inputs: &ArtifactMap, port: &str) -> Result<Vec<String>, OperationError> {
    require(inputs, port)?
        .to_list()
        .iter()
        .map(|item| {
            item.to_arg().ok_or_else(|| OperationError::InvalidInput {
                port: port.to_string(),
                expected: "image paths".to_string(),
            })
        })
        .collect()
}

impl DescribeOperation for AntsRegistration {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "ANTs Registration",
            "Multi-stage rigid/affine/SyN registration",
        )
        .with_input(PortSpec::required(Self::PORT_FIXED, ArtifactKind::Volume))
        .with_input(PortSpec::required(Self::PORT_MOVING, ArtifactKind::Volume))
        .with_input(PortSpec::optional(Self::PORT_FIXED_MASKS, ArtifactKind::LabelMap))
        .with_input(PortSpec::optional(Self::PORT_INITIAL, ArtifactKind::Transform))
        .with_output(PortSpec::optional(Self::PORT_FORWARD, ArtifactKind::Transform))
        .with_output(PortSpec::optional(Self::PORT_FORWARD_FLAGS, ArtifactKind::Value))
        .with_output(PortSpec::optional(Self::PORT_REVERSE, ArtifactKind::Transform))
        .with_output(PortSpec::optional(Self::PORT_REVERSE_FLAGS, ArtifactKind::Value))
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: AntsRegistration::descriptor,
    factory: || Arc::new(AntsRegistration),
});

#[async_trait]
impl Operation for AntsRegistration {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let name = ctx.param("preset").and_then(Value::as_str).unwrap_or("precise");
        let stages = preset(name).ok_or_else(|| OperationError::InvalidInput {
            port: "preset".to_string(),
            expected: "precise, testing or within_subject".to_string(),
        })?;

        let dir = step_dir(ctx);
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            OperationError::failed(format!("Failed to create '{}': {}", dir.display(), e))
        })?;

        let args = Self::arguments(stages, &inputs, ctx.params(), &dir.join(PREFIX))?;
        log::debug!(
            "Node '{}': {} stages, preset '{}'",
            ctx.node_id(),
            stages.len(),
            name
        );
        run_tool(PROGRAM, &args, &dir, timeout_of(ctx)).await?;

        let outputs = Self::products(stages, &dir);
        for path in outputs.values().flat_map(Artifact::to_list) {
            if let Some(path) = path.as_path() {
                if !tokio::fs::try_exists(path).await.unwrap_or(false) {
                    return Err(OperationError::failed(format!(
                        "Expected output '{}' was not written",
                        path.display()
                    )));
                }
            }
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs(fixed: Vec<&str>, moving: Vec<&str>) -> ArtifactMap {
        let mut inputs = ArtifactMap::new();
        inputs.insert(
            "fixed_image".to_string(),
            Artifact::list(fixed.into_iter().map(Artifact::path)),
        );
        inputs.insert(
            "moving_image".to_string(),
            Artifact::list(moving.into_iter().map(Artifact::path)),
        );
        inputs
    }

    #[test]
    fn test_multi_metric_stages() {
        let stages = preset("testing").unwrap();
        let inputs = inputs(
            vec!["tpl.nii.gz", "tpl_lap.nii.gz"],
            vec!["t2w.nii.gz", "t2w_lap.nii.gz"],
        );
        let params = json!({"float": true});
        let args =
            AntsRegistration::arguments(stages, &inputs, &params, Path::new("/w/reg_")).unwrap();

        let metrics = args.iter().filter(|a| *a == "--metric").count();
        assert_eq!(metrics, stages.len() * 2);
        let line = args.join(" ");
        assert!(line.contains("--float 1"));
        assert!(line.contains("--initial-moving-transform [ tpl.nii.gz, t2w.nii.gz, 1 ]"));
        assert!(line.contains("CC[ tpl_lap.nii.gz, t2w_lap.nii.gz, 0.5, 4, None, 1 ]"));
    }

    #[test]
    fn test_per_stage_masks() {
        let stages = preset("within_subject").unwrap();
        let mut inputs = inputs(vec!["t2w.nii.gz"], vec!["t1w.nii.gz"]);
        inputs.insert(
            "fixed_image_masks".to_string(),
            Artifact::list([
                Artifact::path("dil8x3.nii.gz"),
                Artifact::path("dil8x3.nii.gz"),
                Artifact::path("dil8.nii.gz"),
            ]),
        );
        let args =
            AntsRegistration::arguments(stages, &inputs, &json!({}), Path::new("reg_")).unwrap();
        let masks: Vec<_> = args
            .windows(2)
            .filter(|w| w[0] == "--masks")
            .map(|w| w[1].clone())
            .collect();
        assert_eq!(masks.len(), 3);
        assert_eq!(masks[2], "[ dil8.nii.gz, NULL ]");
    }

    #[test]
    fn test_pair_mismatch() {
        let inputs = inputs(vec!["a", "b"], vec!["c"]);
        let stages = preset("precise").unwrap();
        let err =
            AntsRegistration::arguments(stages, &inputs, &json!({}), Path::new("p")).unwrap_err();
        assert!(matches!(err, OperationError::ArityMismatch { .. }));
    }

    #[test]
    fn test_reverse_transforms_invert_affine() {
        let outputs = AntsRegistration::products(preset("precise").unwrap(), Path::new("/w"));
        assert_eq!(
            outputs["reverse_transforms"],
            Artifact::list([
                Artifact::path("/w/reg_0GenericAffine.mat"),
                Artifact::path("/w/reg_1InverseWarp.nii.gz"),
            ])
        );
        assert_eq!(
            outputs["reverse_invert_flags"],
            Artifact::list([Artifact::flag(true), Artifact::flag(false)])
        );
        assert!(preset("unknown").is_none());
    }
}
