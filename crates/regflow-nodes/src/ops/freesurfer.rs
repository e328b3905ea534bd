//! Small in-process steps around a FreeSurfer-style subjects directory
//!
//! Surface reconstruction tools write into `{subjects_dir}/{subject_id}`;
//! these steps locate files there, store derived surfaces next to them and
//! recover the directory fields from file names.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use regflow_engine::{
    require, Artifact, ArtifactKind, ArtifactMap, DescribeOperation, Operation, OperationContext,
    OperationDescriptor, OperationError, OperationResult, PortSpec,
};

pub const PORT_SUBJECTS_DIR: &str = "subjects_dir";
pub const PORT_SUBJECT_ID: &str = "subject_id";

const HEMISPHERES: [&str; 2] = ["lh", "rh"];

fn text_input(inputs: &ArtifactMap, port: &str) -> Result<String, OperationError> {
    require(inputs, port)?
        .to_arg()
        .ok_or_else(|| OperationError::InvalidInput {
            port: port.to_string(),
            expected: "a path or name".to_string(),
        })
}

fn path_list(inputs: &ArtifactMap, port: &str) -> Result<Vec<PathBuf>, OperationError> {
    require(inputs, port)?
        .to_list()
        .iter()
        .map(|item| {
            item.to_arg().map(PathBuf::from).ok_or_else(|| OperationError::InvalidInput {
                port: port.to_string(),
                expected: "a list of paths".to_string(),
            })
        })
        .collect()
}

/// Locate reconstruction outputs of one subject
pub struct FreeSurferSource;

impl FreeSurferSource {
    pub const KIND: &'static str = "freesurfer-source";

    /// Paths of the subject's files, per hemisphere where applicable
    pub fn locate(subjects_dir: &Path, subject_id: &str) -> ArtifactMap {
        let subject = subjects_dir.join(subject_id);
        let per_hemi = |name: &str| {
            Artifact::list(
                HEMISPHERES
                    .iter()
                    .map(|h| Artifact::path(subject.join("surf").join(format!("{h}.{name}")))),
            )
        };

        let mut outputs = ArtifactMap::new();
        outputs.insert("white".to_string(), per_hemi("white"));
        outputs.insert("graymid".to_string(), per_hemi("graymid"));
        outputs.insert("pial".to_string(), per_hemi("pial"));
        outputs.insert("T2".to_string(), Artifact::path(subject.join("mri").join("T2.mgz")));
        outputs.insert("norm".to_string(), Artifact::path(subject.join("mri").join("norm.mgz")));
        // NIfTI copy written next to the volume by the reconstruction
        outputs.insert(
            "norm_nii".to_string(),
            Artifact::path(subject.join("mri").join("norm.nii.gz")),
        );
        outputs
    }
}

impl DescribeOperation for FreeSurferSource {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "FreeSurfer Source",
            "Locate the files of a reconstructed subject",
        )
        .with_input(PortSpec::required(PORT_SUBJECTS_DIR, ArtifactKind::Any))
        .with_input(PortSpec::required(PORT_SUBJECT_ID, ArtifactKind::Value))
        .with_output(PortSpec::optional("white", ArtifactKind::Surface))
        .with_output(PortSpec::optional("graymid", ArtifactKind::Surface))
        .with_output(PortSpec::optional("pial", ArtifactKind::Surface))
        .with_output(PortSpec::optional("T2", ArtifactKind::Volume))
        .with_output(PortSpec::optional("norm", ArtifactKind::Volume))
        .with_output(PortSpec::optional("norm_nii", ArtifactKind::Volume))
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: FreeSurferSource::descriptor,
    factory: || Arc::new(FreeSurferSource),
});

#[async_trait]
impl Operation for FreeSurferSource {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, _ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let subjects_dir = text_input(&inputs, PORT_SUBJECTS_DIR)?;
        let subject_id = text_input(&inputs, PORT_SUBJECT_ID)?;
        Ok(Self::locate(Path::new(&subjects_dir), &subject_id))
    }
}

/// Copy derived surfaces into the `surf/` directory they belong to
///
/// `in_files[i]` is stored next to `reference[i]` as `{hemi}.{suffix}`,
/// where `hemi` is the reference file's prefix (`lh.white` -> `lh`).
pub struct SaveSurfaces;

impl SaveSurfaces {
    pub const KIND: &'static str = "save-surfaces";
}

impl DescribeOperation for SaveSurfaces {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Save Surfaces",
            "Store derived surfaces in the subject's surface directory",
        )
        .with_input(PortSpec::required("in_files", ArtifactKind::Surface))
        .with_input(PortSpec::required("reference", ArtifactKind::Surface))
        .with_output(PortSpec::optional("out_file", ArtifactKind::Surface))
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: SaveSurfaces::descriptor,
    factory: || Arc::new(SaveSurfaces),
});

#[async_trait]
impl Operation for SaveSurfaces {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let sources = path_list(&inputs, "in_files")?;
        let references = path_list(&inputs, "reference")?;
        if sources.len() != references.len() {
            return Err(OperationError::ArityMismatch {
                context: "surfaces to save".to_string(),
                expected: references.len(),
                actual: sources.len(),
            });
        }
        let suffix = ctx
            .param("suffix")
            .and_then(Value::as_str)
            .unwrap_or("midthickness");

        let mut saved = Vec::with_capacity(sources.len());
        for (source, reference) in sources.iter().zip(&references) {
            let hemi = reference
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.split('.').next())
                .ok_or_else(|| OperationError::InvalidInput {
                    port: "reference".to_string(),
                    expected: "surface files named `{hemi}.{surface}`".to_string(),
                })?;
            let dir = reference.parent().unwrap_or_else(|| Path::new("."));
            let target = dir.join(format!("{hemi}.{suffix}"));

            tokio::fs::copy(source, &target).await.map_err(|e| {
                OperationError::failed(format!(
                    "Failed to copy '{}' to '{}': {}",
                    source.display(),
                    target.display(),
                    e
                ))
            })?;
            log::debug!("Node '{}': saved {}", ctx.node_id(), target.display());
            saved.push(Artifact::path(target));
        }

        let mut outputs = ArtifactMap::new();
        outputs.insert("out_file".to_string(), Artifact::List(saved));
        Ok(outputs)
    }
}

/// Recover `subjects_dir` and `subject_id` from files under `{subject}/surf/`
pub struct SubjectFields;

impl SubjectFields {
    pub const KIND: &'static str = "extract-fs-fields";

    pub fn extract(paths: &[PathBuf]) -> Result<(PathBuf, String), OperationError> {
        let invalid = || OperationError::InvalidInput {
            port: "filenames".to_string(),
            expected: "files inside one subject directory".to_string(),
        };

        let subject_dir = paths
            .first()
            .and_then(|p| p.parent())
            .and_then(Path::parent)
            .ok_or_else(invalid)?;
        if paths
            .iter()
            .any(|p| p.parent().and_then(Path::parent) != Some(subject_dir))
        {
            return Err(invalid());
        }

        let subject_id = subject_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(invalid)?;
        let subjects_dir = subject_dir.parent().ok_or_else(invalid)?;
        Ok((subjects_dir.to_path_buf(), subject_id.to_string()))
    }
}

impl DescribeOperation for SubjectFields {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Subject Fields",
            "Derive the subjects directory and subject id from file names",
        )
        .with_input(PortSpec::required("filenames", ArtifactKind::Any))
        .with_output(PortSpec::optional(PORT_SUBJECTS_DIR, ArtifactKind::Any))
        .with_output(PortSpec::optional(PORT_SUBJECT_ID, ArtifactKind::Value))
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: SubjectFields::descriptor,
    factory: || Arc::new(SubjectFields),
});

#[async_trait]
impl Operation for SubjectFields {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, _ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let (subjects_dir, subject_id) = Self::extract(&path_list(&inputs, "filenames")?)?;
        let mut outputs = ArtifactMap::new();
        outputs.insert(PORT_SUBJECTS_DIR.to_string(), Artifact::path(subjects_dir));
        outputs.insert(PORT_SUBJECT_ID.to_string(), Artifact::text(subject_id));
        Ok(outputs)
    }
}

/// `{subjects_dir}/{subject_id}`, the output directory of a reconstruction
pub struct ReconOutdir;

impl ReconOutdir {
    pub const KIND: &'static str = "recon-outdir";
}

impl DescribeOperation for ReconOutdir {
    fn descriptor() -> OperationDescriptor {
        OperationDescriptor::new(
            Self::KIND,
            "Reconstruction Directory",
            "Join the subjects directory and subject id",
        )
        .with_input(PortSpec::required(PORT_SUBJECTS_DIR, ArtifactKind::Any))
        .with_input(PortSpec::required(PORT_SUBJECT_ID, ArtifactKind::Value))
        .with_output(PortSpec::optional("out", ArtifactKind::Any))
    }
}

inventory::submit!(regflow_engine::OperationFn {
    descriptor: ReconOutdir::descriptor,
    factory: || Arc::new(ReconOutdir),
});

#[async_trait]
impl Operation for ReconOutdir {
    fn kind(&self) -> &str {
        Self::KIND
    }

    async fn execute(&self, _ctx: &OperationContext, inputs: ArtifactMap) -> OperationResult {
        let subjects_dir = text_input(&inputs, PORT_SUBJECTS_DIR)?;
        let subject_id = text_input(&inputs, PORT_SUBJECT_ID)?;
        let mut outputs = ArtifactMap::new();
        outputs.insert(
            "out".to_string(),
            Artifact::path(Path::new(&subjects_dir).join(subject_id)),
        );
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_locate() {
        let files = FreeSurferSource::locate(Path::new("/subjects"), "sub-01");
        assert_eq!(
            files["white"],
            Artifact::list([
                Artifact::path("/subjects/sub-01/surf/lh.white"),
                Artifact::path("/subjects/sub-01/surf/rh.white"),
            ])
        );
        assert_eq!(files["T2"], Artifact::path("/subjects/sub-01/mri/T2.mgz"));
    }

    #[test]
    fn test_extract_fields() {
        let paths = vec![
            PathBuf::from("/subjects/sub-01/surf/lh.midthickness"),
            PathBuf::from("/subjects/sub-01/surf/rh.midthickness"),
        ];
        let (subjects_dir, subject_id) = SubjectFields::extract(&paths).unwrap();
        assert_eq!(subjects_dir, PathBuf::from("/subjects"));
        assert_eq!(subject_id, "sub-01");

        let mixed = vec![
            PathBuf::from("/subjects/sub-01/surf/lh.midthickness"),
            PathBuf::from("/subjects/sub-02/surf/rh.midthickness"),
        ];
        assert!(SubjectFields::extract(&mixed).is_err());
    }

    #[tokio::test]
    async fn test_save_next_to_reference() {
        let root = tempfile::tempdir().unwrap();
        let surf = root.path().join("sub-01").join("surf");
        std::fs::create_dir_all(&surf).unwrap();
        let produced = root.path().join("lh_mid");
        std::fs::write(&produced, b"mesh").unwrap();

        let mut inputs = ArtifactMap::new();
        inputs.insert("in_files".to_string(), Artifact::list([Artifact::path(&produced)]));
        inputs.insert(
            "reference".to_string(),
            Artifact::list([Artifact::path(surf.join("lh.white"))]),
        );

        let ctx = OperationContext::detached("save_midthickness", json!({}));
        let outputs = SaveSurfaces.execute(&ctx, inputs).await.unwrap();
        assert_eq!(
            outputs["out_file"],
            Artifact::list([Artifact::path(surf.join("lh.midthickness"))])
        );
        assert_eq!(std::fs::read(surf.join("lh.midthickness")).unwrap(), b"mesh");
    }

    #[tokio::test]
    async fn test_recon_outdir() {
        let mut inputs = ArtifactMap::new();
        inputs.insert("subjects_dir".to_string(), Artifact::path("/subjects"));
        inputs.insert("subject_id".to_string(), Artifact::text("sub-01"));
        let ctx = OperationContext::detached("gen_recon_outdir", json!({}));
        let outputs = ReconOutdir.execute(&ctx, inputs).await.unwrap();
        assert_eq!(outputs["out"], Artifact::path("/subjects/sub-01"));
    }
}
