//! Operations with logic beyond a fixed command line

pub mod apply_transforms;
pub mod concat_xfm;
pub mod freesurfer;
pub mod labels;
pub mod registration;
pub mod templates;

pub use apply_transforms::ApplyTransforms;
pub use concat_xfm::ConcatXfm;
pub use freesurfer::{FreeSurferSource, ReconOutdir, SaveSurfaces, SubjectFields};
pub use labels::LabelMapping;
pub use registration::AntsRegistration;
pub use templates::{intermediate_xfms, TemplateFiles, TemplateId, TemplateQuery, TemplateSelect};
