//! Regflow Nodes
//!
//! Operations and pipeline builders for anatomical registration on top of
//! `regflow-engine`. Every operation registers itself at link time, so
//! `OperationRegistry::with_builtins()` sees the whole catalog.
//!
//! # Layout
//!
//! - **command**: external tools driven by a declarative argument template
//! - **catalog**: the command-line tools used by the pipelines
//! - **ops**: steps with in-process logic (templates, transforms, FreeSurfer
//!   subject directories, registration presets)
//! - **pipelines**: pure builders returning a validated `Graph`

pub mod catalog;
pub mod command;
pub mod config;
pub mod error;
pub mod ops;
pub mod pipelines;

pub use command::{ArgTemplate, CommandOperation, Product, ToolOutput};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use pipelines::*;

#[cfg(test)]
mod tests {
    use regflow_engine::OperationRegistry;

    #[test]
    fn test_inventory_collects_all_operations() {
        let registry = OperationRegistry::with_builtins();
        assert_eq!(registry.kinds().len(), 25, "Expected 25 built-in operations");

        // Spot-check one of each family
        assert!(registry.has_kind("ants-registration"));
        assert!(registry.has_kind("template-select"));
        assert!(registry.has_kind("concat-xfm"));
        assert!(registry.has_kind("freesurfer-source"));
        assert!(registry.has_kind("n4-bias-correction"));
        assert!(registry.has_kind("make-midthickness"));
        assert!(!registry.has_kind("merge"));
    }
}
