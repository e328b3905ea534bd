//! Error types for pipeline assembly

use thiserror::Error;

use regflow_engine::RegflowError;

/// Result type alias using PipelineError
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised while assembling a registration pipeline
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The engine rejected the graph
    #[error(transparent)]
    Graph(#[from] RegflowError),

    /// A template identifier could not be parsed
    #[error("Invalid template identifier '{0}'")]
    InvalidTemplate(String),

    /// A template needs a cohort and none was given
    #[error("A cohort must be provided for template '{0}'")]
    MissingCohort(String),

    /// The combination of flags is not supported by this pipeline
    #[error("Unsupported configuration: {0}")]
    Unsupported(String),
}
