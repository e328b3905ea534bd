//! Pipeline configuration
//!
//! Values every pipeline builder receives explicitly. Nothing here is read
//! from global state while a graph is being assembled.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use regflow_engine::ResourceHint;

/// Memory hint for lightweight steps (transform concatenation, lookups)
pub const DEFAULT_MEMORY_MIN_GB: f64 = 0.01;

/// Default timeout for a single external tool invocation
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 24 * 60 * 60;

/// Parameter key carrying the working directory of command steps
pub const PARAM_WORK_DIR: &str = "work_dir";
/// Parameter key carrying the command timeout
pub const PARAM_TIMEOUT_SECS: &str = "timeout_secs";
/// Parameter key carrying the thread count of multi-threaded tools
pub const PARAM_NUM_THREADS: &str = "num_threads";
/// Parameter key carrying the template store location
pub const PARAM_TEMPLATEFLOW_HOME: &str = "templateflow_home";

/// Settings shared by all pipeline builders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Base memory unit of the heavy steps, in gigabytes
    pub mem_gb: f64,
    /// Threads given to multi-threaded tools
    pub omp_nthreads: usize,
    /// Trade accuracy for speed (coarser templates, float precision)
    #[serde(default)]
    pub sloppy: bool,
    /// Distance in mm between B-spline control points for bias correction
    pub bspline_fitting_distance: u32,
    /// Where command steps write their outputs
    pub work_dir: PathBuf,
    /// Bundled data (template-to-template transforms)
    pub data_dir: PathBuf,
    /// Root of the template store
    pub templateflow_home: PathBuf,
    /// Per-invocation timeout of external tools
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mem_gb: 3.0,
            omp_nthreads: 1,
            sloppy: false,
            bspline_fitting_distance: 200,
            work_dir: std::env::temp_dir().join("regflow"),
            data_dir: PathBuf::from("data"),
            templateflow_home: PathBuf::from("templateflow"),
            command_timeout_secs: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_mem_gb(mut self, mem_gb: f64) -> Self {
        self.mem_gb = mem_gb;
        self
    }

    pub fn with_omp_nthreads(mut self, threads: usize) -> Self {
        self.omp_nthreads = threads.max(1);
        self
    }

    pub fn with_sloppy(mut self, sloppy: bool) -> Self {
        self.sloppy = sloppy;
        self
    }

    pub fn with_bspline_fitting_distance(mut self, distance: u32) -> Self {
        self.bspline_fitting_distance = distance;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    pub fn with_templateflow_home(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templateflow_home = dir.into();
        self
    }

    pub fn with_command_timeout_secs(mut self, secs: u64) -> Self {
        self.command_timeout_secs = Some(secs);
        self
    }

    /// Hint for a heavy multi-threaded step
    pub fn heavy(&self) -> ResourceHint {
        ResourceHint::new(self.mem_gb, self.omp_nthreads)
    }

    /// Hint for a multi-threaded step with the default memory footprint
    pub fn threaded(&self) -> ResourceHint {
        ResourceHint::new(1.0, self.omp_nthreads)
    }

    /// Parameters every step receives, merged with `extra`
    ///
    /// Keys in `extra` win over the shared ones.
    pub fn step_params(&self, extra: Value) -> Value {
        let mut params = Map::new();
        params.insert(
            PARAM_WORK_DIR.to_string(),
            json!(self.work_dir.display().to_string()),
        );
        params.insert(
            PARAM_TIMEOUT_SECS.to_string(),
            json!(self.command_timeout_secs.unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS)),
        );
        params.insert(PARAM_NUM_THREADS.to_string(), json!(self.omp_nthreads));
        params.insert(
            PARAM_TEMPLATEFLOW_HOME.to_string(),
            json!(self.templateflow_home.display().to_string()),
        );
        if let Value::Object(extra) = extra {
            params.extend(extra);
        }
        Value::Object(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.mem_gb, 3.0);
        assert_eq!(config.bspline_fitting_distance, 200);
        assert!(!config.sloppy);
        assert!(config.command_timeout_secs.is_none());
    }

    #[test]
    fn test_step_params_merge() {
        let config = PipelineConfig::default()
            .with_work_dir("/scratch")
            .with_omp_nthreads(4)
            .with_command_timeout_secs(60);
        let params = config.step_params(json!({"thresh_low": 0.8, "num_threads": 2}));

        assert_eq!(params[PARAM_WORK_DIR], json!("/scratch"));
        assert_eq!(params[PARAM_TIMEOUT_SECS], json!(60));
        assert_eq!(params["thresh_low"], json!(0.8));
        // Step-specific value wins
        assert_eq!(params[PARAM_NUM_THREADS], json!(2));
    }

    #[test]
    fn test_heavy_hint() {
        let config = PipelineConfig::default().with_mem_gb(5.0).with_omp_nthreads(0);
        assert_eq!(config.omp_nthreads, 1);
        assert_eq!(config.heavy(), ResourceHint::new(5.0, 1));
    }
}
