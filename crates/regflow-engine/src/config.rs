//! Scheduler configuration

use serde::{Deserialize, Serialize};

use crate::error::{RegflowError, Result};

/// Default ceilings used when nothing else is configured
pub mod defaults {
    /// Memory ceiling in gigabytes
    pub const MAX_MEMORY_GB: f64 = 8.0;
    /// Thread ceiling
    pub const MAX_THREADS: usize = 4;
    /// Environment variable overriding the memory ceiling
    pub const ENV_MAX_MEMORY_GB: &str = "REGFLOW_MAX_MEMORY_GB";
    /// Environment variable overriding the thread ceiling
    pub const ENV_MAX_THREADS: &str = "REGFLOW_MAX_THREADS";
    /// Environment variable overriding the node concurrency limit
    pub const ENV_MAX_CONCURRENT_NODES: &str = "REGFLOW_MAX_CONCURRENT_NODES";
}

/// Resource ceilings for a scheduler run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Total memory the concurrently running nodes may claim
    pub max_memory_gb: f64,
    /// Total threads the concurrently running nodes may claim
    pub max_threads: usize,
    /// Optional cap on the number of nodes in flight, hinted or not
    #[serde(default)]
    pub max_concurrent_nodes: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_memory_gb: defaults::MAX_MEMORY_GB,
            max_threads: defaults::MAX_THREADS,
            max_concurrent_nodes: None,
        }
    }
}

impl SchedulerConfig {
    /// Create a config with the given ceilings
    pub fn new(max_memory_gb: f64, max_threads: usize) -> Self {
        Self {
            max_memory_gb,
            max_threads,
            max_concurrent_nodes: None,
        }
    }

    /// Defaults overridden by `REGFLOW_*` environment variables
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = parse_env::<f64>(defaults::ENV_MAX_MEMORY_GB) {
            config.max_memory_gb = v;
        }
        if let Some(v) = parse_env::<usize>(defaults::ENV_MAX_THREADS) {
            config.max_threads = v;
        }
        match parse_env::<usize>(defaults::ENV_MAX_CONCURRENT_NODES) {
            Some(0) => log::warn!(
                "Ignoring {}=0: at least one node must be able to run",
                defaults::ENV_MAX_CONCURRENT_NODES
            ),
            Some(v) => config.max_concurrent_nodes = Some(v),
            None => {}
        }
        config
    }

    /// Reject ceilings under which no node could ever start
    pub fn validate(&self) -> Result<()> {
        if !self.max_memory_gb.is_finite() || self.max_memory_gb < 0.0 {
            return Err(RegflowError::InvalidConfig(format!(
                "memory ceiling must be a non-negative number, got {}",
                self.max_memory_gb
            )));
        }
        if self.max_concurrent_nodes == Some(0) {
            return Err(RegflowError::InvalidConfig(
                "node concurrency cap must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the memory ceiling
    pub fn with_max_memory_gb(mut self, gb: f64) -> Self {
        self.max_memory_gb = gb;
        self
    }

    /// Set the thread ceiling
    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = threads;
        self
    }

    /// Cap the number of nodes in flight
    pub fn with_max_concurrent_nodes(mut self, nodes: usize) -> Self {
        self.max_concurrent_nodes = Some(nodes);
        self
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}
