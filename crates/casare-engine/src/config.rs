//! Engine configuration

use std::time::Duration;

/// Tunable limits for one engine instance.
///
/// Every run started through the engine inherits these unless a run-level
/// override is supplied.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing nodes per run.
    /// Defaults to `min(8, logical CPUs)`; lowered to the browser pool
    /// size for workflows that use browser resources.
    pub max_parallel: usize,
    /// Iteration cap for loops without an intrinsic bound
    pub max_iterations: u64,
    /// Nesting bound for sub-workflow calls
    pub max_subworkflow_depth: usize,
    /// Per-node execution timeout
    pub node_timeout: Duration,
    /// Timeout for acquiring a pooled resource
    pub acquire_timeout: Duration,
    /// Event bus queue capacity per run
    pub event_capacity: usize,
    /// Workers available for CPU-bound offloading
    pub blocking_workers: usize,
    /// Maximum concurrent resource handles per run (quota); `None` = unbounded
    pub resource_quota: Option<usize>,
    /// Fail immediately with `ResourceExhausted` instead of waiting when the
    /// quota is spent
    pub quota_fail_fast: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(8);
        Self {
            max_parallel: cpus.min(8),
            max_iterations: 1000,
            max_subworkflow_depth: 8,
            node_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
            event_capacity: 256,
            blocking_workers: 4,
            resource_quota: None,
            quota_fail_fast: false,
        }
    }
}

impl EngineConfig {
    /// Set the parallelism bound
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// Set the loop iteration cap
    pub fn with_max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the sub-workflow depth bound
    pub fn with_max_subworkflow_depth(mut self, depth: usize) -> Self {
        self.max_subworkflow_depth = depth;
        self
    }

    /// Set the per-node timeout
    pub fn with_node_timeout(mut self, timeout: Duration) -> Self {
        self.node_timeout = timeout;
        self
    }

    /// Set the per-run resource quota
    pub fn with_resource_quota(mut self, quota: usize) -> Self {
        self.resource_quota = Some(quota);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.max_parallel >= 1 && config.max_parallel <= 8);
        assert_eq!(config.max_iterations, 1000);
        assert_eq!(config.max_subworkflow_depth, 8);
    }

    #[test]
    fn test_builder_clamps_parallelism() {
        let config = EngineConfig::default().with_max_parallel(0);
        assert_eq!(config.max_parallel, 1);
    }
}
