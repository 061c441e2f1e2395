use std::time::Duration;

/// Engine-level configuration shared by the front and back ends.
///
/// Controls operation deadlines and the concurrency bound of the worker pool.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Deadline given to a back operation whose first ticket carries no timeout.
    pub default_timeout: Duration,
    /// Upper bound applied to every requested or renegotiated timeout.
    pub maximum_timeout: Duration,
    /// Maximum number of pool tasks running at once. `None` means unbounded.
    pub max_concurrent_tasks: Option<usize>,
}

impl EngineConfig {
    /// Clamps a requested timeout to `maximum_timeout`.
    #[must_use]
    pub fn clamp_timeout(&self, requested: Duration) -> Duration {
        requested.min(self.maximum_timeout)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            maximum_timeout: Duration::from_secs(600),
            max_concurrent_tasks: None,
        }
    }
}
