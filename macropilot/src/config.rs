use crate::errors::AutomationError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime tuning knobs. Loadable from a JSON file; every field has a
/// sensible default so an empty `{}` is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Directory holding durable session records.
    pub state_dir: PathBuf,
    /// Directory of reference template images (`<target>.png`).
    pub template_dir: PathBuf,
    /// JSON file mapping target names to DOM selectors.
    pub selector_file: PathBuf,
    /// Directory for the attempt log and captured region crops.
    pub learning_dir: PathBuf,
    /// Poll interval for wait-for-appear loops, in milliseconds.
    pub poll_interval_ms: u64,
    /// Default resolution timeout for wait-for-appear steps.
    pub default_timeout_ms: u64,
    /// Default confidence threshold for candidate matches.
    pub match_threshold: f64,
    /// Candidates within this pixel distance of a stronger one are dropped.
    pub dedup_radius_px: f64,
    /// A retrain cycle fires every time a target's attempt count crosses
    /// a multiple of this value.
    pub retrain_threshold: u64,
    /// Minimum fresh successful crops required to synthesize a template.
    pub min_fresh_successes: usize,
    /// Failure centroids with per-axis standard deviation under this are
    /// treated as a relocated target rather than an unstable one.
    pub drift_radius_px: f64,
    /// Sessions older than this are removed by the retention sweep.
    pub session_max_age_days: i64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(".macropilot/sessions"),
            template_dir: PathBuf::from(".macropilot/templates"),
            selector_file: PathBuf::from(".macropilot/selectors.json"),
            learning_dir: PathBuf::from(".macropilot/learning"),
            poll_interval_ms: 300,
            default_timeout_ms: 10_000,
            match_threshold: 0.8,
            dedup_radius_px: 10.0,
            retrain_threshold: 20,
            min_fresh_successes: 3,
            drift_radius_px: 25.0,
            session_max_age_days: 30,
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: &Path) -> Result<Self, AutomationError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}
