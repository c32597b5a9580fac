//! Engine configuration loader.
//!
//! Reads `skein.toml` from a data directory and deserializes it into
//! [`EngineSettings`]. A missing file falls back to defaults; a malformed
//! one logs a warning and falls back too.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::workflow::executor::ExecutionConfig;

/// Tunable engine settings, usually loaded from `skein.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Default per-step timeout in seconds.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Checkpoint before every step.
    #[serde(default = "default_true")]
    pub checkpoint_each_step: bool,
    /// Halt the workflow on the first failed step.
    #[serde(default)]
    pub fail_fast: bool,
    /// Concurrency cap for parallel fan-out.
    #[serde(default = "default_parallel_limit")]
    pub parallel_limit: usize,
    /// Completed executions older than this many hours are reclaimable.
    #[serde(default = "default_cleanup_age_hours")]
    pub cleanup_age_hours: u64,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_parallel_limit() -> usize {
    10
}

fn default_cleanup_age_hours() -> u64 {
    24
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            checkpoint_each_step: true,
            fail_fast: false,
            parallel_limit: default_parallel_limit(),
            cleanup_age_hours: default_cleanup_age_hours(),
        }
    }
}

impl EngineSettings {
    /// Convert into the engine's runtime execution config.
    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            step_timeout: Some(Duration::from_secs(self.step_timeout_secs)),
            retry_policy: None,
            checkpoint_each_step: self.checkpoint_each_step,
            fail_fast: self.fail_fast,
            parallel_limit: self.parallel_limit,
        }
    }
}

/// Load settings from `{data_dir}/skein.toml`.
///
/// - Missing file: defaults.
/// - Unreadable or malformed file: warn and fall back to defaults.
pub async fn load_settings(data_dir: &Path) -> EngineSettings {
    let config_path = data_dir.join("skein.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(
                "no skein.toml at {}, using defaults",
                config_path.display()
            );
            return EngineSettings::default();
        }
        Err(err) => {
            tracing::warn!(
                "failed to read {}: {err}, using defaults",
                config_path.display()
            );
            return EngineSettings::default();
        }
    };

    match toml::from_str::<EngineSettings>(&content) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!(
                "failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            EngineSettings::default()
        }
    }
}
