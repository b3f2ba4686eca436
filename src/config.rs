use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::storage::record::FormatVersion;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StrataConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub learning: LearningConfig,
    pub safety: SafetyConfig,
    pub stream: StreamConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: String,
}

/// Parameters of the reward/gradient/update pipeline.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LearningConfig {
    pub learning_rate: f64,
    pub regularization: f64,
    pub fisher_decay: f64,
    pub default_fisher: f64,
    pub default_success_rate: f64,
    pub pattern_quality_threshold: f64,
    pub auto_save_interval_secs: u64,
    /// When set, the per-route success rate is an exponential moving average
    /// with this decay instead of a plain running mean.
    pub success_rate_decay: Option<f64>,
}

/// Drift thresholds, checkpoint retention and rollback rate limiting.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SafetyConfig {
    pub drift_alert_threshold: f64,
    pub drift_reject_threshold: f64,
    pub auto_rollback: bool,
    pub max_checkpoints: usize,
    pub max_rollbacks_per_window: usize,
    pub rollback_window_secs: u64,
    pub checkpoint_on_start: bool,
}

/// Trajectory stream: memory window, batching, on-disk format and backpressure.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StreamConfig {
    pub memory_window_size: usize,
    pub batch_write_size: usize,
    pub flush_interval_ms: u64,
    pub max_records_per_file: u32,
    pub format_version: u8,
    pub compression: bool,
    pub max_concurrent_queries: usize,
    pub max_query_queue: usize,
    pub memory_pressure_ratio: f64,
    pub memory_budget_mb: Option<u64>,
    pub max_prune_per_call: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_strata_dir().to_string_lossy().into_owned(),
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            regularization: 0.1,
            fisher_decay: 0.9,
            default_fisher: 0.1,
            default_success_rate: 0.5,
            pattern_quality_threshold: 0.8,
            auto_save_interval_secs: 5,
            success_rate_decay: None,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            drift_alert_threshold: 0.3,
            drift_reject_threshold: 0.5,
            auto_rollback: true,
            max_checkpoints: 10,
            max_rollbacks_per_window: 3,
            rollback_window_secs: 300,
            checkpoint_on_start: true,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            memory_window_size: 1000,
            batch_write_size: 10,
            flush_interval_ms: 5000,
            max_records_per_file: 10_000,
            format_version: 2,
            compression: true,
            max_concurrent_queries: 10,
            max_query_queue: 100,
            memory_pressure_ratio: 0.85,
            memory_budget_mb: None,
            max_prune_per_call: 1000,
        }
    }
}

impl LearningConfig {
    pub fn auto_save_interval(&self) -> Duration {
        Duration::from_secs(self.auto_save_interval_secs)
    }
}

impl SafetyConfig {
    pub fn rollback_window(&self) -> Duration {
        Duration::from_secs(self.rollback_window_secs)
    }
}

impl StreamConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// The configured write format, falling back to the newest format for unknown values.
    pub fn write_format(&self) -> FormatVersion {
        FormatVersion::try_from(self.format_version).unwrap_or(FormatVersion::LATEST)
    }
}

/// Returns `~/.strata/`
pub fn default_strata_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".strata")
}

/// Returns the default config file path: `~/.strata/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strata_dir().join("config.toml")
}

impl StrataConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrataConfig::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// A config rooted at `dir`, everything else default. Used by tests and embedders.
    pub fn with_data_dir(dir: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = dir.as_ref().to_string_lossy().into_owned();
        config
    }

    /// Apply environment variable overrides
    /// (STRATA_DIR, STRATA_LOG_LEVEL, STRATA_LEARNING_RATE, STRATA_FORMAT_VERSION).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("STRATA_LEARNING_RATE") {
            match val.parse::<f64>() {
                Ok(rate) => self.learning.learning_rate = rate,
                Err(_) => tracing::warn!(value = %val, "ignoring unparsable STRATA_LEARNING_RATE"),
            }
        }
        if let Ok(val) = std::env::var("STRATA_FORMAT_VERSION") {
            match val.parse::<u8>() {
                Ok(version) => self.stream.format_version = version,
                Err(_) => tracing::warn!(value = %val, "ignoring unparsable STRATA_FORMAT_VERSION"),
            }
        }
    }

    /// Resolve the data directory, expanding `~` if needed.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn weights_path(&self) -> PathBuf {
        self.resolved_data_dir().join("weights.bin")
    }

    pub fn patterns_path(&self) -> PathBuf {
        self.resolved_data_dir().join("patterns.json")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("checkpoints")
    }

    pub fn trajectories_dir(&self) -> PathBuf {
        self.resolved_data_dir().join("trajectories")
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StrataConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.learning.learning_rate, 0.01);
        assert_eq!(config.learning.regularization, 0.1);
        assert_eq!(config.learning.fisher_decay, 0.9);
        assert_eq!(config.safety.max_checkpoints, 10);
        assert_eq!(config.stream.memory_window_size, 1000);
        assert_eq!(config.stream.batch_write_size, 10);
        assert!(config.storage.data_dir.ends_with(".strata"));
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[server]
log_level = "debug"

[storage]
data_dir = "/tmp/strata-test"

[safety]
drift_reject_threshold = 0.7

[stream]
format_version = 1
"#;
        let config: StrataConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.storage.data_dir, "/tmp/strata-test");
        assert_eq!(config.safety.drift_reject_threshold, 0.7);
        assert_eq!(config.stream.write_format(), FormatVersion::V1);
        // defaults still apply for unset fields
        assert_eq!(config.safety.drift_alert_threshold, 0.3);
        assert_eq!(config.stream.max_records_per_file, 10_000);
    }

    #[test]
    fn derived_paths_live_under_data_dir() {
        let config = StrataConfig::with_data_dir("/var/lib/strata");
        assert_eq!(config.weights_path(), PathBuf::from("/var/lib/strata/weights.bin"));
        assert_eq!(config.checkpoints_dir(), PathBuf::from("/var/lib/strata/checkpoints"));
        assert_eq!(
            config.trajectories_dir(),
            PathBuf::from("/var/lib/strata/trajectories")
        );
    }

    #[test]
    fn unknown_format_version_falls_back_to_latest() {
        let mut config = StreamConfig::default();
        config.format_version = 9;
        assert_eq!(config.write_format(), FormatVersion::LATEST);
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = StrataConfig::default();
        std::env::set_var("STRATA_DIR", "/tmp/override");
        std::env::set_var("STRATA_LOG_LEVEL", "trace");
        std::env::set_var("STRATA_LEARNING_RATE", "0.05");

        config.apply_env_overrides();

        assert_eq!(config.storage.data_dir, "/tmp/override");
        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.learning.learning_rate, 0.05);

        // Clean up
        std::env::remove_var("STRATA_DIR");
        std::env::remove_var("STRATA_LOG_LEVEL");
        std::env::remove_var("STRATA_LEARNING_RATE");
    }
}
