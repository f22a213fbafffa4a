//! Pipeline configuration
//!
//! Every tunable of the pipeline lives in [`PipelineConfig`], which is passed
//! explicitly to each stage at construction. Values can be loaded from
//! `STRIDE_*` environment variables (and a `.env` file, if present).

use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Default tumbling window size (one day)
pub const DEFAULT_WINDOW_SIZE_SECS: i64 = 86_400;

/// Default grace period for late events (one hour)
pub const DEFAULT_WINDOW_GRACE_SECS: i64 = 3_600;

/// Default number of days tracked for the weekly classification
pub const DEFAULT_HISTORY_DEPTH: usize = 7;

/// Default minimum gap between two notifications for the same user
pub const DEFAULT_DEBOUNCE_THRESHOLD_SECS: i64 = 10;

/// Default notification payload template
pub const DEFAULT_NOTIFICATION_TEMPLATE: &str = "Time for a juice nearby! {user_id}";

/// Step-count boundaries of the daily labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelThresholds {
    /// First step count labelled `medium`
    pub medium_min: u32,
    /// First step count labelled `high`
    pub high_min: u32,
}

impl Default for LabelThresholds {
    fn default() -> Self {
        Self {
            medium_min: 1_000,
            high_min: 5_000,
        }
    }
}

/// Full pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Tumbling window length (seconds)
    pub window_size_secs: i64,
    /// Grace period after window close during which late events are admitted (seconds)
    pub window_grace_secs: i64,
    /// Number of daily entries kept per user
    pub history_depth: usize,
    /// Minimum gap between notifications per user (seconds)
    pub debounce_threshold_secs: i64,
    pub labels: LabelThresholds,
    /// Payload template; `{user_id}`, `{first_name}` and `{last_name}` are substituted
    pub notification_template: String,
    /// Directory holding one state database per partition
    pub state_dir: PathBuf,
    pub partitions: u32,
    /// Bounded queue length in front of each partition worker
    pub queue_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            window_size_secs: DEFAULT_WINDOW_SIZE_SECS,
            window_grace_secs: DEFAULT_WINDOW_GRACE_SECS,
            history_depth: DEFAULT_HISTORY_DEPTH,
            debounce_threshold_secs: DEFAULT_DEBOUNCE_THRESHOLD_SECS,
            labels: LabelThresholds::default(),
            notification_template: DEFAULT_NOTIFICATION_TEMPLATE.to_string(),
            state_dir: PathBuf::from("./store"),
            partitions: 4,
            queue_capacity: 1024,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `STRIDE_*` environment variables.
    ///
    /// Unset variables keep their default; set but unparseable values are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Self::default();
        let labels = LabelThresholds {
            medium_min: env_or("STRIDE_LABEL_MEDIUM_MIN", defaults.labels.medium_min)?,
            high_min: env_or("STRIDE_LABEL_HIGH_MIN", defaults.labels.high_min)?,
        };

        let config = Self {
            window_size_secs: env_or("STRIDE_WINDOW_SIZE_SECS", defaults.window_size_secs)?,
            window_grace_secs: env_or("STRIDE_WINDOW_GRACE_SECS", defaults.window_grace_secs)?,
            history_depth: env_or("STRIDE_HISTORY_DEPTH", defaults.history_depth)?,
            debounce_threshold_secs: env_or(
                "STRIDE_DEBOUNCE_THRESHOLD_SECS",
                defaults.debounce_threshold_secs,
            )?,
            labels,
            notification_template: env::var("STRIDE_NOTIFICATION_TEMPLATE")
                .unwrap_or(defaults.notification_template),
            state_dir: env::var("STRIDE_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_dir),
            partitions: env_or("STRIDE_PARTITIONS", defaults.partitions)?,
            queue_capacity: env_or("STRIDE_QUEUE_CAPACITY", defaults.queue_capacity)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size_secs <= 0 {
            return Err(ConfigError::Invalid {
                key: "window_size_secs",
                reason: "must be positive".to_string(),
            });
        }
        if self.window_grace_secs < 0 {
            return Err(ConfigError::Invalid {
                key: "window_grace_secs",
                reason: "must not be negative".to_string(),
            });
        }
        if self.history_depth == 0 {
            return Err(ConfigError::Invalid {
                key: "history_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.debounce_threshold_secs < 0 {
            return Err(ConfigError::Invalid {
                key: "debounce_threshold_secs",
                reason: "must not be negative".to_string(),
            });
        }
        if self.labels.medium_min >= self.labels.high_min {
            return Err(ConfigError::Invalid {
                key: "labels",
                reason: format!(
                    "medium_min ({}) must be below high_min ({})",
                    self.labels.medium_min, self.labels.high_min
                ),
            });
        }
        if self.partitions == 0 {
            return Err(ConfigError::Invalid {
                key: "partitions",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn window_size(&self) -> Duration {
        Duration::seconds(self.window_size_secs)
    }

    pub fn window_grace(&self) -> Duration {
        Duration::seconds(self.window_grace_secs)
    }

    pub fn debounce_threshold(&self) -> Duration {
        Duration::seconds(self.debounce_threshold_secs)
    }

    /// Path of the state database owned by `partition`
    pub fn partition_store_path(&self, partition: u32) -> PathBuf {
        self.state_dir.join(format!("partition-{partition}.sqlite"))
    }
}

fn env_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Unparseable { key, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot parse environment variable {key}={value:?}")]
    Unparseable { key: &'static str, value: String },

    #[error("Invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("State directory was created with {stored} partitions, configured {configured}")]
    PartitionLayoutMismatch { stored: u32, configured: u32 },
}
