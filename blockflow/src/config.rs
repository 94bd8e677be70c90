//! Engine configuration.
//!
//! Configuration is read from a JSON file, then selected fields can be
//! overridden from the environment:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `BLOCKFLOW_COMPRESS_PARALLELISM` | workers of the compress stage |
//! | `BLOCKFLOW_UPLOAD_PARALLELISM` | workers of the upload stage |
//! | `BLOCKFLOW_FAIL_MODE` | fail mode of every stage (`default`, `fast`, `smart`) |
//! | `BLOCKFLOW_FORCE_FULL` | `1`/`true`/`yes` forces every block to FULL |
//! | `BLOCKFLOW_LOG` | log filter directive |

use crate::errors::ConfigError;
use crate::observability::LoggingConfig;
use crate::parallel::{FailMode, ParallelOptions};
use crate::pipeline::PipelineConfig;
use crate::retry::RetryConfig;
use crate::scheduler::{BackupMode, HistoryErrorPolicy, ScheduleOptions};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Options of one stage as they appear in the configuration file.
pub type StageConfig = ParallelOptions;

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockflowConfig {
    /// Prepare stage. Defaults to the compress stage options.
    #[serde(default)]
    pub prepare: Option<StageConfig>,
    /// Compress stage.
    #[serde(default)]
    pub compress: StageConfig,
    /// Cleanup stage. Defaults to the compress stage options.
    #[serde(default)]
    pub cleanup: Option<StageConfig>,
    /// Upload stage.
    #[serde(default = "default_upload")]
    pub upload: StageConfig,
    /// Retry budget of each upload.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Reaction to unreadable history.
    #[serde(default)]
    pub history_error_policy: HistoryErrorPolicy,
    /// Forces every block to this mode.
    #[serde(default)]
    pub forced_mode: Option<BackupMode>,
    /// Logging.
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_upload() -> StageConfig {
    ParallelOptions::new(2, FailMode::Smart)
}

impl Default for BlockflowConfig {
    fn default() -> Self {
        Self {
            prepare: None,
            compress: StageConfig::default(),
            cleanup: None,
            upload: default_upload(),
            retry: RetryConfig::default(),
            history_error_policy: HistoryErrorPolicy::default(),
            forced_mode: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl BlockflowConfig {
    /// Loads and validates a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Self::from_json_str(&raw)
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `BLOCKFLOW_*` environment overrides.
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("BLOCKFLOW_COMPRESS_PARALLELISM") {
            self.compress.max_parallelism = parse_parallelism("BLOCKFLOW_COMPRESS_PARALLELISM", &value)?;
        }
        if let Some(value) = lookup("BLOCKFLOW_UPLOAD_PARALLELISM") {
            self.upload.max_parallelism = parse_parallelism("BLOCKFLOW_UPLOAD_PARALLELISM", &value)?;
        }
        if let Some(value) = lookup("BLOCKFLOW_FAIL_MODE") {
            let mode: FailMode = value
                .parse()
                .map_err(|message| ConfigError::invalid("BLOCKFLOW_FAIL_MODE", message))?;
            let prepare = self.prepare.get_or_insert_with(|| self.compress.clone());
            prepare.fail_mode = mode;
            let cleanup = self.cleanup.get_or_insert_with(|| self.compress.clone());
            cleanup.fail_mode = mode;
            self.compress.fail_mode = mode;
            self.upload.fail_mode = mode;
        }
        if let Some(value) = lookup("BLOCKFLOW_FORCE_FULL") {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => self.forced_mode = Some(BackupMode::Full),
                "0" | "false" | "no" | "" => {}
                other => {
                    return Err(ConfigError::invalid(
                        "BLOCKFLOW_FORCE_FULL",
                        format!("expected a boolean, got '{other}'"),
                    ))
                }
            }
        }
        if let Some(value) = lookup("BLOCKFLOW_LOG") {
            self.logging.level = value;
        }
        self.validate()
    }

    /// Rejects zero parallelism and an empty retry budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pipeline_config().validate()
    }

    /// Resolves the per-stage options of a backup pipeline.
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            prepare: self.prepare.clone().unwrap_or_else(|| self.compress.clone()),
            compress: self.compress.clone(),
            cleanup: self.cleanup.clone().unwrap_or_else(|| self.compress.clone()),
            upload: self.upload.clone(),
            retry: self.retry.clone(),
            schedule: ScheduleOptions {
                history_error_policy: self.history_error_policy,
            },
        }
    }
}

fn parse_parallelism(name: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(name, format!("'{value}' is not a worker count: {e}")))
}
