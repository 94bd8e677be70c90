//! Error types for the blockflow engine.
//!
//! Errors are split by the level at which they surface:
//!
//! - [`ItemError`] travels with a single block through the item streams and is
//!   collected by the stage that produced it.
//! - [`PipelineError`] is how a `Default` fail-mode stage reports failure.
//! - [`HistoryError`] is the scheduling hazard raised when history cannot be read.
//! - [`BlockflowError`] is the top-level error returned by public entry points.

use std::collections::HashMap;
use thiserror::Error;

/// The main error type for blockflow operations.
#[derive(Debug, Error)]
pub enum BlockflowError {
    /// A stage failed under the `Default` fail mode.
    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    /// The history index could not be read.
    #[error("{0}")]
    History(#[from] HistoryError),

    /// The configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A caller passed an argument that can never be valid.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error attached to one block by the stage that processed it.
///
/// Cloneable so the same error can be stored in the stage's exception set and
/// travel downstream inside the block's `StreamedValue`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    /// The operation observed cancellation and stopped.
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// The stage stopped before this item was started.
    #[error("Not executed: stage stopped before the item was started")]
    NotExecuted,

    /// The transform failed.
    #[error("{0}")]
    Failed(String),

    /// An external command exited with a failure status.
    #[error("Command '{command}' failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// The exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Captured diagnostics.
        stderr: String,
    },

    /// The retry budget was consumed without a successful attempt.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Number of attempts made.
        attempts: u32,
        /// Error of the last attempt.
        last_error: Box<ItemError>,
    },

    /// The transform panicked.
    #[error("Transform panicked: {0}")]
    Panicked(String),
}

impl ItemError {
    /// Creates a generic failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled(reason.into())
    }

    /// Creates a command failure.
    #[must_use]
    pub fn command_failed(
        command: impl Into<String>,
        exit_code: Option<i32>,
        stderr: impl Into<String>,
    ) -> Self {
        Self::CommandFailed {
            command: command.into(),
            exit_code,
            stderr: stderr.into(),
        }
    }

    /// Returns true for cancellation-kind errors, which are never counted as faults.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::NotExecuted)
    }

    /// Short type name used in events and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cancelled(_) => "cancelled",
            Self::NotExecuted => "not_executed",
            Self::Failed(_) => "failed",
            Self::CommandFailed { .. } => "command_failed",
            Self::RetryExhausted { .. } => "retry_exhausted",
            Self::Panicked(_) => "panicked",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Self::RetryExhausted { attempts, .. } = self {
            map.insert("attempts".to_string(), serde_json::json!(attempts));
        }
        map
    }
}

/// Failure of a whole stage, surfaced under the `Default` fail mode.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// Exactly one item faulted.
    #[error("Stage '{stage}' failed: {error}")]
    Faulted {
        /// The stage name.
        stage: String,
        /// The item error.
        error: ItemError,
    },

    /// More than one item faulted.
    #[error("Stage '{stage}' failed with {} errors", errors.len())]
    Aggregate {
        /// The stage name.
        stage: String,
        /// All recorded item errors.
        errors: Vec<ItemError>,
    },

    /// The stage was cancelled.
    #[error("Stage '{stage}' cancelled: {reason}")]
    Cancelled {
        /// The stage name.
        stage: String,
        /// The cancellation reason.
        reason: String,
    },

    /// A worker task could not be joined.
    #[error("Stage '{stage}' worker join error: {message}")]
    Join {
        /// The stage name.
        stage: String,
        /// The join error message.
        message: String,
    },

    /// Stage options were rejected before any worker started.
    #[error("Invalid options for stage '{stage}': {message}")]
    InvalidOptions {
        /// The stage name.
        stage: String,
        /// What was wrong.
        message: String,
    },
}

impl PipelineError {
    /// Returns the item errors carried by this error.
    #[must_use]
    pub fn item_errors(&self) -> Vec<ItemError> {
        match self {
            Self::Faulted { error, .. } => vec![error.clone()],
            Self::Aggregate { errors, .. } => errors.clone(),
            Self::Cancelled { .. } | Self::Join { .. } | Self::InvalidOptions { .. } => Vec::new(),
        }
    }

    /// Returns true if the stage failed because of cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Error raised when the backup history cannot be read.
///
/// Distinct from "no history": a lookup returning `Ok(None)` means the source
/// has never been backed up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    /// The history store could not be reached.
    #[error("History unavailable: {0}")]
    Unavailable(String),

    /// A history row exists but cannot be interpreted.
    #[error("History for '{key}' is corrupt: {reason}")]
    Corrupt {
        /// The source key.
        key: String,
        /// Why it could not be read.
        reason: String,
    },
}

/// Error raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        /// The file path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration could not be parsed.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A configuration value is out of range.
    #[error("Invalid config value for '{field}': {message}")]
    Invalid {
        /// The field name.
        field: String,
        /// What was wrong.
        message: String,
    },
}

impl ConfigError {
    /// Creates an invalid value error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}
