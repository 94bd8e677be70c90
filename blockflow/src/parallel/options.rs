//! Stage options and fail modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How a stage reacts to item faults and how it reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Attempt every item; the stage call itself fails if any item faulted.
    #[default]
    Default,
    /// Stop pulling new items after the first fault; the call returns a summary.
    Fast,
    /// Attempt every item and collect every fault; the call returns a summary.
    Smart,
}

impl FailMode {
    /// Returns true if a fault stops the stage from starting new items.
    #[must_use]
    pub fn stops_on_fault(self) -> bool {
        self == Self::Fast
    }

    /// Returns true if failures are surfaced structurally rather than in a summary.
    #[must_use]
    pub fn fails_structurally(self) -> bool {
        self == Self::Default
    }
}

impl fmt::Display for FailMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Fast => write!(f, "fast"),
            Self::Smart => write!(f, "smart"),
        }
    }
}

impl FromStr for FailMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "fast" => Ok(Self::Fast),
            "smart" => Ok(Self::Smart),
            other => Err(format!("unknown fail mode '{other}'")),
        }
    }
}

/// Options of one stage invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelOptions {
    /// Number of concurrent workers.
    #[serde(default = "default_parallelism")]
    pub max_parallelism: usize,
    /// Failure policy.
    #[serde(default)]
    pub fail_mode: FailMode,
    /// After cancellation, how long an in-flight transform may keep running
    /// before the worker abandons it. `None` waits for the transform.
    #[serde(default = "default_cancel_grace_ms")]
    pub cancel_grace_ms: Option<u64>,
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[allow(clippy::unnecessary_wraps)]
fn default_cancel_grace_ms() -> Option<u64> {
    Some(30_000)
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            max_parallelism: default_parallelism(),
            fail_mode: FailMode::default(),
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }
}

impl ParallelOptions {
    /// Creates options with the given parallelism and fail mode.
    #[must_use]
    pub fn new(max_parallelism: usize, fail_mode: FailMode) -> Self {
        Self {
            max_parallelism,
            fail_mode,
            cancel_grace_ms: default_cancel_grace_ms(),
        }
    }

    /// Sets the parallelism.
    #[must_use]
    pub fn with_max_parallelism(mut self, max_parallelism: usize) -> Self {
        self.max_parallelism = max_parallelism;
        self
    }

    /// Sets the fail mode.
    #[must_use]
    pub fn with_fail_mode(mut self, fail_mode: FailMode) -> Self {
        self.fail_mode = fail_mode;
        self
    }

    /// Sets the cancellation grace period.
    #[must_use]
    pub fn with_cancel_grace(mut self, grace: Option<Duration>) -> Self {
        self.cancel_grace_ms = grace.map(|g| u64::try_from(g.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// The cancellation grace period.
    #[must_use]
    pub fn cancel_grace(&self) -> Option<Duration> {
        self.cancel_grace_ms.map(Duration::from_millis)
    }

    /// Checks the options before any worker is spawned.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_parallelism == 0 {
            return Err("max_parallelism must be greater than zero".to_string());
        }
        Ok(())
    }
}
