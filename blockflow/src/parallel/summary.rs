//! Per-stage outcome summary.

use super::FailMode;
use crate::errors::ItemError;
use serde::Serialize;

/// What happened during one stage invocation.
///
/// Returned by `Fast` and `Smart` stages in place of an error, and kept for
/// every stage of a pipeline run in its report.
#[derive(Debug, Clone, Serialize)]
pub struct StageSummary {
    /// Stage name.
    pub stage: String,
    /// Fail mode the stage ran with.
    pub fail_mode: FailMode,
    /// Every recorded fault.
    #[serde(serialize_with = "serialize_errors")]
    pub exceptions: Vec<ItemError>,
    /// Whether the caller's token fired.
    pub was_canceled: bool,
    /// Items the transform ran on.
    pub processed: usize,
    /// Items that succeeded.
    pub succeeded: usize,
    /// Items whose transform observed cancellation.
    pub canceled: usize,
    /// Items whose transform failed.
    pub faulted: usize,
    /// Items skipped because the stage was stopping.
    pub not_executed: usize,
    /// Upstream failures passed through unchanged.
    pub forwarded: usize,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

fn serialize_errors<S: serde::Serializer>(errors: &[ItemError], s: S) -> Result<S::Ok, S::Error> {
    s.collect_seq(errors.iter().map(ItemError::to_string))
}

impl StageSummary {
    /// True if nothing faulted and the stage was not cancelled.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.exceptions.is_empty() && !self.was_canceled
    }

    /// Converts to a JSON value for events and reports.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
