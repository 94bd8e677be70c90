//! Results of backup and restore runs.

use super::block::BackupBlock;
use crate::errors::ItemError;
use crate::parallel::StageSummary;
use crate::scheduler::{BackupMode, RestoreChain, RestoreGap};
use crate::stream::StreamedValue;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Outcome of one backup run.
///
/// A run that returns a report may still have failed blocks: check
/// [`is_success`](Self::is_success).
#[derive(Debug)]
pub struct BackupReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
    /// One summary per stage, in pipeline order.
    pub stages: Vec<StageSummary>,
    /// Final outcome of every block.
    pub blocks: Vec<StreamedValue<BackupBlock>>,
    /// Blocks classified FULL.
    pub full_count: usize,
    /// Blocks classified DIFF.
    pub diff_count: usize,
    /// Scheduling and history-recording warnings.
    pub warnings: Vec<String>,
}

impl BackupReport {
    /// True if every stage and every block succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stages.iter().all(StageSummary::is_success) && self.blocks.iter().all(StreamedValue::is_succeeded)
    }

    /// Blocks that did not succeed, with their error if any.
    pub fn failed_blocks(&self) -> impl Iterator<Item = (&str, Option<&ItemError>)> {
        self.blocks
            .iter()
            .filter(|v| !v.is_succeeded())
            .map(|v| (v.item().block().key.as_str(), v.error()))
    }

    /// Number of blocks uploaded.
    #[must_use]
    pub fn succeeded_count(&self) -> usize {
        self.blocks.iter().filter(|v| v.is_succeeded()).count()
    }

    /// Summary of one stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageSummary> {
        self.stages.iter().find(|s| s.stage == name)
    }

    /// Converts to a JSON value for events and logs.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id.to_string(),
            "started_at": self.started_at.to_rfc3339(),
            "duration_ms": self.duration_ms,
            "success": self.is_success(),
            "blocks": self.blocks.len(),
            "succeeded": self.succeeded_count(),
            "full": self.full_count,
            "diff": self.diff_count,
            "warnings": self.warnings,
            "stages": self.stages.iter().map(StageSummary::to_dict).collect::<Vec<_>>(),
        })
    }

    pub(crate) fn count_modes(blocks: &[StreamedValue<BackupBlock>]) -> (usize, usize) {
        blocks.iter().fold((0, 0), |(full, diff), v| match v.item().backup_mode() {
            BackupMode::Full => (full + 1, diff),
            BackupMode::Diff => (full, diff + 1),
        })
    }
}

/// Outcome of one restore run.
#[derive(Debug)]
pub struct RestoreReport {
    /// Run identifier.
    pub run_id: Uuid,
    /// The restore stage.
    pub stage: StageSummary,
    /// Final outcome of every chain.
    pub chains: Vec<StreamedValue<RestoreChain>>,
    /// Sources that had nothing to restore from.
    pub gaps: Vec<RestoreGap>,
}

impl RestoreReport {
    /// True if every chain was restored and no source was missing a FULL.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.stage.is_success() && self.gaps.is_empty() && self.chains.iter().all(StreamedValue::is_succeeded)
    }
}
