//! Restore pipeline.

use super::block::Restorer;
use super::collect;
use super::report::RestoreReport;
use super::transforms::RestoreTransform;
use crate::cancellation::CancellationToken;
use crate::errors::BlockflowError;
use crate::events::{self, EventSink, RUN_COMPLETED};
use crate::parallel::{run_stage_with_sink, FailMode, ParallelOptions};
use crate::scheduler::{prepare_decompression_blocks, ArchiveRecord};
use crate::stream::ItemStream;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Restores sources as of a point in time, one chain per source.
///
/// The restore stage always runs in [`FailMode::Smart`] so one broken chain
/// does not stop the others.
pub struct RestorePipeline {
    options: ParallelOptions,
    sink: Arc<dyn EventSink>,
}

impl Default for RestorePipeline {
    fn default() -> Self {
        Self::new(ParallelOptions::default())
    }
}

impl RestorePipeline {
    /// Creates a restore pipeline. The fail mode of `options` is ignored.
    #[must_use]
    pub fn new(options: ParallelOptions) -> Self {
        Self {
            options: options.with_fail_mode(FailMode::Smart),
            sink: events::get_event_sink(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Plans restore chains from `records` and restores each with `restorer`.
    pub async fn run(
        &self,
        records: Vec<ArchiveRecord>,
        as_of: DateTime<Utc>,
        restorer: Arc<dyn Restorer>,
        token: &CancellationToken,
    ) -> Result<RestoreReport, BlockflowError> {
        let run_id = Uuid::new_v4();
        let plan = prepare_decompression_blocks(records, as_of);
        info!(
            run_id = %run_id,
            as_of = %as_of,
            chains = plan.chains.len(),
            gaps = plan.gaps.len(),
            "Restore run started"
        );

        let (restored, handle) = run_stage_with_sink(
            "restore",
            ItemStream::from_iter(plan.chains),
            Arc::new(RestoreTransform(restorer)),
            self.options.clone(),
            token,
            Arc::clone(&self.sink),
        )?;
        let chains = collect(restored).await;
        let stage = handle.await?;

        let report = RestoreReport {
            run_id,
            stage,
            chains,
            gaps: plan.gaps,
        };
        info!(run_id = %run_id, success = report.is_success(), "Restore run completed");
        self.sink.try_emit(
            RUN_COMPLETED,
            Some(serde_json::json!({
                "run_id": run_id.to_string(),
                "kind": "restore",
                "success": report.is_success(),
                "stage": report.stage.to_dict(),
                "gaps": report.gaps.len(),
            })),
        );
        Ok(report)
    }
}
