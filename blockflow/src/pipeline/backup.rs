//! Backup pipeline assembly.

use super::block::{ArchiveBuilder, ArchiveCleaner, BackupBlock, BackupSource, Uploader};
use super::collect;
use super::report::BackupReport;
use super::transforms::{CleanupTransform, CompressTransform, PrepareTransform, UploadTransform};
use crate::cancellation::CancellationToken;
use crate::errors::{BlockflowError, ConfigError, PipelineError};
use crate::events::{self, EventSink, RUN_COMPLETED};
use crate::parallel::{
    run_stage_with_sink, BlockTransform, FailMode, ParallelOptions, StageHandle, StageSummary,
};
use crate::retry::RetryConfig;
use crate::scheduler::{classify_with_sink, BackupMode, HistoryLookup, HistoryRecorder, ScheduleOptions};
use crate::stream::{ItemStream, StreamedValue};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Stage names, in pipeline order.
pub const STAGES: [&str; 4] = ["prepare", "compress", "cleanup", "upload"];

/// Per-stage options of a backup pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Prepare stage.
    pub prepare: ParallelOptions,
    /// Compress stage.
    pub compress: ParallelOptions,
    /// Cleanup stage.
    pub cleanup: ParallelOptions,
    /// Upload stage.
    pub upload: ParallelOptions,
    /// Retry budget of each upload.
    pub retry: RetryConfig,
    /// Scheduler options.
    pub schedule: ScheduleOptions,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let compress = ParallelOptions::default();
        Self {
            prepare: compress.clone(),
            cleanup: compress.clone(),
            compress,
            upload: ParallelOptions::new(2, FailMode::Smart),
            retry: RetryConfig::default(),
            schedule: ScheduleOptions::default(),
        }
    }
}

impl PipelineConfig {
    /// Rejects zero parallelism and an empty retry budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (stage, options) in STAGES.iter().zip(self.stage_options()) {
            options
                .validate()
                .map_err(|message| ConfigError::invalid(format!("{stage}.max_parallelism"), message))?;
        }
        if self.retry.budget_secs == 0 {
            return Err(ConfigError::invalid("retry.budget_secs", "must be greater than zero"));
        }
        Ok(())
    }

    fn stage_options(&self) -> [&ParallelOptions; 4] {
        [&self.prepare, &self.compress, &self.cleanup, &self.upload]
    }
}

/// Runs backup blocks through prepare, compress, cleanup and upload.
///
/// Every stage starts as soon as the first block reaches it, so a large
/// compression overlaps with uploads of blocks that finished earlier.
pub struct BackupPipeline {
    builder: Arc<dyn ArchiveBuilder>,
    cleaner: Arc<dyn ArchiveCleaner>,
    uploader: Arc<dyn Uploader>,
    recorder: Arc<dyn HistoryRecorder>,
    config: PipelineConfig,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for BackupPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupPipeline")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BackupPipeline {
    /// Starts building a pipeline.
    #[must_use]
    pub fn builder() -> BackupPipelineBuilder {
        BackupPipelineBuilder::default()
    }

    /// The pipeline configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Backs up `candidates`.
    ///
    /// Returns `Err` if the schedule fails or a `Default`-mode stage fails;
    /// otherwise returns a report that may still contain failed blocks.
    /// Blocks that were uploaded are recorded in history in both cases.
    pub async fn run<I>(
        &self,
        candidates: I,
        history: Arc<dyn HistoryLookup>,
        forced_mode: Option<BackupMode>,
        token: &CancellationToken,
    ) -> Result<BackupReport, BlockflowError>
    where
        I: IntoIterator<Item = BackupSource>,
        I::IntoIter: Send + 'static,
    {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(run_id = %run_id, forced_mode = ?forced_mode, "Backup run started");

        let (classified, schedule) = classify_with_sink(
            candidates,
            history,
            forced_mode,
            self.config.schedule,
            token,
            Arc::clone(&self.sink),
        );
        let (prepared, prepare) = self.stage(
            STAGES[0],
            classified,
            Arc::new(PrepareTransform(Arc::clone(&self.builder))),
            &self.config.prepare,
            token,
        )?;
        let (compressed, compress) = self.stage(
            STAGES[1],
            prepared,
            Arc::new(CompressTransform(Arc::clone(&self.builder))),
            &self.config.compress,
            token,
        )?;
        let (cleaned, cleanup) = self.stage(
            STAGES[2],
            compressed,
            Arc::new(CleanupTransform(Arc::clone(&self.cleaner))),
            &self.config.cleanup,
            token,
        )?;
        let (uploaded, upload) = self.stage(
            STAGES[3],
            cleaned,
            Arc::new(UploadTransform {
                uploader: Arc::clone(&self.uploader),
                retry: self.config.retry.clone(),
            }),
            &self.config.upload,
            token,
        )?;

        let blocks = collect(uploaded).await;
        let schedule = schedule.await;
        let (stages, failure) = join_stages([prepare, compress, cleanup, upload]).await;

        let mut warnings = Vec::new();
        if let Ok(summary) = &schedule {
            warnings.extend(summary.warnings.iter().map(ToString::to_string));
        }
        self.record_history(&blocks, &mut warnings).await;

        schedule?;
        if let Some(e) = failure {
            warn!(run_id = %run_id, error = %e, "Backup run failed");
            return Err(e.into());
        }

        let (full_count, diff_count) = BackupReport::count_modes(&blocks);

        let report = BackupReport {
            run_id,
            started_at,
            duration_ms: start.elapsed().as_secs_f64() * 1000.0,
            stages,
            blocks,
            full_count,
            diff_count,
            warnings,
        };
        info!(
            run_id = %run_id,
            success = report.is_success(),
            blocks = report.blocks.len(),
            full = report.full_count,
            diff = report.diff_count,
            "Backup run completed"
        );
        self.sink.try_emit(RUN_COMPLETED, Some(report.to_dict()));
        Ok(report)
    }

    fn stage<T: Send + 'static>(
        &self,
        name: &str,
        source: ItemStream<T>,
        transform: Arc<dyn BlockTransform<T>>,
        options: &ParallelOptions,
        token: &CancellationToken,
    ) -> Result<(ItemStream<T>, StageHandle), PipelineError> {
        run_stage_with_sink(name, source, transform, options.clone(), token, Arc::clone(&self.sink))
    }

    async fn record_history(
        &self,
        blocks: &[StreamedValue<BackupBlock>],
        warnings: &mut Vec<String>,
    ) {
        for value in blocks.iter().filter(|v| v.is_succeeded()) {
            let block = value.item();
            let key = &block.block().key;
            let size = block.block().archive.as_ref().map(|a| a.size_bytes);
            if let Err(e) = self
                .recorder
                .record(key, block.backup_mode(), Utc::now(), size)
                .await
            {
                warn!(key = %key, error = %e, "Failed to record backup history");
                warnings.push(format!("{key}: history not recorded: {e}"));
            }
        }
    }
}

/// Awaits every stage; keeps the summaries and the first failure.
async fn join_stages(handles: [StageHandle; 4]) -> (Vec<StageSummary>, Option<PipelineError>) {
    let mut summaries = Vec::with_capacity(handles.len());
    let mut failure = None;
    for handle in handles {
        match handle.await {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }
    (summaries, failure)
}

/// Builder for [`BackupPipeline`].
#[derive(Default)]
pub struct BackupPipelineBuilder {
    builder: Option<Arc<dyn ArchiveBuilder>>,
    cleaner: Option<Arc<dyn ArchiveCleaner>>,
    uploader: Option<Arc<dyn Uploader>>,
    recorder: Option<Arc<dyn HistoryRecorder>>,
    config: PipelineConfig,
    sink: Option<Arc<dyn EventSink>>,
}

impl BackupPipelineBuilder {
    /// Sets the archive builder used by the prepare and compress stages.
    #[must_use]
    pub fn archive_builder(mut self, builder: Arc<dyn ArchiveBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Sets the cleaner.
    #[must_use]
    pub fn cleaner(mut self, cleaner: Arc<dyn ArchiveCleaner>) -> Self {
        self.cleaner = Some(cleaner);
        self
    }

    /// Sets the uploader.
    #[must_use]
    pub fn uploader(mut self, uploader: Arc<dyn Uploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    /// Sets where completed archives are recorded.
    #[must_use]
    pub fn history_recorder(mut self, recorder: Arc<dyn HistoryRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Sets the stage configuration.
    #[must_use]
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the event sink. Defaults to the process-wide sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if a collaborator is missing or the configuration is invalid.
    pub fn build(self) -> Result<BackupPipeline, BlockflowError> {
        self.config.validate()?;
        Ok(BackupPipeline {
            builder: self.builder.ok_or_else(|| missing("archive builder"))?,
            cleaner: self.cleaner.ok_or_else(|| missing("cleaner"))?,
            uploader: self.uploader.ok_or_else(|| missing("uploader"))?,
            recorder: self.recorder.ok_or_else(|| missing("history recorder"))?,
            config: self.config,
            sink: self.sink.unwrap_or_else(events::get_event_sink),
        })
    }
}

fn missing(what: &str) -> BlockflowError {
    BlockflowError::InvalidArgument(format!("backup pipeline needs a {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.upload.max_parallelism, 2);
        assert_eq!(config.upload.fail_mode, FailMode::Smart);
        assert_eq!(config.compress.fail_mode, FailMode::Default);
        assert_eq!(config.prepare, config.compress);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_rejects_zero_parallelism() {
        let mut config = PipelineConfig::default();
        config.cleanup.max_parallelism = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cleanup.max_parallelism"));
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = BackupPipeline::builder().build().unwrap_err();
        assert!(matches!(err, BlockflowError::InvalidArgument(ref m) if m.contains("archive builder")));
    }
}
