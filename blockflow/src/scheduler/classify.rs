//! FULL/DIFF classification and largest-first ordering of backup blocks.

use super::history::{BackupMode, HistoryEntry, HistoryLookup};
use crate::cancellation::CancellationToken;
use crate::errors::{BlockflowError, HistoryError, PipelineError};
use crate::events::{self, EventSink, HISTORY_UNAVAILABLE, SCHEDULE_COMPLETED};
use crate::stream::{CompletionSignal, ItemStream, StreamWriter, StreamedValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const STAGE: &str = "schedule";

/// Anything the scheduler can classify: it only needs a stable source identity.
pub trait SourceBlock {
    /// Key matching the block to its history.
    fn source_key(&self) -> &str;
}

impl SourceBlock for String {
    fn source_key(&self) -> &str {
        self
    }
}

/// Scheduling decision for one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    /// Source identity.
    pub source_key: String,
    /// Archive kind to produce.
    pub backup_mode: BackupMode,
    /// Checkpoint a DIFF is taken against. `None` for FULL.
    pub diff_since: Option<DateTime<Utc>>,
    /// Size of the source's latest FULL archive, if known.
    pub historical_full_size: Option<u64>,
}

impl Classification {
    fn full(source_key: &str, entry: Option<&HistoryEntry>) -> Self {
        Self {
            source_key: source_key.to_string(),
            backup_mode: BackupMode::Full,
            diff_since: None,
            historical_full_size: entry.and_then(|e| e.last_full_size_bytes),
        }
    }

    fn diff(source_key: &str, entry: &HistoryEntry) -> Self {
        Self {
            source_key: source_key.to_string(),
            backup_mode: BackupMode::Diff,
            diff_since: Some(entry.latest_checkpoint()),
            historical_full_size: entry.last_full_size_bytes,
        }
    }
}

/// A block together with its classification.
///
/// Stages may change the block but never the classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedBlock<B> {
    block: B,
    classification: Classification,
}

impl<B> ClassifiedBlock<B> {
    /// Pairs a block with its classification.
    pub fn new(block: B, classification: Classification) -> Self {
        Self {
            block,
            classification,
        }
    }

    /// The block.
    pub fn block(&self) -> &B {
        &self.block
    }

    /// Mutable access to the block.
    pub fn block_mut(&mut self) -> &mut B {
        &mut self.block
    }

    /// The scheduling decision.
    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    /// Shorthand for the archive kind.
    pub fn backup_mode(&self) -> BackupMode {
        self.classification.backup_mode
    }

    /// Takes the block back.
    pub fn into_block(self) -> B {
        self.block
    }
}

/// What to do when history cannot be read for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryErrorPolicy {
    /// Abort the schedule.
    #[default]
    Fail,
    /// Back the source up in full and report a warning.
    AssumeFull,
}

/// Scheduler options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleOptions {
    /// Reaction to unreadable history.
    pub history_error_policy: HistoryErrorPolicy,
}

/// A source forced to FULL because its history could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleWarning {
    /// Source identity.
    pub source_key: String,
    /// The lookup failure.
    #[serde(serialize_with = "serialize_display")]
    pub error: HistoryError,
}

fn serialize_display<S: serde::Serializer>(error: &HistoryError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(error)
}

impl fmt::Display for ScheduleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: classified full because {}", self.source_key, self.error)
    }
}

/// Counts of one schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScheduleSummary {
    /// Blocks emitted.
    pub total: usize,
    /// Blocks classified FULL.
    pub full: usize,
    /// Blocks classified DIFF.
    pub diff: usize,
    /// Sources whose history could not be read.
    pub warnings: Vec<ScheduleWarning>,
}

impl ScheduleSummary {
    fn count(&mut self, mode: BackupMode) {
        self.total += 1;
        match mode {
            BackupMode::Full => self.full += 1,
            BackupMode::Diff => self.diff += 1,
        }
    }
}

/// Resolves when every candidate has been classified and emitted.
#[derive(Debug)]
pub struct ScheduleHandle {
    inner: JoinHandle<Result<ScheduleSummary, BlockflowError>>,
}

impl Future for ScheduleHandle {
    type Output = Result<ScheduleSummary, BlockflowError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx).map(|joined| {
            joined.unwrap_or_else(|e| Err(BlockflowError::Internal(format!("scheduler task failed: {e}"))))
        })
    }
}

/// Classifies `candidates` and streams them in execution order.
///
/// See [`classify_with_sink`].
pub fn classify<B, I>(
    candidates: I,
    lookup: Arc<dyn HistoryLookup>,
    forced: Option<BackupMode>,
    options: ScheduleOptions,
    token: &CancellationToken,
) -> (ItemStream<ClassifiedBlock<B>>, ScheduleHandle)
where
    B: SourceBlock + Send + 'static,
    I: IntoIterator<Item = B>,
    I::IntoIter: Send + 'static,
{
    classify_with_sink(candidates, lookup, forced, options, token, events::get_event_sink())
}

/// Classifies `candidates` and streams them in execution order.
///
/// - A source without history is FULL and is emitted as soon as it is looked up.
/// - A source with history is FULL if `forced` is `Some(Full)`, otherwise DIFF
///   against its latest checkpoint.
/// - Sources with history are emitted after every candidate has been looked
///   up, largest last FULL first; unknown sizes go last and ties keep
///   discovery order.
/// - A failed lookup aborts the schedule or, under
///   [`HistoryErrorPolicy::AssumeFull`], makes the source FULL and adds a warning.
pub fn classify_with_sink<B, I>(
    candidates: I,
    lookup: Arc<dyn HistoryLookup>,
    forced: Option<BackupMode>,
    options: ScheduleOptions,
    token: &CancellationToken,
    sink: Arc<dyn EventSink>,
) -> (ItemStream<ClassifiedBlock<B>>, ScheduleHandle)
where
    B: SourceBlock + Send + 'static,
    I: IntoIterator<Item = B>,
    I::IntoIter: Send + 'static,
{
    let (writer, signal, stream) = ItemStream::channel();
    let candidates = candidates.into_iter();
    let token = token.clone();

    let inner = tokio::spawn(async move {
        let result = schedule(candidates, lookup.as_ref(), forced, options, &token, &writer, sink.as_ref()).await;
        drop(writer);
        finish(signal, &result);
        result
    });

    (stream, ScheduleHandle { inner })
}

async fn schedule<B, I>(
    candidates: I,
    lookup: &dyn HistoryLookup,
    forced: Option<BackupMode>,
    options: ScheduleOptions,
    token: &CancellationToken,
    writer: &StreamWriter<ClassifiedBlock<B>>,
    sink: &dyn EventSink,
) -> Result<ScheduleSummary, BlockflowError>
where
    B: SourceBlock + Send + 'static,
    I: Iterator<Item = B>,
{
    let mut summary = ScheduleSummary::default();
    let mut deferred = Vec::new();

    for block in candidates {
        let Some(found) = token.run_until_cancelled(lookup.lookup(block.source_key())).await else {
            return Err(PipelineError::Cancelled {
                stage: STAGE.to_string(),
                reason: token.reason().unwrap_or_default(),
            }
            .into());
        };

        let classification = match found {
            Ok(None) => Classification::full(block.source_key(), None),
            Ok(Some(entry)) => {
                let classification = if forced == Some(BackupMode::Full) {
                    Classification::full(block.source_key(), Some(&entry))
                } else {
                    Classification::diff(block.source_key(), &entry)
                };
                deferred.push(ClassifiedBlock::new(block, classification));
                continue;
            }
            Err(error) => match options.history_error_policy {
                HistoryErrorPolicy::Fail => {
                    warn!(key = %block.source_key(), error = %error, "History lookup failed; aborting schedule");
                    return Err(error.into());
                }
                HistoryErrorPolicy::AssumeFull => {
                    warn!(key = %block.source_key(), error = %error, "History lookup failed; classifying full");
                    sink.try_emit(
                        HISTORY_UNAVAILABLE,
                        Some(serde_json::json!({
                            "key": block.source_key(),
                            "error": error.to_string(),
                        })),
                    );
                    summary.warnings.push(ScheduleWarning {
                        source_key: block.source_key().to_string(),
                        error,
                    });
                    Classification::full(block.source_key(), None)
                }
            },
        };

        summary.count(classification.backup_mode);
        debug!(key = %classification.source_key, mode = %classification.backup_mode, "Block classified");
        if !writer.send(StreamedValue::succeeded(ClassifiedBlock::new(block, classification))) {
            return Ok(summary);
        }
    }

    // Stable: equal sizes keep discovery order.
    deferred.sort_by(|a, b| {
        b.classification
            .historical_full_size
            .cmp(&a.classification.historical_full_size)
    });
    for block in deferred {
        summary.count(block.backup_mode());
        debug!(
            key = %block.classification.source_key,
            mode = %block.classification.backup_mode,
            size = ?block.classification.historical_full_size,
            "Block classified"
        );
        if !writer.send(StreamedValue::succeeded(block)) {
            break;
        }
    }

    info!(
        total = summary.total,
        full = summary.full,
        diff = summary.diff,
        warnings = summary.warnings.len(),
        "Schedule completed"
    );
    sink.try_emit(
        SCHEDULE_COMPLETED,
        Some(serde_json::json!({
            "total": summary.total,
            "full": summary.full,
            "diff": summary.diff,
            "warnings": summary.warnings.len(),
        })),
    );
    Ok(summary)
}

fn finish(signal: CompletionSignal, result: &Result<ScheduleSummary, BlockflowError>) {
    match result {
        Ok(_) => signal.complete(),
        Err(e) => signal.fail(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::scheduler::history::{InMemoryHistory, MockHistoryLookup};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    const MB: u64 = 1024 * 1024;

    fn day(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, d, 1, 30, 0).unwrap()
    }

    fn history() -> Arc<InMemoryHistory> {
        let history = InMemoryHistory::new();
        history.insert("B", HistoryEntry::full(day(1), Some(100 * MB)));
        history.insert("C", HistoryEntry::full(day(2), Some(50 * MB)).with_last_diff(day(9)));
        Arc::new(history)
    }

    async fn run(
        candidates: Vec<&str>,
        lookup: Arc<dyn HistoryLookup>,
        forced: Option<BackupMode>,
        options: ScheduleOptions,
    ) -> (Vec<ClassifiedBlock<String>>, Result<ScheduleSummary, BlockflowError>) {
        let candidates: Vec<String> = candidates.into_iter().map(String::from).collect();
        let (stream, handle) = classify(candidates, lookup, forced, options, &CancellationToken::new());
        let blocks = stream
            .collect()
            .await
            .into_iter()
            .map(StreamedValue::into_item)
            .collect();
        (blocks, handle.await)
    }

    fn keys(blocks: &[ClassifiedBlock<String>]) -> Vec<&str> {
        blocks.iter().map(|b| b.block().as_str()).collect()
    }

    #[tokio::test]
    async fn test_new_sources_first_then_largest_history() {
        let (blocks, summary) =
            run(vec!["C", "B", "A"], history(), None, ScheduleOptions::default()).await;

        assert_eq!(keys(&blocks), vec!["A", "B", "C"]);
        assert_eq!(blocks[0].backup_mode(), BackupMode::Full);
        assert_eq!(blocks[0].classification().diff_since, None);
        assert_eq!(blocks[1].backup_mode(), BackupMode::Diff);
        assert_eq!(blocks[2].backup_mode(), BackupMode::Diff);

        let summary = summary.unwrap();
        assert_eq!((summary.total, summary.full, summary.diff), (3, 1, 2));
        assert!(summary.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_diff_since_is_latest_checkpoint() {
        let (blocks, _) = run(vec!["B", "C"], history(), None, ScheduleOptions::default()).await;

        let b = &blocks[0];
        assert_eq!(b.classification().diff_since, Some(day(1)));
        assert_eq!(b.classification().historical_full_size, Some(100 * MB));
        let c = &blocks[1];
        assert_eq!(c.classification().diff_since, Some(day(9)));
    }

    #[tokio::test]
    async fn test_forced_full_overrides_history() {
        let (blocks, summary) = run(
            vec!["C", "A", "B"],
            history(),
            Some(BackupMode::Full),
            ScheduleOptions::default(),
        )
        .await;

        assert_eq!(keys(&blocks), vec!["A", "B", "C"]);
        assert!(blocks.iter().all(|b| b.backup_mode() == BackupMode::Full));
        // The size hint still orders forced blocks.
        assert_eq!(blocks[1].classification().historical_full_size, Some(100 * MB));
        assert_eq!(summary.unwrap().full, 3);
    }

    #[tokio::test]
    async fn test_forced_diff_still_makes_new_sources_full() {
        let (blocks, _) = run(
            vec!["A", "B"],
            history(),
            Some(BackupMode::Diff),
            ScheduleOptions::default(),
        )
        .await;
        assert_eq!(blocks[0].backup_mode(), BackupMode::Full);
        assert_eq!(blocks[1].backup_mode(), BackupMode::Diff);
    }

    #[tokio::test]
    async fn test_unknown_sizes_sort_last_and_ties_keep_order() {
        let history = InMemoryHistory::new();
        history.insert("x", HistoryEntry::full(day(1), None));
        history.insert("y", HistoryEntry::full(day(1), Some(5)));
        history.insert("z", HistoryEntry::full(day(1), Some(5)));
        history.insert("w", HistoryEntry::full(day(1), Some(9)));

        let (blocks, _) = run(
            vec!["x", "y", "z", "w"],
            Arc::new(history),
            None,
            ScheduleOptions::default(),
        )
        .await;
        assert_eq!(keys(&blocks), vec!["w", "y", "z", "x"]);
    }

    #[tokio::test]
    async fn test_new_source_is_emitted_ahead_of_history_backed_ones() {
        let mut lookup = MockHistoryLookup::new();
        lookup.expect_lookup().returning(|key| {
            if key == "new" {
                Ok(None)
            } else {
                Ok(Some(HistoryEntry::full(day(1), Some(1))))
            }
        });

        let (stream, handle) = classify(
            vec!["old".to_string(), "new".to_string()],
            Arc::new(lookup),
            None,
            ScheduleOptions::default(),
            &CancellationToken::new(),
        );
        let first = stream.recv().await.unwrap().into_item();
        assert_eq!(first.block(), "new");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreadable_history_aborts_by_default() {
        let mut lookup = MockHistoryLookup::new();
        lookup
            .expect_lookup()
            .returning(|_| Err(HistoryError::Unavailable("database is locked".into())));

        let (blocks, result) =
            run(vec!["A", "B"], Arc::new(lookup), None, ScheduleOptions::default()).await;

        assert!(blocks.is_empty());
        let err = result.unwrap_err();
        assert!(matches!(err, BlockflowError::History(HistoryError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_assume_full_reports_every_warning() {
        let mut lookup = MockHistoryLookup::new();
        lookup.expect_lookup().times(2).returning(|key| {
            Err(HistoryError::Corrupt {
                key: key.to_string(),
                reason: "truncated row".into(),
            })
        });
        let sink = Arc::new(CollectingEventSink::new());
        let options = ScheduleOptions {
            history_error_policy: HistoryErrorPolicy::AssumeFull,
        };

        let (stream, handle) = classify_with_sink(
            vec!["A".to_string(), "B".to_string()],
            Arc::new(lookup),
            None,
            options,
            &CancellationToken::new(),
            sink.clone(),
        );
        let blocks = stream.collect().await;
        let summary = handle.await.unwrap();

        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.item().backup_mode() == BackupMode::Full));
        assert_eq!(summary.warnings.len(), 2);
        assert!(summary.warnings[0].to_string().contains("classified full"));
        assert_eq!(sink.events_of_type(HISTORY_UNAVAILABLE).len(), 2);
    }

    #[tokio::test]
    async fn test_missing_history_is_not_a_warning() {
        let (_, summary) = run(
            vec!["A"],
            Arc::new(InMemoryHistory::new()),
            None,
            ScheduleOptions::default(),
        )
        .await;
        assert!(summary.unwrap().warnings.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_schedule_stops() {
        struct Hanging;

        #[async_trait::async_trait]
        impl HistoryLookup for Hanging {
            async fn lookup(&self, _key: &str) -> Result<Option<HistoryEntry>, HistoryError> {
                std::future::pending().await
            }
        }

        let token = CancellationToken::new();
        let (stream, handle) = classify(
            vec!["A".to_string()],
            Arc::new(Hanging),
            None,
            ScheduleOptions::default(),
            &token,
        );
        token.cancel("shutdown");

        let err = handle.await.unwrap_err();
        assert!(matches!(err, BlockflowError::Pipeline(PipelineError::Cancelled { .. })));
        assert!(stream.collect().await.is_empty());
    }
}
