//! Worker pool running one stage over an item stream.

use super::context::{ParallelizeCore, Tally};
use super::{BlockTransform, ParallelOptions, StageSummary};
use crate::cancellation::CancellationToken;
use crate::errors::{ItemError, PipelineError};
use crate::events::{self, EventSink, ITEM_FAULTED, STAGE_COMPLETED, STAGE_STARTED};
use crate::stream::{ItemStream, StreamWriter, StreamedValue};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Resolves when every worker of a stage has finished.
///
/// Under [`FailMode::Default`](super::FailMode::Default) a faulted or cancelled stage resolves to an
/// error; the other modes always resolve to the [`StageSummary`].
#[derive(Debug)]
pub struct StageHandle {
    stage: String,
    inner: JoinHandle<Result<StageSummary, PipelineError>>,
}

impl StageHandle {
    /// The stage name.
    #[must_use]
    pub fn stage(&self) -> &str {
        &self.stage
    }
}

impl Future for StageHandle {
    type Output = Result<StageSummary, PipelineError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let stage = self.stage.clone();
        Pin::new(&mut self.inner).poll(cx).map(|joined| {
            joined.unwrap_or_else(|e| {
                Err(PipelineError::Join {
                    stage,
                    message: e.to_string(),
                })
            })
        })
    }
}

/// Runs `transform` over `source` with the process-wide event sink.
///
/// See [`run_stage_with_sink`].
pub fn run_stage<T: Send + 'static>(
    name: impl Into<String>,
    source: ItemStream<T>,
    transform: Arc<dyn BlockTransform<T>>,
    options: ParallelOptions,
    token: &CancellationToken,
) -> Result<(ItemStream<T>, StageHandle), PipelineError> {
    run_stage_with_sink(name, source, transform, options, token, events::get_event_sink())
}

/// Runs `transform` over `source` on `options.max_parallelism` workers.
///
/// Returns the output stream immediately; values appear on it as soon as
/// each item finishes. The output stream ends, and its completion fires, only
/// after every worker has exited. The handle resolves after that.
pub fn run_stage_with_sink<T: Send + 'static>(
    name: impl Into<String>,
    source: ItemStream<T>,
    transform: Arc<dyn BlockTransform<T>>,
    options: ParallelOptions,
    token: &CancellationToken,
    sink: Arc<dyn EventSink>,
) -> Result<(ItemStream<T>, StageHandle), PipelineError> {
    let stage = name.into();
    options
        .validate()
        .map_err(|message| PipelineError::InvalidOptions {
            stage: stage.clone(),
            message,
        })?;

    let workers = options.max_parallelism;
    let fail_mode = options.fail_mode;
    let core = Arc::new(ParallelizeCore::new(stage.clone(), options, token));
    let (writer, signal, output) = ItemStream::channel();

    info!(stage = %stage, workers, fail_mode = %fail_mode, "Stage started");
    sink.try_emit(
        STAGE_STARTED,
        Some(serde_json::json!({
            "stage": &stage,
            "max_parallelism": workers,
            "fail_mode": fail_mode,
        })),
    );

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&core),
                source.clone(),
                Arc::clone(&transform),
                writer.clone(),
                Arc::clone(&sink),
            ))
        })
        .collect();
    drop(writer);
    drop(source);

    let driver = tokio::spawn(async move {
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(stage = %core.stage(), error = %e, "Stage worker died");
                core.record_exception(ItemError::Panicked(e.to_string()));
            }
        }
        signal.complete();

        let summary = core.summary();
        info!(
            stage = %summary.stage,
            succeeded = summary.succeeded,
            faulted = summary.faulted,
            canceled = summary.canceled,
            not_executed = summary.not_executed,
            duration_ms = summary.duration_ms,
            "Stage completed"
        );
        sink.try_emit(STAGE_COMPLETED, Some(summary.to_dict()));

        surface(summary, core.cancel_token().reason())
    });

    Ok((output, StageHandle { stage, inner: driver }))
}

/// Maps a finished stage to what its fail mode hands the caller.
fn surface(summary: StageSummary, cancel_reason: Option<String>) -> Result<StageSummary, PipelineError> {
    if !summary.fail_mode.fails_structurally() {
        return Ok(summary);
    }
    let StageSummary {
        stage,
        mut exceptions,
        was_canceled,
        ..
    } = summary.clone();
    match exceptions.len() {
        0 if was_canceled => Err(PipelineError::Cancelled {
            stage,
            reason: cancel_reason.unwrap_or_default(),
        }),
        0 => Ok(summary),
        1 => Err(PipelineError::Faulted {
            stage,
            error: exceptions.remove(0),
        }),
        _ => Err(PipelineError::Aggregate {
            stage,
            errors: exceptions,
        }),
    }
}

async fn worker_loop<T: Send + 'static>(
    worker: usize,
    core: Arc<ParallelizeCore>,
    source: ItemStream<T>,
    transform: Arc<dyn BlockTransform<T>>,
    writer: StreamWriter<T>,
    sink: Arc<dyn EventSink>,
) {
    loop {
        if core.break_requested() {
            drain_after_break(worker, &core, &source, transform.as_ref(), &writer).await;
            return;
        }

        let next = tokio::select! {
            biased;
            () = core.pull_token().cancelled() => continue,
            next = source.recv() => next,
        };
        let Some(value) = next else {
            debug!(stage = %core.stage(), worker, "Source exhausted");
            return;
        };

        let out = if !value.is_succeeded() {
            core.tally(Tally::Forwarded);
            transform.on_upstream_failure(value)
        } else if core.break_requested() {
            core.tally(Tally::NotExecuted);
            StreamedValue::not_executed(value.into_item())
        } else {
            execute(worker, &core, transform.as_ref(), value.into_item(), sink.as_ref()).await
        };

        if !writer.send(out) {
            debug!(stage = %core.stage(), worker, "Output stream dropped; discarding value");
        }
    }
}

/// Gives every remaining source value an outcome without running the transform.
///
/// Reads until the source ends. Once the stage is cancelled, a source that stays
/// silent for twice the cancellation grace period is abandoned, so a stalled
/// feeder cannot hold the stage open. Upstream stages abandon their own
/// transforms after one grace period.
async fn drain_after_break<T: Send + 'static>(
    worker: usize,
    core: &ParallelizeCore,
    source: &ItemStream<T>,
    transform: &dyn BlockTransform<T>,
    writer: &StreamWriter<T>,
) {
    let silence = core.options().cancel_grace().map(|grace| grace.saturating_mul(2));
    loop {
        let next = match silence {
            Some(silence) => tokio::select! {
                next = source.recv() => next,
                () = abandon_after(core.cancel_token(), silence) => {
                    warn!(stage = %core.stage(), worker, "Source silent after cancellation; worker stopped");
                    return;
                }
            },
            None => source.recv().await,
        };
        let Some(value) = next else {
            debug!(stage = %core.stage(), worker, "Worker drained source after break");
            return;
        };
        if !writer.send(skip(core, transform, value)) {
            debug!(stage = %core.stage(), worker, "Output stream dropped; discarding value");
        }
    }
}

/// Outcome of an item drained after a break.
fn skip<T: Send + 'static>(
    core: &ParallelizeCore,
    transform: &dyn BlockTransform<T>,
    value: StreamedValue<T>,
) -> StreamedValue<T> {
    if value.is_succeeded() {
        core.tally(Tally::NotExecuted);
        StreamedValue::not_executed(value.into_item())
    } else {
        core.tally(Tally::Forwarded);
        transform.on_upstream_failure(value)
    }
}

async fn execute<T: Send + 'static>(
    worker: usize,
    core: &ParallelizeCore,
    transform: &dyn BlockTransform<T>,
    mut item: T,
    sink: &dyn EventSink,
) -> StreamedValue<T> {
    let cancel = core.cancel_token();
    let outcome = {
        let apply = AssertUnwindSafe(transform.apply(&mut item, cancel)).catch_unwind();
        match core.options().cancel_grace() {
            Some(grace) => {
                tokio::select! {
                    biased;
                    result = apply => Some(result),
                    () = abandon_after(cancel, grace) => None,
                }
            }
            None => Some(apply.await),
        }
    };

    match outcome {
        Some(Ok(Ok(()))) => {
            core.tally(Tally::Succeeded);
            StreamedValue::succeeded(item)
        }
        Some(Ok(Err(e))) if e.is_cancellation() => {
            core.tally(Tally::Canceled);
            StreamedValue::canceled(item, Some(e))
        }
        Some(Ok(Err(e))) => fault(worker, core, item, e, sink),
        Some(Err(panic)) => fault(worker, core, item, ItemError::Panicked(panic_message(&panic)), sink),
        None => {
            warn!(stage = %core.stage(), worker, "Abandoned transform that ignored cancellation");
            core.tally(Tally::Canceled);
            StreamedValue::canceled(
                item,
                Some(ItemError::cancelled("abandoned after cancellation grace period")),
            )
        }
    }
}

fn fault<T>(
    worker: usize,
    core: &ParallelizeCore,
    item: T,
    error: ItemError,
    sink: &dyn EventSink,
) -> StreamedValue<T> {
    warn!(stage = %core.stage(), worker, error = %error, "Item faulted");
    core.tally(Tally::Faulted);
    core.record_exception(error.clone());
    sink.try_emit(
        ITEM_FAULTED,
        Some(serde_json::json!({
            "stage": core.stage(),
            "error": error.to_dict(),
        })),
    );
    if core.fail_mode().stops_on_fault() {
        core.request_break(&format!("stage '{}' stopped after a fault", core.stage()));
    }
    StreamedValue::faulted(item, error)
}

async fn abandon_after(cancel: &CancellationToken, grace: Duration) {
    cancel.cancelled().await;
    tokio::time::sleep(grace).await;
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::stream::ExecutionStatus;
    use crate::testing::{
        assert_status_count, count_status, sorted_items, ConcurrencyProbe, FailingTransform,
        PanickingTransform, SlowTransform, StallingTransform,
    };
    use crate::parallel::{FailMode, FnTransform};
    use pretty_assertions::assert_eq;

    fn options(parallelism: usize, fail_mode: FailMode) -> ParallelOptions {
        ParallelOptions::new(parallelism, fail_mode)
    }

    #[tokio::test]
    async fn test_every_item_succeeds() {
        let double: Arc<dyn BlockTransform<u32>> = Arc::new(FnTransform::new(|n: &mut u32| {
            *n *= 2;
            Ok(())
        }));
        let (output, handle) = run_stage(
            "double",
            ItemStream::from_iter(1..=20),
            double,
            options(4, FailMode::Default),
            &CancellationToken::new(),
        )
        .unwrap();

        let values = output.collect().await;
        let summary = handle.await.unwrap();

        assert_eq!(sorted_items(&values), (1..=20).map(|n| n * 2).collect::<Vec<_>>());
        assert_eq!(summary.succeeded, 20);
        assert!(summary.is_success());
    }

    #[tokio::test]
    async fn test_zero_parallelism_rejected() {
        let result = run_stage(
            "compress",
            ItemStream::from_iter(0..3u32),
            Arc::new(ConcurrencyProbe::default()),
            options(0, FailMode::Smart),
            &CancellationToken::new(),
        );
        assert!(matches!(result, Err(PipelineError::InvalidOptions { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_parallelism() {
        for parallelism in [1, 3, 8] {
            let probe = Arc::new(ConcurrencyProbe::new(Duration::from_millis(10)));
            let (output, handle) = run_stage(
                "probe",
                ItemStream::from_iter(0..40u32),
                probe.clone(),
                options(parallelism, FailMode::Smart),
                &CancellationToken::new(),
            )
            .unwrap();

            let values = output.collect().await;
            handle.await.unwrap();

            assert_eq!(values.len(), 40);
            assert_eq!(probe.calls(), 40);
            assert!(probe.max_in_flight() <= parallelism);
            assert_eq!(probe.max_in_flight(), parallelism);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_smart_isolates_the_failing_item() {
        let transform = Arc::new(FailingTransform::new([4u32]).with_delay(Duration::from_millis(5)));
        let (output, handle) = run_stage(
            "compress",
            ItemStream::from_iter(0..10u32),
            transform.clone(),
            options(3, FailMode::Smart),
            &CancellationToken::new(),
        )
        .unwrap();

        let values = output.collect().await;
        let summary = handle.await.unwrap();

        assert_eq!(summary.exceptions.len(), 1);
        assert_eq!(summary.faulted, 1);
        assert_eq!(summary.succeeded, 9);
        assert!(!summary.is_success());
        assert_eq!(transform.attempted().len(), 10);
        assert_status_count(&values, ExecutionStatus::Succeeded, 9);
        assert_status_count(&values, ExecutionStatus::Faulted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_mode_fails_the_stage_call() {
        let transform = Arc::new(FailingTransform::new([4u32]).with_delay(Duration::from_millis(5)));
        let (output, handle) = run_stage(
            "compress",
            ItemStream::from_iter(0..10u32),
            transform.clone(),
            options(3, FailMode::Default),
            &CancellationToken::new(),
        )
        .unwrap();

        let values = output.collect().await;
        let err = handle.await.unwrap_err();

        match err {
            PipelineError::Faulted { stage, error } => {
                assert_eq!(stage, "compress");
                assert_eq!(error, ItemError::failed("item 4 failed"));
            }
            other => panic!("expected a single fault, got {other:?}"),
        }
        // Default does not stop early; the failed item still flows downstream.
        assert_eq!(transform.attempted().len(), 10);
        assert_status_count(&values, ExecutionStatus::Faulted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_mode_aggregates_several_faults() {
        let (output, handle) = run_stage(
            "compress",
            ItemStream::from_iter(0..10u32),
            Arc::new(FailingTransform::new([2u32, 7])),
            options(3, FailMode::Default),
            &CancellationToken::new(),
        )
        .unwrap();

        output.collect().await;
        let err = handle.await.unwrap_err();
        assert!(matches!(err, PipelineError::Aggregate { ref errors, .. } if errors.len() == 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_mode_stops_pulling_after_first_fault() {
        let transform = Arc::new(FailingTransform::new([1u32]).with_delay(Duration::from_millis(10)));
        let (output, handle) = run_stage(
            "compress",
            ItemStream::from_iter(0..20u32),
            transform.clone(),
            options(2, FailMode::Fast),
            &CancellationToken::new(),
        )
        .unwrap();

        let values = output.collect().await;
        let summary = handle.await.unwrap();

        // Items 0 and 1 were in flight together; 0 still completes.
        assert_eq!(transform.attempted(), vec![0, 1]);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.faulted, 1);
        assert_eq!(summary.not_executed, 18);
        assert_eq!(values.len(), 20);
        assert_eq!(values.iter().filter(|v| v.is_not_executed()).count(), 18);
        assert!(!summary.was_canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_reaches_terminal_state() {
        for fail_mode in [FailMode::Default, FailMode::Fast, FailMode::Smart] {
            let token = CancellationToken::new();
            let transform = Arc::new(SlowTransform::new(Duration::from_secs(3600)));
            let (output, handle) = run_stage(
                "upload",
                ItemStream::from_iter(0..100u32),
                transform.clone(),
                options(4, fail_mode),
                &token,
            )
            .unwrap();

            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel("shutdown");

            let values = tokio::time::timeout(Duration::from_secs(5), output.collect())
                .await
                .expect("stage must drain after cancellation");
            let result = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("stage must finish after cancellation");

            assert_eq!(values.len(), 100);
            assert_eq!(transform.cancelled(), 4);
            assert_eq!(count_status(&values, ExecutionStatus::Canceled), 100);

            match fail_mode {
                FailMode::Default => {
                    let err = result.unwrap_err();
                    assert!(err.is_cancelled());
                }
                FailMode::Fast | FailMode::Smart => {
                    let summary = result.unwrap();
                    assert!(summary.was_canceled);
                    assert_eq!(summary.canceled, 4);
                    assert_eq!(summary.not_executed, 96);
                    assert!(summary.exceptions.is_empty());
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_stage_gives_late_upstream_items_an_outcome() {
        let token = CancellationToken::new();
        let upstream = Arc::new(ConcurrencyProbe::new(Duration::from_millis(10)));
        let (staged, first) = run_stage(
            "prepare",
            ItemStream::from_iter(0..10u32),
            upstream.clone(),
            options(1, FailMode::Smart),
            &token,
        )
        .unwrap();
        let (output, second) = run_stage(
            "compress",
            staged,
            Arc::new(FailingTransform::new([0u32])),
            options(1, FailMode::Fast),
            &token,
        )
        .unwrap();

        let values = output.collect().await;
        let upstream_summary = first.await.unwrap();
        let summary = second.await.unwrap();

        assert_eq!(upstream.calls(), 10);
        assert_eq!(upstream_summary.succeeded, 10);
        assert_eq!(values.len(), 10);
        assert_eq!(sorted_items(&values), (0..10).collect::<Vec<_>>());
        assert_eq!(summary.faulted, 1);
        assert_eq!(summary.not_executed, 9);
        for value in &values {
            assert!(value.status() == ExecutionStatus::Faulted || value.is_not_executed());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancellation_between_stages_keeps_every_item() {
        for _ in 0..20 {
            let token = CancellationToken::new();
            let (staged, first) = run_stage(
                "compress",
                ItemStream::from_iter(0..20u32),
                Arc::new(SlowTransform::new(Duration::from_secs(3600))),
                options(4, FailMode::Smart),
                &token,
            )
            .unwrap();
            let (output, second) = run_stage(
                "upload",
                staged,
                Arc::new(ConcurrencyProbe::new(Duration::from_millis(1))),
                options(2, FailMode::Smart),
                &token,
            )
            .unwrap();

            tokio::time::sleep(Duration::from_millis(5)).await;
            token.cancel("shutdown");

            let values = tokio::time::timeout(Duration::from_secs(5), output.collect())
                .await
                .expect("pipeline must drain after cancellation");
            assert!(first.await.unwrap().was_canceled);
            assert!(second.await.unwrap().was_canceled);

            assert_eq!(values.len(), 20);
            assert_eq!(sorted_items(&values), (0..20).collect::<Vec<_>>());
            for value in &values {
                assert_eq!(value.status(), ExecutionStatus::Canceled);
                assert!(value.error().map_or(true, ItemError::is_cancellation));
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wakes_workers_on_a_stalled_source() {
        let token = CancellationToken::new();
        let (writer, _signal, source) = ItemStream::<u32>::channel();
        writer.send(StreamedValue::succeeded(1));

        let (output, handle) = run_stage(
            "prepare",
            source,
            Arc::new(ConcurrencyProbe::default()),
            options(2, FailMode::Smart).with_cancel_grace(Some(Duration::from_millis(100))),
            &token,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("timeout");
        writer.send(StreamedValue::succeeded(2));

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("workers must not wait on a stalled source")
            .unwrap();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.not_executed, 1);
        assert!(summary.was_canceled);
        assert_eq!(output.collect().await.len(), 2);
        drop(writer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transform_ignoring_cancellation_is_abandoned() {
        let token = CancellationToken::new();
        let (output, handle) = run_stage(
            "upload",
            ItemStream::from_iter(0..5u32),
            Arc::new(StallingTransform),
            options(2, FailMode::Smart).with_cancel_grace(Some(Duration::from_millis(100))),
            &token,
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel("shutdown");

        let summary = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("grace period bounds the wait")
            .unwrap();
        assert_eq!(summary.canceled, 2);
        assert_eq!(summary.not_executed, 3);
        assert_eq!(output.collect().await.len(), 5);
    }

    #[tokio::test]
    async fn test_panicking_transform_is_a_fault() {
        let (output, handle) = run_stage(
            "compress",
            ItemStream::from_iter(0..5u32),
            Arc::new(PanickingTransform::new(2u32)),
            options(2, FailMode::Smart),
            &CancellationToken::new(),
        )
        .unwrap();

        let values = output.collect().await;
        let summary = handle.await.unwrap();

        assert_eq!(summary.faulted, 1);
        assert!(matches!(summary.exceptions[0], ItemError::Panicked(ref m) if m.contains("exploded")));
        assert_status_count(&values, ExecutionStatus::Succeeded, 4);
    }

    #[tokio::test]
    async fn test_upstream_failures_are_forwarded() {
        let (writer, signal, source) = ItemStream::channel();
        writer.send(StreamedValue::succeeded(1u32));
        writer.send(StreamedValue::faulted(2, ItemError::failed("compress failed")));
        writer.send(StreamedValue::not_executed(3));
        drop(writer);
        signal.complete();

        let probe = Arc::new(ConcurrencyProbe::default());
        let (output, handle) = run_stage(
            "upload",
            source,
            probe.clone(),
            options(2, FailMode::Default),
            &CancellationToken::new(),
        )
        .unwrap();

        let values = output.collect().await;
        let summary = handle.await.unwrap();

        assert_eq!(probe.calls(), 1);
        assert_eq!(summary.forwarded, 2);
        assert!(summary.is_success());
        assert_status_count(&values, ExecutionStatus::Faulted, 1);
        assert_status_count(&values, ExecutionStatus::Canceled, 1);
    }

    #[tokio::test]
    async fn test_stage_emits_lifecycle_events() {
        let sink = Arc::new(CollectingEventSink::new());
        let (output, handle) = run_stage_with_sink(
            "compress",
            ItemStream::from_iter(0..3u32),
            Arc::new(FailingTransform::new([0u32])),
            options(1, FailMode::Smart),
            &CancellationToken::new(),
            sink.clone(),
        )
        .unwrap();

        output.collect().await;
        handle.await.unwrap();

        assert_eq!(sink.events_of_type(STAGE_STARTED).len(), 1);
        assert_eq!(sink.events_of_type(ITEM_FAULTED).len(), 1);
        let completed = sink.events_of_type(STAGE_COMPLETED);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].as_ref().unwrap()["faulted"], 1);
    }

    #[tokio::test]
    async fn test_output_completes_only_after_workers_finish() {
        let (output, handle) = run_stage(
            "probe",
            ItemStream::from_iter(0..10u32),
            Arc::new(ConcurrencyProbe::new(Duration::from_millis(2))),
            options(3, FailMode::Smart),
            &CancellationToken::new(),
        )
        .unwrap();

        let completion = output.completion();
        assert!(!completion.is_complete());
        let values = output.collect().await;
        assert!(completion.is_complete());
        assert_eq!(values.len(), 10);
        handle.await.unwrap();
    }
}
