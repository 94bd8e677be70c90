//! Item streams connecting pipeline stages.
//!
//! An [`ItemStream`] is a multi-consumer view over an unbounded channel of
//! [`StreamedValue`]s. Every value is delivered to exactly one consumer. The
//! stream ends once every [`StreamWriter`] is dropped, and its [`Completion`]
//! resolves when the producing side signals that it has finished.
//!
//! Consumers see a value as soon as it is written, which is what lets two
//! stages connected back to back overlap in time.

use crate::errors::ItemError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::warn;

/// Outcome of processing one item in a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The transform completed.
    Succeeded,
    /// The item was cancelled or never executed.
    Canceled,
    /// The transform failed.
    Faulted,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Canceled => write!(f, "canceled"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

/// An item together with the outcome of the stage that produced it.
///
/// Immutable once created; use [`into_parts`](Self::into_parts) to take the item back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedValue<T> {
    item: T,
    status: ExecutionStatus,
    error: Option<ItemError>,
}

impl<T> StreamedValue<T> {
    /// A successfully processed item.
    pub fn succeeded(item: T) -> Self {
        Self {
            item,
            status: ExecutionStatus::Succeeded,
            error: None,
        }
    }

    /// A cancelled item. Non-cancellation errors are not accepted here and are dropped.
    pub fn canceled(item: T, error: Option<ItemError>) -> Self {
        Self {
            item,
            status: ExecutionStatus::Canceled,
            error: error.filter(ItemError::is_cancellation),
        }
    }

    /// An item the stage never started because it was stopping.
    pub fn not_executed(item: T) -> Self {
        Self::canceled(item, Some(ItemError::NotExecuted))
    }

    /// A failed item.
    pub fn faulted(item: T, error: ItemError) -> Self {
        Self {
            item,
            status: ExecutionStatus::Faulted,
            error: Some(error),
        }
    }

    /// The carried item.
    pub fn item(&self) -> &T {
        &self.item
    }

    /// The outcome status.
    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    /// The error, if any.
    pub fn error(&self) -> Option<&ItemError> {
        self.error.as_ref()
    }

    /// Returns true if the item succeeded.
    pub fn is_succeeded(&self) -> bool {
        self.status == ExecutionStatus::Succeeded
    }

    /// Returns true if the item was skipped because its stage stopped early.
    pub fn is_not_executed(&self) -> bool {
        matches!(self.error, Some(ItemError::NotExecuted))
    }

    /// Takes the item out.
    pub fn into_item(self) -> T {
        self.item
    }

    /// Splits into item, status and error.
    pub fn into_parts(self) -> (T, ExecutionStatus, Option<ItemError>) {
        (self.item, self.status, self.error)
    }
}

type CompletionState = Option<Result<(), String>>;

/// Awaitable end-of-production signal of a stream.
#[derive(Debug, Clone)]
pub struct Completion {
    rx: watch::Receiver<CompletionState>,
}

impl Completion {
    /// Waits until the producer has finished.
    ///
    /// Returns the producer's error message if it stopped because of a failure.
    pub async fn wait(&self) -> Result<(), String> {
        let mut rx = self.rx.clone();
        let state = match rx.wait_for(Option::is_some).await {
            Ok(state) => state.clone(),
            Err(_) => return Err("stream producer vanished".to_string()),
        };
        state.unwrap_or(Ok(()))
    }

    /// Returns true once the producer has finished.
    pub fn is_complete(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Producer-side handle that marks a stream complete.
///
/// Dropping it without calling [`complete`](Self::complete) or
/// [`fail`](Self::fail) marks the stream failed, so consumers never hang.
#[derive(Debug)]
pub struct CompletionSignal {
    tx: watch::Sender<CompletionState>,
}

impl CompletionSignal {
    /// Marks the stream complete.
    pub fn complete(self) {
        self.tx.send_replace(Some(Ok(())));
    }

    /// Marks the stream complete after a producer failure.
    pub fn fail(self, message: impl Into<String>) {
        self.tx.send_replace(Some(Err(message.into())));
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(Err("stream producer dropped before completion".to_string()));
                true
            } else {
                false
            }
        });
    }
}

/// Cloneable write handle of a stream.
#[derive(Debug)]
pub struct StreamWriter<T> {
    tx: mpsc::UnboundedSender<StreamedValue<T>>,
}

impl<T> Clone for StreamWriter<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> StreamWriter<T> {
    /// Writes a value. Returns false if every consumer is gone.
    pub fn send(&self, value: StreamedValue<T>) -> bool {
        self.tx.send(value).is_ok()
    }
}

/// Multi-consumer stream of [`StreamedValue`]s.
#[derive(Debug)]
pub struct ItemStream<T> {
    rx: Arc<Mutex<mpsc::UnboundedReceiver<StreamedValue<T>>>>,
    completion: Completion,
}

impl<T> Clone for ItemStream<T> {
    fn clone(&self) -> Self {
        Self {
            rx: Arc::clone(&self.rx),
            completion: self.completion.clone(),
        }
    }
}

impl<T: Send + 'static> ItemStream<T> {
    /// Creates a stream with its writer and completion signal.
    pub fn channel() -> (StreamWriter<T>, CompletionSignal, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(None);
        (
            StreamWriter { tx },
            CompletionSignal { tx: done_tx },
            Self {
                rx: Arc::new(Mutex::new(rx)),
                completion: Completion { rx: done_rx },
            },
        )
    }

    /// Streams the items of a finite sequence, each marked succeeded.
    pub fn from_iter<I>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        Self::from_fallible_iter(items.into_iter().map(Ok::<T, ItemError>))
    }

    /// Streams a sequence whose enumeration may fail.
    ///
    /// The first error stops the feeder; items already written stay in the
    /// stream and the stream is still completed (with the error recorded).
    pub fn from_fallible_iter<I, E>(items: I) -> Self
    where
        I: IntoIterator<Item = Result<T, E>>,
        I::IntoIter: Send + 'static,
        E: fmt::Display,
    {
        let (writer, signal, stream) = Self::channel();
        let iter = items.into_iter();

        tokio::spawn(async move {
            for next in iter {
                match next {
                    Ok(item) => {
                        if !writer.send(StreamedValue::succeeded(item)) {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Source enumeration failed; completing stream early");
                        drop(writer);
                        signal.fail(e.to_string());
                        return;
                    }
                }
            }
            drop(writer);
            signal.complete();
        });

        stream
    }
}

impl<T> ItemStream<T> {
    /// Receives the next value, or `None` once every writer is gone and the buffer is empty.
    pub async fn recv(&self) -> Option<StreamedValue<T>> {
        let mut rx = self.rx.lock().await;
        rx.recv().await
    }

    /// Completion signal of the producer side.
    pub fn completion(&self) -> Completion {
        self.completion.clone()
    }

    /// Drains the stream, then waits for the producer's completion signal.
    pub async fn collect(self) -> Vec<StreamedValue<T>> {
        let mut values = Vec::new();
        while let Some(value) = self.recv().await {
            values.push(value);
        }
        if let Err(e) = self.completion.wait().await {
            warn!(error = %e, "Stream completed with a producer error");
        }
        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_completion_pending_until_signalled() {
        let (writer, signal, stream) = ItemStream::<u32>::channel();
        let completion = stream.completion();

        let mut wait = tokio_test::task::spawn(async move { completion.wait().await });
        tokio_test::assert_pending!(wait.poll());

        drop(writer);
        signal.complete();
        assert!(wait.is_woken());
        tokio_test::assert_ready_eq!(wait.poll(), Ok(()));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(ExecutionStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(ExecutionStatus::Canceled.to_string(), "canceled");
        assert_eq!(ExecutionStatus::Faulted.to_string(), "faulted");
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&ExecutionStatus::Faulted).unwrap();
        assert_eq!(json, r#""faulted""#);
    }

    #[test]
    fn test_streamed_value_invariants() {
        let ok = StreamedValue::succeeded(1);
        assert!(ok.is_succeeded());
        assert!(ok.error().is_none());

        let faulted = StreamedValue::faulted(2, ItemError::failed("boom"));
        assert_eq!(faulted.status(), ExecutionStatus::Faulted);
        assert!(faulted.error().is_some());

        let skipped = StreamedValue::not_executed(3);
        assert_eq!(skipped.status(), ExecutionStatus::Canceled);
        assert!(skipped.is_not_executed());

        // A canceled value never carries a fault.
        let canceled = StreamedValue::canceled(4, Some(ItemError::failed("not a cancel")));
        assert!(canceled.error().is_none());
    }

    #[tokio::test]
    async fn test_from_iter_delivers_all_then_completes() {
        let stream = ItemStream::from_iter(vec![1, 2, 3]);
        let values = stream.clone().collect().await;

        let items: Vec<_> = values.into_iter().map(StreamedValue::into_item).collect();
        assert_eq!(items, vec![1, 2, 3]);
        assert!(stream.completion().is_complete());
        assert_eq!(stream.completion().wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_failing_feeder_still_completes() {
        let source = vec![Ok(1), Ok(2), Err("disk vanished"), Ok(4)];
        let stream = ItemStream::from_fallible_iter(source);

        let values = stream.clone().collect().await;
        assert_eq!(values.len(), 2);
        assert_eq!(
            stream.completion().wait().await,
            Err("disk vanished".to_string())
        );
    }

    #[tokio::test]
    async fn test_each_value_delivered_once_to_many_consumers() {
        let stream = ItemStream::from_iter(0..200);
        let mut consumers = Vec::new();
        for _ in 0..4 {
            let stream = stream.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(v) = stream.recv().await {
                    seen.push(v.into_item());
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, (0..200).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_consumer_sees_item_before_producer_finishes() {
        let (writer, signal, stream) = ItemStream::channel();
        writer.send(StreamedValue::succeeded("first"));

        let first = tokio::time::timeout(Duration::from_secs(1), stream.recv())
            .await
            .expect("value should be available immediately");
        assert_eq!(first.unwrap().into_item(), "first");
        assert!(!stream.completion().is_complete());

        drop(writer);
        signal.complete();
        assert!(stream.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_signal_marks_failure() {
        let (writer, signal, stream) = ItemStream::<u8>::channel();
        drop(writer);
        drop(signal);
        assert!(stream.completion().wait().await.is_err());
    }
}
