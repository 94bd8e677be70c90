//! Probe transforms for exercising stages in tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::errors::ItemError;
use crate::parallel::BlockTransform;

/// Tracks how many items are inside the transform at the same time.
#[derive(Debug, Default)]
pub struct ConcurrencyProbe {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    calls: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Creates a probe that holds each item for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Highest number of simultaneous items observed.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Number of items the transform ran on.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> BlockTransform<T> for ConcurrencyProbe {
    async fn apply(&self, _item: &mut T, _cancel: &CancellationToken) -> Result<(), ItemError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fails for a fixed set of items and records every item it is applied to.
///
/// Failing items fail at once; the others are held for the configured delay.
#[derive(Debug)]
pub struct FailingTransform<T> {
    fail_on: Vec<T>,
    delay: Duration,
    attempted: Mutex<Vec<T>>,
}

impl<T: Clone + PartialEq> FailingTransform<T> {
    /// Creates a transform failing for every item in `fail_on`.
    #[must_use]
    pub fn new(fail_on: impl IntoIterator<Item = T>) -> Self {
        Self {
            fail_on: fail_on.into_iter().collect(),
            delay: Duration::ZERO,
            attempted: Mutex::new(Vec::new()),
        }
    }

    /// Holds each succeeding item for `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Items the transform was applied to, in call order.
    #[must_use]
    pub fn attempted(&self) -> Vec<T> {
        self.attempted.lock().clone()
    }
}

#[async_trait]
impl<T> BlockTransform<T> for FailingTransform<T>
where
    T: Clone + PartialEq + Debug + Send + Sync + 'static,
{
    async fn apply(&self, item: &mut T, _cancel: &CancellationToken) -> Result<(), ItemError> {
        self.attempted.lock().push(item.clone());
        if self.fail_on.contains(item) {
            return Err(ItemError::failed(format!("item {item:?} failed")));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(())
    }
}

/// Sleeps for each item but gives up as soon as the token fires.
#[derive(Debug)]
pub struct SlowTransform {
    delay: Duration,
    cancelled: AtomicUsize,
}

impl SlowTransform {
    /// Creates a transform holding each item for `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            cancelled: AtomicUsize::new(0),
        }
    }

    /// Number of items that observed cancellation.
    #[must_use]
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Send + 'static> BlockTransform<T> for SlowTransform {
    async fn apply(&self, _item: &mut T, cancel: &CancellationToken) -> Result<(), ItemError> {
        if cancel
            .run_until_cancelled(tokio::time::sleep(self.delay))
            .await
            .is_none()
        {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
            return Err(ItemError::cancelled(cancel.reason().unwrap_or_default()));
        }
        Ok(())
    }
}

/// Never completes and ignores cancellation.
#[derive(Debug, Default)]
pub struct StallingTransform;

#[async_trait]
impl<T: Send + 'static> BlockTransform<T> for StallingTransform {
    async fn apply(&self, _item: &mut T, _cancel: &CancellationToken) -> Result<(), ItemError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Panics for one item and succeeds for the rest.
#[derive(Debug)]
pub struct PanickingTransform<T> {
    panic_on: T,
}

impl<T> PanickingTransform<T> {
    /// Creates a transform panicking on `panic_on`.
    #[must_use]
    pub fn new(panic_on: T) -> Self {
        Self { panic_on }
    }
}

#[async_trait]
impl<T> BlockTransform<T> for PanickingTransform<T>
where
    T: PartialEq + Debug + Send + Sync + 'static,
{
    async fn apply(&self, item: &mut T, _cancel: &CancellationToken) -> Result<(), ItemError> {
        assert!(*item != self.panic_on, "transform exploded on {item:?}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failing_transform_records_attempts() {
        let transform = FailingTransform::new([2u32]);
        let token = CancellationToken::new();

        assert!(transform.apply(&mut 1, &token).await.is_ok());
        assert!(transform.apply(&mut 2, &token).await.is_err());
        assert_eq!(transform.attempted(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transform_observes_cancel() {
        let transform = SlowTransform::new(Duration::from_secs(60));
        let token = CancellationToken::new();
        token.cancel("stop");

        let err = transform.apply(&mut 0u8, &token).await.unwrap_err();
        assert!(err.is_cancellation());
        assert_eq!(transform.cancelled(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_probe_counts() {
        let probe = ConcurrencyProbe::new(Duration::from_millis(5));
        let token = CancellationToken::new();
        probe.apply(&mut 0u8, &token).await.unwrap();
        assert_eq!(probe.calls(), 1);
        assert_eq!(probe.max_in_flight(), 1);
    }
}
