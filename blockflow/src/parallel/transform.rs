//! Per-item transforms run by a stage.

use crate::cancellation::CancellationToken;
use crate::errors::ItemError;
use crate::stream::StreamedValue;
use async_trait::async_trait;
use std::marker::PhantomData;

/// Work applied to each item of a stage.
///
/// `apply` mutates the item in place. Returning an error whose
/// [`is_cancellation`](ItemError::is_cancellation) is true marks the item
/// canceled; any other error marks it faulted.
#[async_trait]
pub trait BlockTransform<T: Send + 'static>: Send + Sync {
    /// Processes one item.
    async fn apply(&self, item: &mut T, cancel: &CancellationToken) -> Result<(), ItemError>;

    /// Called instead of [`apply`](Self::apply) for items that arrive already
    /// canceled or faulted. The default forwards them unchanged.
    fn on_upstream_failure(&self, value: StreamedValue<T>) -> StreamedValue<T> {
        value
    }
}

/// Adapts a synchronous closure into a [`BlockTransform`].
pub struct FnTransform<T, F> {
    f: F,
    _marker: PhantomData<fn(&mut T)>,
}

impl<T, F> FnTransform<T, F>
where
    F: Fn(&mut T) -> Result<(), ItemError> + Send + Sync,
{
    /// Wraps a closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> BlockTransform<T> for FnTransform<T, F>
where
    T: Send + 'static,
    F: Fn(&mut T) -> Result<(), ItemError> + Send + Sync,
{
    async fn apply(&self, item: &mut T, cancel: &CancellationToken) -> Result<(), ItemError> {
        if cancel.is_cancelled() {
            return Err(ItemError::cancelled(cancel.reason().unwrap_or_default()));
        }
        (self.f)(item)
    }
}
