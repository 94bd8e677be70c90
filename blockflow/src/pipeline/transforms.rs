//! Stage transforms wrapping the backup collaborators.

use super::block::{ArchiveBuilder, ArchiveCleaner, BackupBlock, Restorer, Uploader};
use crate::cancellation::CancellationToken;
use crate::errors::ItemError;
use crate::parallel::BlockTransform;
use crate::retry::{with_retry, RetryConfig};
use crate::scheduler::RestoreChain;
use crate::stream::StreamedValue;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct PrepareTransform(pub(crate) Arc<dyn ArchiveBuilder>);

#[async_trait]
impl BlockTransform<BackupBlock> for PrepareTransform {
    async fn apply(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError> {
        self.0.prepare(block, cancel).await
    }
}

pub(crate) struct CompressTransform(pub(crate) Arc<dyn ArchiveBuilder>);

#[async_trait]
impl BlockTransform<BackupBlock> for CompressTransform {
    async fn apply(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError> {
        self.0.compress(block, cancel).await?;
        if block.block().archive.is_none() {
            return Err(ItemError::failed(format!(
                "compressor produced no archive for '{}'",
                block.block().key
            )));
        }
        Ok(())
    }
}

pub(crate) struct CleanupTransform(pub(crate) Arc<dyn ArchiveCleaner>);

#[async_trait]
impl BlockTransform<BackupBlock> for CleanupTransform {
    async fn apply(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError> {
        self.0.cleanup(block, cancel).await
    }

    fn on_upstream_failure(&self, value: StreamedValue<BackupBlock>) -> StreamedValue<BackupBlock> {
        self.0.discard(value.item());
        value
    }
}

/// Uploads with its own retry policy per block.
pub(crate) struct UploadTransform {
    pub(crate) uploader: Arc<dyn Uploader>,
    pub(crate) retry: RetryConfig,
}

#[async_trait]
impl BlockTransform<BackupBlock> for UploadTransform {
    async fn apply(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError> {
        let policy = self.retry.policy().map_err(|e| ItemError::failed(e.to_string()))?;
        let key = block.block().key.clone();
        let uploader = self.uploader.as_ref();
        let source: &BackupBlock = block;

        let location = with_retry(policy, cancel, &key, |attempt| uploader.upload(source, attempt, cancel)).await?;

        debug!(key = %key, location = %location, "Archive uploaded");
        block.block_mut().remote_location = Some(location);
        Ok(())
    }
}

pub(crate) struct RestoreTransform(pub(crate) Arc<dyn Restorer>);

#[async_trait]
impl BlockTransform<RestoreChain> for RestoreTransform {
    async fn apply(&self, chain: &mut RestoreChain, cancel: &CancellationToken) -> Result<(), ItemError> {
        self.0.restore(chain, cancel).await
    }
}
