//! Backup blocks and the collaborators that process them.

use crate::cancellation::CancellationToken;
use crate::errors::ItemError;
use crate::scheduler::{ClassifiedBlock, RestoreChain, SourceBlock};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One file or folder to back up, plus what the stages produced for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSource {
    /// Stable identity used to match history.
    pub key: String,
    /// Path of the source.
    pub path: PathBuf,
    /// Working directory set up by the prepare stage.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    /// Archive written by the compress stage.
    #[serde(default)]
    pub archive: Option<ArchiveArtifact>,
    /// Where the upload stage stored the archive.
    #[serde(default)]
    pub remote_location: Option<String>,
}

impl BackupSource {
    /// Creates a source with nothing produced yet.
    #[must_use]
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            staging_dir: None,
            archive: None,
            remote_location: None,
        }
    }
}

impl SourceBlock for BackupSource {
    fn source_key(&self) -> &str {
        &self.key
    }
}

/// A compressed archive on local disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveArtifact {
    /// Archive path.
    pub path: PathBuf,
    /// Archive size.
    pub size_bytes: u64,
}

/// The unit of work flowing through a backup pipeline.
pub type BackupBlock = ClassifiedBlock<BackupSource>;

/// Builds archives. Usually shells out to an external compressor.
#[async_trait]
pub trait ArchiveBuilder: Send + Sync {
    /// Sets up whatever the compressor needs, such as a snapshot or staging dir.
    async fn prepare(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError>;

    /// Writes the FULL or DIFF archive and stores it in `block.archive`.
    async fn compress(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError>;
}

/// Removes intermediate files between compression and upload.
#[async_trait]
pub trait ArchiveCleaner: Send + Sync {
    /// Cleans up after a block that compressed successfully.
    async fn cleanup(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError>;

    /// Called for blocks that failed or were skipped upstream. Must not block.
    fn discard(&self, _block: &BackupBlock) {}
}

/// Stores archives remotely.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Uploads the block's archive and returns its remote location.
    ///
    /// Called again with the next `attempt` number while the retry budget lasts.
    async fn upload(
        &self,
        block: &BackupBlock,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Result<String, ItemError>;
}

/// Restores one chain of archives.
#[async_trait]
pub trait Restorer: Send + Sync {
    /// Applies the FULL and then each DIFF of the chain.
    async fn restore(&self, chain: &mut RestoreChain, cancel: &CancellationToken) -> Result<(), ItemError>;
}
