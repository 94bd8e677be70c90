//! Fixtures for backup pipeline tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::errors::ItemError;
use crate::pipeline::{ArchiveArtifact, ArchiveBuilder, ArchiveCleaner, BackupBlock, BackupSource, Restorer, Uploader};
use crate::scheduler::{ArchiveRecord, BackupMode, Classification, ClassifiedBlock, HistoryEntry, RestoreChain};

/// A classified block for `key` with nothing produced yet.
#[must_use]
pub fn backup_block(key: &str, mode: BackupMode) -> BackupBlock {
    ClassifiedBlock::new(
        BackupSource::new(key, format!("/data/{key}")),
        Classification {
            source_key: key.to_string(),
            backup_mode: mode,
            diff_since: None,
            historical_full_size: None,
        },
    )
}

/// History of a source whose last FULL was taken at `at`.
#[must_use]
pub fn history_entry(at: DateTime<Utc>, size_bytes: u64) -> HistoryEntry {
    HistoryEntry::full(at, Some(size_bytes))
}

/// An archive record stored under `<key>/<timestamp>`.
#[must_use]
pub fn archive_record(key: &str, mode: BackupMode, created_at: DateTime<Utc>, size_bytes: u64) -> ArchiveRecord {
    ArchiveRecord {
        source_key: key.to_string(),
        mode,
        created_at,
        size_bytes,
        location: format!("{key}/{}", created_at.timestamp()),
    }
}

/// Archive builder and cleaner that only touches block fields.
///
/// Compression of a key listed in `fail_on` fails; every other key gets an
/// archive of the configured size.
#[derive(Debug, Default)]
pub struct StubArchiver {
    fail_on: HashSet<String>,
    sizes: HashMap<String, u64>,
    delay: Duration,
    compressed: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
}

impl StubArchiver {
    /// Creates an archiver where every block compresses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes compression of `key` fail.
    #[must_use]
    pub fn failing(mut self, key: &str) -> Self {
        self.fail_on.insert(key.to_string());
        self
    }

    /// Sets the archive size produced for `key`.
    #[must_use]
    pub fn with_size(mut self, key: &str, size_bytes: u64) -> Self {
        self.sizes.insert(key.to_string(), size_bytes);
        self
    }

    /// Holds each compression for `delay`.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Keys compressed, in completion order.
    #[must_use]
    pub fn compressed(&self) -> Vec<String> {
        self.compressed.lock().clone()
    }

    /// Keys discarded after an upstream failure.
    #[must_use]
    pub fn discarded(&self) -> Vec<String> {
        self.discarded.lock().clone()
    }
}

#[async_trait]
impl ArchiveBuilder for StubArchiver {
    async fn prepare(&self, block: &mut BackupBlock, _cancel: &CancellationToken) -> Result<(), ItemError> {
        let key = block.block().key.clone();
        block.block_mut().staging_dir = Some(PathBuf::from(format!("/tmp/blockflow/{key}")));
        Ok(())
    }

    async fn compress(&self, block: &mut BackupBlock, cancel: &CancellationToken) -> Result<(), ItemError> {
        let key = block.block().key.clone();
        if !self.delay.is_zero() && cancel.run_until_cancelled(tokio::time::sleep(self.delay)).await.is_none() {
            return Err(ItemError::cancelled(cancel.reason().unwrap_or_default()));
        }
        if self.fail_on.contains(&key) {
            return Err(ItemError::command_failed(
                format!("7z a {key}.7z /data/{key}"),
                Some(2),
                "fatal error",
            ));
        }
        let suffix = match block.backup_mode() {
            BackupMode::Full => "full",
            BackupMode::Diff => "diff",
        };
        block.block_mut().archive = Some(ArchiveArtifact {
            path: PathBuf::from(format!("/tmp/blockflow/{key}.{suffix}.7z")),
            size_bytes: self.sizes.get(&key).copied().unwrap_or(1024),
        });
        self.compressed.lock().push(key);
        Ok(())
    }
}

#[async_trait]
impl ArchiveCleaner for StubArchiver {
    async fn cleanup(&self, block: &mut BackupBlock, _cancel: &CancellationToken) -> Result<(), ItemError> {
        block.block_mut().staging_dir = None;
        Ok(())
    }

    fn discard(&self, block: &BackupBlock) {
        self.discarded.lock().push(block.block().key.clone());
    }
}

/// Uploader that fails a configurable number of attempts per key.
#[derive(Debug, Default)]
pub struct RecordingUploader {
    transient_failures: HashMap<String, u32>,
    always_fail: HashSet<String>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl RecordingUploader {
    /// Creates an uploader where every upload succeeds first time.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the first `attempts` uploads of `key`.
    #[must_use]
    pub fn flaky(mut self, key: &str, attempts: u32) -> Self {
        self.transient_failures.insert(key.to_string(), attempts);
        self
    }

    /// Fails every upload of `key`.
    #[must_use]
    pub fn broken(mut self, key: &str) -> Self {
        self.always_fail.insert(key.to_string());
        self
    }

    /// Number of upload attempts made for `key`.
    #[must_use]
    pub fn attempts(&self, key: &str) -> u32 {
        self.attempts.lock().get(key).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Uploader for RecordingUploader {
    async fn upload(
        &self,
        block: &BackupBlock,
        attempt: u32,
        _cancel: &CancellationToken,
    ) -> Result<String, ItemError> {
        let key = block.block().key.clone();
        *self.attempts.lock().entry(key.clone()).or_default() += 1;

        if self.always_fail.contains(&key) {
            return Err(ItemError::failed(format!("remote rejected {key}")));
        }
        if attempt <= self.transient_failures.get(&key).copied().unwrap_or(0) {
            return Err(ItemError::failed(format!("connection reset uploading {key}")));
        }
        Ok(format!("remote://bucket/{key}"))
    }
}

/// Restorer that records every chain it applies.
#[derive(Debug, Default)]
pub struct RecordingRestorer {
    fail_on: HashSet<String>,
    restored: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingRestorer {
    /// Creates a restorer where every chain restores.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes restoring `key` fail.
    #[must_use]
    pub fn failing(mut self, key: &str) -> Self {
        self.fail_on.insert(key.to_string());
        self
    }

    /// Restored sources with the archive locations applied, in order.
    #[must_use]
    pub fn restored(&self) -> Vec<(String, Vec<String>)> {
        self.restored.lock().clone()
    }
}

#[async_trait]
impl Restorer for RecordingRestorer {
    async fn restore(&self, chain: &mut RestoreChain, _cancel: &CancellationToken) -> Result<(), ItemError> {
        if self.fail_on.contains(&chain.source_key) {
            return Err(ItemError::failed(format!("checksum mismatch in {}", chain.full.location)));
        }
        let applied = chain.archives().map(|a| a.location.clone()).collect();
        self.restored.lock().push((chain.source_key.clone(), applied));
        Ok(())
    }
}
