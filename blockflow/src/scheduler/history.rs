//! Backup history index.

use crate::errors::HistoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of archive produced for a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    /// Complete archive of the source.
    Full,
    /// Changes since the latest checkpoint.
    Diff,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Diff => write!(f, "diff"),
        }
    }
}

impl FromStr for BackupMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "diff" => Ok(Self::Diff),
            other => Err(format!("unknown backup mode '{other}'")),
        }
    }
}

/// What the history index knows about one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the latest FULL archive was taken.
    pub last_full_date: DateTime<Utc>,
    /// When the latest DIFF after that FULL was taken.
    #[serde(default)]
    pub last_diff_date: Option<DateTime<Utc>>,
    /// Size of the latest FULL archive; only a scheduling hint.
    #[serde(default)]
    pub last_full_size_bytes: Option<u64>,
}

impl HistoryEntry {
    /// Creates an entry for a FULL archive.
    #[must_use]
    pub fn full(at: DateTime<Utc>, size_bytes: Option<u64>) -> Self {
        Self {
            last_full_date: at,
            last_diff_date: None,
            last_full_size_bytes: size_bytes,
        }
    }

    /// Sets the latest DIFF date.
    #[must_use]
    pub fn with_last_diff(mut self, at: DateTime<Utc>) -> Self {
        self.last_diff_date = Some(at);
        self
    }

    /// The checkpoint a new DIFF is taken against: the later of the last FULL and last DIFF.
    #[must_use]
    pub fn latest_checkpoint(&self) -> DateTime<Utc> {
        self.last_diff_date
            .map_or(self.last_full_date, |diff| diff.max(self.last_full_date))
    }
}

/// Read side of the history index.
///
/// `Ok(None)` means the source was never backed up; `Err` means the index
/// could not be read. The scheduler treats these differently.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HistoryLookup: Send + Sync {
    /// Looks up the history of one source.
    async fn lookup(&self, source_key: &str) -> Result<Option<HistoryEntry>, HistoryError>;
}

/// Write side of the history index, called once a block has been uploaded.
#[async_trait]
pub trait HistoryRecorder: Send + Sync {
    /// Records a completed archive.
    async fn record(
        &self,
        source_key: &str,
        mode: BackupMode,
        completed_at: DateTime<Utc>,
        size_bytes: Option<u64>,
    ) -> Result<(), HistoryError>;
}

/// History index held in memory.
#[derive(Debug, Default)]
pub struct InMemoryHistory {
    entries: DashMap<String, HistoryEntry>,
}

impl InMemoryHistory {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry of a source.
    pub fn insert(&self, source_key: impl Into<String>, entry: HistoryEntry) {
        self.entries.insert(source_key.into(), entry);
    }

    /// Returns the entry of a source.
    #[must_use]
    pub fn get(&self, source_key: &str) -> Option<HistoryEntry> {
        self.entries.get(source_key).map(|e| e.value().clone())
    }

    /// Number of sources with history.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no source has history.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl HistoryLookup for InMemoryHistory {
    async fn lookup(&self, source_key: &str) -> Result<Option<HistoryEntry>, HistoryError> {
        Ok(self.get(source_key))
    }
}

#[async_trait]
impl HistoryRecorder for InMemoryHistory {
    async fn record(
        &self,
        source_key: &str,
        mode: BackupMode,
        completed_at: DateTime<Utc>,
        size_bytes: Option<u64>,
    ) -> Result<(), HistoryError> {
        match mode {
            BackupMode::Full => {
                self.insert(source_key, HistoryEntry::full(completed_at, size_bytes));
            }
            BackupMode::Diff => {
                let mut entry =
                    self.entries
                        .get_mut(source_key)
                        .ok_or_else(|| HistoryError::Corrupt {
                            key: source_key.to_string(),
                            reason: "DIFF recorded without a FULL".to_string(),
                        })?;
                entry.last_diff_date = Some(completed_at);
            }
        }
        Ok(())
    }
}
