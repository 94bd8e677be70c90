//! Restore chain planning.

use super::history::BackupMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// One archive known to exist in storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    /// Source identity.
    pub source_key: String,
    /// Archive kind.
    pub mode: BackupMode,
    /// When the archive was taken.
    pub created_at: DateTime<Utc>,
    /// Stored size.
    pub size_bytes: u64,
    /// Where the archive can be fetched from.
    pub location: String,
}

/// Everything needed to restore one source: a FULL and the DIFFs stacked on it.
///
/// Restored as one unit of work so the archives are applied in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreChain {
    /// Source identity.
    pub source_key: String,
    /// The base archive.
    pub full: ArchiveRecord,
    /// DIFFs after `full`, oldest first.
    pub diffs: Vec<ArchiveRecord>,
}

impl RestoreChain {
    /// Combined size of every archive in the chain.
    #[must_use]
    pub fn total_size_bytes(&self) -> u64 {
        self.diffs
            .iter()
            .fold(self.full.size_bytes, |total, d| total.saturating_add(d.size_bytes))
    }

    /// Archives in the order they must be applied.
    pub fn archives(&self) -> impl Iterator<Item = &ArchiveRecord> {
        std::iter::once(&self.full).chain(self.diffs.iter())
    }
}

/// A source that cannot be restored as of the requested time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreGap {
    /// Source identity.
    pub source_key: String,
    /// Why no chain could be built.
    pub reason: String,
}

/// Restore chains and gaps for one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestorePlan {
    /// Chains, largest first.
    pub chains: Vec<RestoreChain>,
    /// Sources without a usable FULL.
    pub gaps: Vec<RestoreGap>,
}

/// Builds one restore chain per source as of `as_of`.
///
/// The chain starts at the latest FULL taken at or before `as_of` and carries
/// every later DIFF up to `as_of`, oldest first. Chains are ordered by
/// descending total size; sources without such a FULL become gaps.
#[must_use]
pub fn prepare_decompression_blocks(records: Vec<ArchiveRecord>, as_of: DateTime<Utc>) -> RestorePlan {
    let mut by_source: BTreeMap<String, Vec<ArchiveRecord>> = BTreeMap::new();
    for record in records {
        by_source.entry(record.source_key.clone()).or_default().push(record);
    }

    let mut plan = RestorePlan::default();
    for (source_key, mut archives) in by_source {
        archives.retain(|a| a.created_at <= as_of);
        archives.sort_by_key(|a| a.created_at);

        let Some(base) = archives.iter().rposition(|a| a.mode == BackupMode::Full) else {
            let reason = if archives.is_empty() {
                format!("no archive at or before {as_of}")
            } else {
                format!("only DIFF archives at or before {as_of}")
            };
            warn!(key = %source_key, reason = %reason, "Source cannot be restored");
            plan.gaps.push(RestoreGap { source_key, reason });
            continue;
        };

        let mut tail = archives.split_off(base);
        let full = tail.remove(0);
        let diffs: Vec<_> = tail.into_iter().filter(|a| a.mode == BackupMode::Diff).collect();
        debug!(key = %source_key, diffs = diffs.len(), "Restore chain built");
        plan.chains.push(RestoreChain {
            source_key,
            full,
            diffs,
        });
    }

    plan.chains
        .sort_by(|a, b| b.total_size_bytes().cmp(&a.total_size_bytes()));
    plan
}
