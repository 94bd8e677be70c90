//! Incremental scheduling of backup and restore work.
//!
//! [`classify`] decides FULL or DIFF for every candidate block and streams the
//! blocks largest-first. [`prepare_decompression_blocks`] turns archive records
//! into one restore chain per source.

mod classify;
mod history;
mod restore;

pub use classify::{
    classify, classify_with_sink, Classification, ClassifiedBlock, HistoryErrorPolicy,
    ScheduleHandle, ScheduleOptions, ScheduleSummary, ScheduleWarning, SourceBlock,
};
pub use history::{BackupMode, HistoryEntry, HistoryLookup, HistoryRecorder, InMemoryHistory};
pub use restore::{
    prepare_decompression_blocks, ArchiveRecord, RestoreChain, RestoreGap, RestorePlan,
};

#[cfg(test)]
pub use history::MockHistoryLookup;
