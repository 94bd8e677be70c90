//! Testing utilities for blockflow stages and pipelines.
//!
//! This module provides:
//! - Probe transforms (concurrency, failures, slow and stalled items)
//! - Assertions over stage output
//! - Block and history fixtures

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_all_succeeded, assert_status_count, count_status, sorted_items};
pub use fixtures::{
    archive_record, backup_block, history_entry, RecordingRestorer, RecordingUploader, StubArchiver,
};
pub use mocks::{
    ConcurrencyProbe, FailingTransform, PanickingTransform, SlowTransform, StallingTransform,
};
