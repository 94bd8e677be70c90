//! Backup and restore pipelines.
//!
//! A backup run wires the scheduler to four stages, each connected to the
//! next by an item stream:
//!
//! ```text
//! classify -> prepare -> compress -> cleanup -> upload -> collect
//! ```
//!
//! Blocks that fail in one stage keep flowing as faulted values, so cleanup
//! can discard partial archives and upload skips them.

mod backup;
mod block;
mod report;
mod restore;
mod transforms;

pub use backup::{BackupPipeline, BackupPipelineBuilder, PipelineConfig, STAGES};
pub use block::{
    ArchiveArtifact, ArchiveBuilder, ArchiveCleaner, BackupBlock, BackupSource, Restorer, Uploader,
};
pub use report::{BackupReport, RestoreReport};
pub use restore::RestorePipeline;

use crate::stream::{ItemStream, StreamedValue};

/// Drains the last stream of a pipeline.
///
/// Returns only after the producing stage has signalled completion, never on
/// a premature end of stream.
pub async fn collect<T>(stream: ItemStream<T>) -> Vec<StreamedValue<T>> {
    stream.collect().await
}
