//! # Blockflow
//!
//! An incremental block backup engine built on a pipelined, concurrent stage
//! executor.
//!
//! Blockflow provides:
//!
//! - **Parallel stages**: bounded worker pools connected by item streams, with
//!   `Default`, `Fast` and `Smart` fail modes
//! - **Incremental scheduling**: FULL/DIFF classification from backup history,
//!   largest blocks first
//! - **Restore planning**: one FULL plus its DIFFs per source
//! - **Retry**: linear backoff with jitter inside a time budget
//! - **Cancellation**: one token per run, observed by every stage
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use blockflow::prelude::*;
//!
//! let pipeline = BackupPipeline::builder()
//!     .archive_builder(archiver.clone())
//!     .cleaner(archiver)
//!     .uploader(uploader)
//!     .history_recorder(history.clone())
//!     .build()?;
//!
//! let report = pipeline.run(sources, history, None, &CancellationToken::new()).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod errors;
pub mod events;
pub mod observability;
pub mod parallel;
pub mod pipeline;
pub mod retry;
pub mod scheduler;
pub mod stream;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{BlockflowConfig, StageConfig};
    pub use crate::errors::{BlockflowError, ConfigError, HistoryError, ItemError, PipelineError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::{init_tracing, LoggingConfig};
    pub use crate::parallel::{
        run_stage, BlockTransform, FailMode, FnTransform, ParallelOptions, StageHandle,
        StageSummary,
    };
    pub use crate::pipeline::{
        ArchiveArtifact, ArchiveBuilder, ArchiveCleaner, BackupBlock, BackupPipeline,
        BackupReport, BackupSource, PipelineConfig, RestorePipeline, RestoreReport, Restorer,
        Uploader,
    };
    pub use crate::retry::{with_retry, RetryConfig, RetryPolicy};
    pub use crate::scheduler::{
        classify, prepare_decompression_blocks, ArchiveRecord, BackupMode, ClassifiedBlock,
        HistoryEntry, HistoryErrorPolicy, HistoryLookup, HistoryRecorder, InMemoryHistory,
        RestoreChain, ScheduleOptions, SourceBlock,
    };
    pub use crate::stream::{ItemStream, StreamWriter, StreamedValue};
}
