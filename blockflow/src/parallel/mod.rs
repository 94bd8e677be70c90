//! Bounded-parallelism stage execution.
//!
//! A stage pulls items from an [`ItemStream`](crate::stream::ItemStream),
//! applies a [`BlockTransform`] to each on up to `max_parallelism` workers and
//! writes every outcome to its output stream. [`FailMode`] decides whether a
//! fault stops the stage early and how the stage reports failure:
//!
//! | Mode | Stops on fault | Stage result |
//! |---|---|---|
//! | `Default` | no | `Err` on any fault or cancellation |
//! | `Fast` | yes | `Ok(StageSummary)` |
//! | `Smart` | no | `Ok(StageSummary)` |
//!
//! External cancellation stops every mode from pulling new items.

mod context;
mod options;
mod summary;
mod transform;
mod worker;

pub use context::{ParallelizeCore, Tally};
pub use options::{FailMode, ParallelOptions};
pub use summary::StageSummary;
pub use transform::{BlockTransform, FnTransform};
pub use worker::{run_stage, run_stage_with_sink, StageHandle};
