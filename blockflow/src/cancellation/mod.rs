//! Cooperative cancellation.
//!
//! A single [`CancellationToken`] is shared by a whole top-level operation.
//! Each stage derives child tokens from it so that a stage can stop itself
//! without cancelling its siblings.

mod token;

pub use token::{CancelCallback, CancellationToken};
