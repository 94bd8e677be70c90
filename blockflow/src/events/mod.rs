//! Lifecycle events emitted by stages and pipelines.
//!
//! Stages pick up the process-wide sink installed with [`set_event_sink`]
//! unless one is passed explicitly.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use parking_lot::RwLock;
use std::sync::Arc;

/// A stage spawned its workers.
pub const STAGE_STARTED: &str = "stage.started";
/// Every worker of a stage finished.
pub const STAGE_COMPLETED: &str = "stage.completed";
/// A transform failed for one item.
pub const ITEM_FAULTED: &str = "item.faulted";
/// The scheduler classified every candidate.
pub const SCHEDULE_COMPLETED: &str = "schedule.completed";
/// History could not be read for a source.
pub const HISTORY_UNAVAILABLE: &str = "schedule.history_unavailable";
/// A backup or restore run finished.
pub const RUN_COMPLETED: &str = "run.completed";

static GLOBAL_EVENT_SINK: RwLock<Option<Arc<dyn EventSink>>> = RwLock::new(None);

/// Sets the process-wide event sink.
pub fn set_event_sink(sink: Arc<dyn EventSink>) {
    *GLOBAL_EVENT_SINK.write() = Some(sink);
}

/// Clears the process-wide event sink.
pub fn clear_event_sink() {
    *GLOBAL_EVENT_SINK.write() = None;
}

/// Gets the process-wide event sink, or a [`NoOpEventSink`] if none is set.
pub fn get_event_sink() -> Arc<dyn EventSink> {
    GLOBAL_EVENT_SINK
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(NoOpEventSink))
}
