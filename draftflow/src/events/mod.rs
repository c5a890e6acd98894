//! Run lifecycle events.
//!
//! The orchestrator reports lifecycle transitions to an [`EventSink`] in
//! addition to logging them; the event names are listed in
//! [`event_types`].

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the orchestrator.
pub mod event_types {
    /// A run passed configuration checks and created its document.
    pub const RUN_STARTED: &str = "run.started";
    /// A run reached COMPLETE.
    pub const RUN_COMPLETED: &str = "run.completed";
    /// A run reached FAILED.
    pub const RUN_FAILED: &str = "run.failed";
    /// A run reached CANCELLED.
    pub const RUN_CANCELLED: &str = "run.cancelled";
    /// A pass began.
    pub const PASS_STARTED: &str = "pass.started";
    /// A pass ended with a non-optional stage failure.
    pub const PASS_ABORTED: &str = "pass.aborted";
    /// A task was dispatched.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A task succeeded.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A task failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// The quality gate scored the document.
    pub const GATE_EVALUATED: &str = "gate.evaluated";
}
