//! Versioned shared state: the document and the run bookkeeping.

mod document;
mod run_state;
mod snapshot;
mod store;

pub use document::{ChangeAction, DocumentState, StateChange};
pub use run_state::{FeedbackEntry, RunStatus, StageFailure, WorkflowRunState};
pub use snapshot::SnapshotBlob;
pub use store::{RestoreRecord, VersionedStateStore};
