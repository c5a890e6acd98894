//! Core domain model types for draftflow.
//!
//! This module contains the runtime records exchanged between components:
//! - Tasks and their results
//! - Router messages
//! - Run phase and terminal state enums

mod message;
mod status;
mod task;

pub use message::{Message, MessageType};
pub use status::{RunPhase, TerminalState};
pub use task::{ErrorKind, ResultMetrics, Task, TaskResult};
