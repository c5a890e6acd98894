//! # Draftflow
//!
//! A stage-dependency workflow engine with quality-gated iteration.
//!
//! A workflow is a DAG of named stages, each bound to an external
//! capability. Draftflow runs the stages as soon as their dependencies
//! complete, bounds concurrent capability calls with a resource pool,
//! retries transient failures, routes results through an in-process
//! message router and commits document changes to a versioned store. After
//! every pass a quality gate scores the document; the run completes, loops
//! with feedback, fails once its iteration budget is spent, or stops on
//! cancellation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use draftflow::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(gate: Arc<dyn QualityGate>) -> Result<(), EngineError> {
//! let registry = CapabilityRegistry::new();
//! for id in ["research", "writing"] {
//!     registry.register(
//!         id,
//!         capability_fn(|request| async move {
//!             Ok(CapabilityOutput::new(request.payload.clone()).with_document(request.payload))
//!         }),
//!     )?;
//! }
//!
//! let workflow = WorkflowBuilder::new("brief")
//!     .add_stage("research", "research", &[])
//!     .add_stage("write", "writing", &["research"])
//!     .build()?;
//!
//! let orchestrator = Orchestrator::new(EngineConfig::default(), Arc::new(registry), gate)?;
//! let outcome = orchestrator
//!     .run(Arc::new(workflow), serde_json::json!("rust ownership"), RunOptions::new())
//!     .await?;
//! println!("{} after {} passes", outcome.state, outcome.iterations);
//! # Ok(())
//! # }
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
pub mod capability;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod observability;
pub mod orchestrator;
pub mod resources;
pub mod router;
pub mod state;
pub mod testing;
pub mod utils;
pub mod workflow;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::capability::{
        capability_fn, Capability, CapabilityError, CapabilityErrorKind, CapabilityOutput,
        CapabilityRegistry, CapabilityRequest, QualityGate,
    };
    pub use crate::config::{EngineConfig, RunOptions};
    pub use crate::core::{
        ErrorKind, Message, MessageType, RunPhase, Task, TaskResult, TerminalState,
    };
    pub use crate::errors::{
        ConfigurationError, CycleDetectedError, DeadlockError, EngineError, StateError,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{RetryConfig, StageExecutor};
    pub use crate::orchestrator::{Orchestrator, RunHandle, RunOutcome};
    pub use crate::resources::ResourcePool;
    pub use crate::router::{handler_fn, MessageHandler, MessageRouter, Topic};
    pub use crate::state::{DocumentState, RunStatus, SnapshotBlob, VersionedStateStore};
    pub use crate::workflow::{Stage, Workflow, WorkflowBuilder, WorkflowCatalog};
}
