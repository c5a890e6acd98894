//! Iteration control: passes, quality gate, terminal states.
//!
//! An [`Orchestrator`] owns the shared pool, router and store. Each run gets
//! its own controller task, which schedules stages as soon as their
//! dependencies complete, scores the document after every pass and either
//! completes, iterates with feedback, fails or stops on cancellation.

mod controller;
mod engine;
mod outcome;


pub use controller::QUALITY_SCORE_KEY;
pub use engine::{Orchestrator, RunHandle};
pub use outcome::{BestDocument, RunOutcome};
