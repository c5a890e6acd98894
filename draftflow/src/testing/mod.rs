//! Test doubles for draftflow runs.
//!
//! This module provides:
//! - Scripted capabilities and quality gates
//! - Recording and failing message handlers

mod recording;
mod scripted;

pub use recording::{FailingHandler, RecordingHandler};
pub use scripted::{ScriptedCapability, ScriptedQualityGate};
