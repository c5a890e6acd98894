//! What a finished run reports.

use crate::core::TerminalState;
use crate::state::{DocumentState, FeedbackEntry, SnapshotBlob, StageFailure};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The highest-scoring document a run reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestDocument {
    /// The pass that produced it.
    pub iteration: u32,
    /// Its gate score.
    pub score: f64,
    /// The document as scored.
    pub document: DocumentState,
    /// A restorable snapshot of it.
    pub snapshot: SnapshotBlob,
}

/// The result of one run.
///
/// Always carries a document, even for failed and cancelled runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    /// The run id.
    pub run_id: String,
    /// The workflow name.
    pub workflow: String,
    /// How the run ended.
    pub state: TerminalState,
    /// Passes started.
    pub iterations: u32,
    /// Gate score of the last evaluated pass.
    pub final_score: Option<f64>,
    /// The document when the run ended.
    pub document: DocumentState,
    /// The best-scoring document, if any pass was scored.
    pub best: Option<BestDocument>,
    /// Stages completed in the last pass.
    pub completed_stages: Vec<String>,
    /// Stage-reported quality scores.
    pub quality_scores: BTreeMap<String, f64>,
    /// Gate score per scored pass.
    pub gate_scores: Vec<f64>,
    /// Feedback handed to later passes.
    pub feedback_history: Vec<FeedbackEntry>,
    /// Every stage failure of the run.
    pub failures: Vec<StageFailure>,
    /// Gate errors, deadlocks and other run-level problems.
    pub diagnostics: Vec<String>,
    /// Wall-clock duration.
    pub duration_ms: f64,
}

impl RunOutcome {
    /// Returns true if the quality threshold was met.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == TerminalState::Complete
    }

    /// A compact JSON summary for logs and events.
    #[must_use]
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "run_id": self.run_id,
            "workflow": self.workflow,
            "state": self.state,
            "iterations": self.iterations,
            "final_score": self.final_score,
            "best_score": self.best.as_ref().map(|b| b.score),
            "document_version": self.document.version,
            "failures": self.failures.len(),
            "diagnostics": self.diagnostics.len(),
            "duration_ms": self.duration_ms,
        })
    }
}
