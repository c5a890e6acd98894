//! Per-run bookkeeping owned by the iteration controller.

use crate::core::{ErrorKind, RunPhase};
use crate::utils::{now, Timestamp};
use crate::workflow::Workflow;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A stage failure kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageFailure {
    /// The failed stage.
    pub stage: String,
    /// The pass it failed in.
    pub iteration: u32,
    /// Failure classification.
    pub kind: ErrorKind,
    /// Failure message.
    pub message: String,
    /// Whether the stage was optional (its failure did not abort the pass).
    pub optional: bool,
}

/// Feedback produced after a failed gate check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackEntry {
    /// The pass that was evaluated.
    pub iteration: u32,
    /// The gate score of that pass.
    pub score: f64,
    /// Gate-generated feedback.
    pub feedback: serde_json::Value,
}

/// A lightweight view of a run for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    /// The run id.
    pub run_id: String,
    /// Current phase.
    pub phase: RunPhase,
    /// Current pass (0 before the first pass starts).
    pub iteration: u32,
    /// Stages completed in the current pass.
    pub completed_stages: Vec<String>,
    /// Stages still pending in the current pass.
    pub pending_stages: Vec<String>,
    /// Gate score of each finished pass.
    pub gate_scores: Vec<f64>,
}

/// Mutable state of one workflow run.
///
/// `completed_stages` and `pending_stages` describe the current pass and
/// are reset when a new pass begins; failures, gate scores and feedback
/// accumulate over the whole run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunState {
    /// The run id.
    pub run_id: String,
    /// The workflow name.
    pub workflow: String,
    /// Current phase.
    pub phase: RunPhase,
    /// Current pass, 1-based once running.
    pub iteration: u32,
    /// Stages completed in the current pass.
    pub completed_stages: BTreeSet<String>,
    /// Stages not yet completed in the current pass.
    pub pending_stages: BTreeSet<String>,
    /// Stages that failed in the current pass.
    pub failed_stages: BTreeSet<String>,
    /// Stage-reported quality scores, last value wins.
    pub quality_scores: BTreeMap<String, f64>,
    /// Gate score per finished pass.
    pub gate_scores: Vec<f64>,
    /// Feedback per failed gate check.
    pub feedback_history: Vec<FeedbackEntry>,
    /// Every stage failure of the run.
    pub failures: Vec<StageFailure>,
    /// When the run started.
    pub started_at: Timestamp,
    /// When the state last changed.
    pub updated_at: Timestamp,
}

impl WorkflowRunState {
    /// Creates the state for a new run.
    #[must_use]
    pub fn new(run_id: impl Into<String>, workflow: &Workflow) -> Self {
        let started_at = now();
        Self {
            run_id: run_id.into(),
            workflow: workflow.name().to_string(),
            phase: RunPhase::Initializing,
            iteration: 0,
            completed_stages: BTreeSet::new(),
            pending_stages: workflow.stage_names().into_iter().collect(),
            failed_stages: BTreeSet::new(),
            quality_scores: BTreeMap::new(),
            gate_scores: Vec::new(),
            feedback_history: Vec::new(),
            failures: Vec::new(),
            started_at,
            updated_at: started_at,
        }
    }

    /// Starts pass `iteration` with every stage pending.
    pub fn begin_pass(&mut self, iteration: u32, workflow: &Workflow) {
        self.iteration = iteration;
        self.completed_stages.clear();
        self.failed_stages.clear();
        self.pending_stages = workflow.stage_names().into_iter().collect();
        self.set_phase(RunPhase::Running { pass: iteration });
    }

    /// Moves to a new phase.
    pub fn set_phase(&mut self, phase: RunPhase) {
        self.phase = phase;
        self.touch();
    }

    /// Marks a stage as completed, recording its quality score if given.
    pub fn complete_stage(&mut self, stage: &str, quality_score: Option<f64>) {
        self.pending_stages.remove(stage);
        self.completed_stages.insert(stage.to_string());
        if let Some(score) = quality_score {
            self.quality_scores.insert(stage.to_string(), score);
        }
        self.touch();
    }

    /// Records a failure.
    ///
    /// Optional stages still count as completed for scheduling; other
    /// stages stay out of `completed_stages`.
    pub fn fail_stage(&mut self, failure: StageFailure) {
        self.pending_stages.remove(&failure.stage);
        self.failed_stages.insert(failure.stage.clone());
        if failure.optional {
            self.completed_stages.insert(failure.stage.clone());
        }
        self.failures.push(failure);
        self.touch();
    }

    /// Records the gate score of the current pass.
    pub fn record_gate_score(&mut self, score: f64) {
        self.gate_scores.push(score);
        self.touch();
    }

    /// Records feedback for the current pass.
    pub fn record_feedback(&mut self, score: f64, feedback: serde_json::Value) {
        self.feedback_history.push(FeedbackEntry {
            iteration: self.iteration,
            score,
            feedback,
        });
        self.touch();
    }

    /// Returns the highest gate score so far.
    #[must_use]
    pub fn best_gate_score(&self) -> Option<f64> {
        self.gate_scores.iter().copied().reduce(f64::max)
    }

    /// Returns the status view.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        RunStatus {
            run_id: self.run_id.clone(),
            phase: self.phase,
            iteration: self.iteration,
            completed_stages: self.completed_stages.iter().cloned().collect(),
            pending_stages: self.pending_stages.iter().cloned().collect(),
            gate_scores: self.gate_scores.clone(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::WorkflowBuilder;

    fn workflow() -> Workflow {
        WorkflowBuilder::new("article")
            .add_stage("research", "research", &[])
            .add_stage("writing", "writing", &["research"])
            .add_stage("review", "editing", &["writing"])
            .build()
            .unwrap()
    }

    #[test]
    fn test_pass_lifecycle() {
        let wf = workflow();
        let mut state = WorkflowRunState::new("run-1", &wf);
        assert_eq!(state.phase, RunPhase::Initializing);
        assert_eq!(state.pending_stages.len(), 3);

        state.begin_pass(1, &wf);
        state.complete_stage("research", Some(0.7));
        assert_eq!(state.quality_scores["research"], 0.7);
        assert!(!state.pending_stages.contains("research"));

        state.begin_pass(2, &wf);
        assert!(state.completed_stages.is_empty());
        assert_eq!(state.status().phase, RunPhase::Running { pass: 2 });
    }

    #[test]
    fn test_optional_failure_counts_completed() {
        let wf = workflow();
        let mut state = WorkflowRunState::new("run-1", &wf);
        state.begin_pass(1, &wf);

        state.fail_stage(StageFailure {
            stage: "review".to_string(),
            iteration: 1,
            kind: ErrorKind::NonRetryable,
            message: "bad input".to_string(),
            optional: true,
        });
        state.fail_stage(StageFailure {
            stage: "writing".to_string(),
            iteration: 1,
            kind: ErrorKind::RetriesExhausted,
            message: "rate limited".to_string(),
            optional: false,
        });

        assert!(state.completed_stages.contains("review"));
        assert!(!state.completed_stages.contains("writing"));
        assert_eq!(state.failed_stages.len(), 2);
        assert_eq!(state.failures.len(), 2);
    }

    #[test]
    fn test_gate_scores_and_feedback() {
        let wf = workflow();
        let mut state = WorkflowRunState::new("run-1", &wf);
        state.begin_pass(1, &wf);
        state.record_gate_score(0.6);
        state.record_feedback(0.6, serde_json::json!({"fix": "tone"}));
        state.begin_pass(2, &wf);
        state.record_gate_score(0.8);

        assert_eq!(state.best_gate_score(), Some(0.8));
        assert_eq!(state.feedback_history[0].iteration, 1);
        assert_eq!(state.status().gate_scores, vec![0.6, 0.8]);
    }
}
