//! Task and task result records.

use crate::errors::{
    EngineError, NonRetryableCapabilityError, ResourceTimeoutError, RetriesExhaustedError,
};
use crate::utils::{generate_id, now, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A runtime instance of a stage bound to its input.
///
/// A task is owned by exactly one executor for its whole lifetime. Only
/// `attempt` changes after creation, and only inside that executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier of this execution.
    pub task_id: String,
    /// The run this task belongs to.
    pub run_id: String,
    /// The stage this task executes.
    pub stage_name: String,
    /// The capability the stage is bound to.
    pub capability: String,
    /// The input handed to the capability.
    pub payload: serde_json::Value,
    /// Priority, higher is more urgent.
    pub priority: i32,
    /// Retry counter, starts at 0.
    pub attempt: u32,
    /// The controller pass that created this task.
    pub iteration: u32,
    /// When the task was created.
    pub created_at: Timestamp,
}

impl Task {
    /// Creates a new task with a fresh id and `attempt == 0`.
    #[must_use]
    pub fn new(
        run_id: impl Into<String>,
        stage_name: impl Into<String>,
        capability: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            task_id: generate_id(),
            run_id: run_id.into(),
            stage_name: stage_name.into(),
            capability: capability.into(),
            payload,
            priority: 0,
            attempt: 0,
            iteration: 1,
            created_at: now(),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the iteration.
    #[must_use]
    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = iteration;
        self
    }
}

/// Why a task failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The resource pool never granted a slot within the retry budget.
    ResourceTimeout,
    /// The capability kept failing transiently.
    RetriesExhausted,
    /// The capability rejected its input.
    NonRetryable,
    /// Cancellation was observed before the task could finish.
    Cancelled,
    /// The capability panicked or the executor hit a defect.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourceTimeout => write!(f, "resource_timeout"),
            Self::RetriesExhausted => write!(f, "retries_exhausted"),
            Self::NonRetryable => write!(f, "non_retryable"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Measurements taken while executing a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
    /// Wall-clock time from first acquisition attempt to completion.
    pub elapsed_ms: f64,
    /// Pool slots consumed across all attempts.
    pub resource_units: u32,
    /// Capability invocations made.
    pub invocations: u32,
}

/// The immutable outcome of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The task this result belongs to.
    pub task_id: String,
    /// The stage that ran.
    pub stage_name: String,
    /// Whether the capability eventually succeeded.
    pub success: bool,
    /// Capability output on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    /// Failure classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The task's final attempt counter.
    pub attempt: u32,
    /// Execution measurements.
    pub metrics: ResultMetrics,
    /// Document version committed by this task, if it wrote one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub committed_version: Option<u64>,
    /// When the result was produced.
    pub completed_at: Timestamp,
}

impl TaskResult {
    /// Creates a successful result.
    #[must_use]
    pub fn success(task: &Task, output: serde_json::Value, metrics: ResultMetrics) -> Self {
        Self {
            task_id: task.task_id.clone(),
            stage_name: task.stage_name.clone(),
            success: true,
            output: Some(output),
            error_kind: None,
            message: None,
            attempt: task.attempt,
            metrics,
            committed_version: None,
            completed_at: now(),
        }
    }

    /// Creates a failed result.
    #[must_use]
    pub fn failure(
        task: &Task,
        kind: ErrorKind,
        message: impl Into<String>,
        metrics: ResultMetrics,
    ) -> Self {
        Self {
            task_id: task.task_id.clone(),
            stage_name: task.stage_name.clone(),
            success: false,
            output: None,
            error_kind: Some(kind),
            message: Some(message.into()),
            attempt: task.attempt,
            metrics,
            committed_version: None,
            completed_at: now(),
        }
    }

    /// Records the document version this task committed.
    #[must_use]
    pub fn with_committed_version(mut self, version: u64) -> Self {
        self.committed_version = Some(version);
        self
    }

    /// Converts a failed result into the matching typed error.
    ///
    /// Returns `None` for successful results.
    #[must_use]
    pub fn to_error(&self, capability: &str) -> Option<EngineError> {
        let kind = self.error_kind?;
        let message = self.message.clone().unwrap_or_default();
        let err = match kind {
            ErrorKind::ResourceTimeout => ResourceTimeoutError {
                holder: self.stage_name.clone(),
                waited_ms: self.metrics.elapsed_ms as u64,
            }
            .into(),
            ErrorKind::RetriesExhausted => RetriesExhaustedError {
                stage: self.stage_name.clone(),
                attempts: self.attempt + 1,
                last_error: message,
            }
            .into(),
            ErrorKind::NonRetryable => NonRetryableCapabilityError {
                stage: self.stage_name.clone(),
                capability: capability.to_string(),
                message,
            }
            .into(),
            ErrorKind::Cancelled => EngineError::Cancelled(message),
            ErrorKind::Internal => EngineError::Internal(message),
        };
        Some(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("run-1", "draft", "writing", serde_json::json!({"topic": "rust"}))
    }

    #[test]
    fn test_task_defaults() {
        let task = task().with_priority(5).with_iteration(2);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.priority, 5);
        assert_eq!(task.iteration, 2);
        assert!(!task.task_id.is_empty());
    }

    #[test]
    fn test_task_ids_are_unique() {
        assert_ne!(task().task_id, task().task_id);
    }

    #[test]
    fn test_success_result() {
        let task = task();
        let result = TaskResult::success(&task, serde_json::json!("ok"), ResultMetrics::default())
            .with_committed_version(3);
        assert!(result.success);
        assert_eq!(result.task_id, task.task_id);
        assert_eq!(result.committed_version, Some(3));
        assert!(result.to_error("writing").is_none());
    }

    #[test]
    fn test_failure_to_error() {
        let mut task = task();
        task.attempt = 3;
        let result = TaskResult::failure(
            &task,
            ErrorKind::RetriesExhausted,
            "rate limited",
            ResultMetrics::default(),
        );
        assert!(!result.success);
        match result.to_error("writing") {
            Some(EngineError::RetriesExhausted(err)) => {
                assert_eq!(err.attempts, 4);
                assert_eq!(err.last_error, "rate limited");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_result_serialization_skips_empty_fields() {
        let result = TaskResult::success(&task(), serde_json::json!(1), ResultMetrics::default());
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("error_kind").is_none());
        let back: TaskResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::NonRetryable.to_string(), "non_retryable");
        assert_eq!(ErrorKind::ResourceTimeout.to_string(), "resource_timeout");
    }
}
