//! Error types for the draftflow engine.
//!
//! Configuration and defect errors are fatal and surface before any stage
//! runs. Stage-local failures are never returned as `Err` from the executor;
//! they are encoded in [`TaskResult`](crate::core::TaskResult) and only the
//! types below describe them when a caller needs a typed error.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Diagnostic codes attached to [`ErrorInfo`].
pub mod codes {
    /// The dependency graph contains a cycle.
    pub const CYCLE: &str = "WORKFLOW-CYCLE";
    /// A stage depends on a stage that is not in the workflow.
    pub const MISSING_DEP: &str = "WORKFLOW-MISSING_DEP";
    /// Two stages share a name.
    pub const DUPLICATE: &str = "WORKFLOW-DUPLICATE";
    /// A stage lists itself as a dependency.
    pub const SELF_DEP: &str = "WORKFLOW-SELF_DEP";
    /// The workflow has no stages.
    pub const EMPTY: &str = "WORKFLOW-EMPTY";
    /// A workflow, stage or capability name is malformed.
    pub const INVALID_NAME: &str = "WORKFLOW-INVALID_NAME";
    /// A stage is bound to a capability the registry does not know.
    pub const UNKNOWN_CAPABILITY: &str = "CAPABILITY-UNKNOWN";
    /// Engine or run options are out of range.
    pub const INVALID_OPTION: &str = "CONFIG-INVALID_OPTION";
}

/// The top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The workflow or engine configuration is malformed.
    #[error("{0}")]
    Configuration(#[from] ConfigurationError),

    /// The resource pool could not grant a slot in time.
    #[error("{0}")]
    ResourceTimeout(#[from] ResourceTimeoutError),

    /// A capability kept failing transiently.
    #[error("{0}")]
    RetriesExhausted(#[from] RetriesExhaustedError),

    /// A capability rejected its input.
    #[error("{0}")]
    NonRetryable(#[from] NonRetryableCapabilityError),

    /// A state store operation failed.
    #[error("{0}")]
    State(#[from] StateError),

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Structured diagnostics for configuration errors.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (see [`codes`]).
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("summary".to_string(), serde_json::json!(self.summary));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }
        map
    }
}

/// Error raised when a workflow or engine configuration is malformed.
///
/// Construction never partially succeeds: a workflow that produced this
/// error does not exist.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ConfigurationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional structured diagnostics.
    pub error_info: Option<ErrorInfo>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the structured diagnostics.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("stages".to_string(), serde_json::json!(self.stages));
        if let Some(ref info) = self.error_info {
            let info_map: serde_json::Map<String, serde_json::Value> =
                info.to_dict().into_iter().collect();
            map.insert("error_info".to_string(), serde_json::Value::Object(info_map));
        }
        map
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in workflow: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The stages forming the cycle, first stage repeated at the end.
    pub cycle_path: Vec<String>,
    /// Structured diagnostics.
    pub error_info: ErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ErrorInfo::new(
            codes::CYCLE,
            format!("Workflow contains a dependency cycle: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for ConfigurationError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Error raised when the resource pool cannot grant a slot before the
/// acquisition timeout elapses.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Resource acquisition for '{holder}' timed out after {waited_ms}ms")]
pub struct ResourceTimeoutError {
    /// The would-be holder of the slot.
    pub holder: String,
    /// How long the caller waited.
    pub waited_ms: u64,
}

/// Error describing a stage whose capability kept failing transiently.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{stage}' exhausted its retries after {attempts} attempts: {last_error}")]
pub struct RetriesExhaustedError {
    /// The stage name.
    pub stage: String,
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// The last transient error.
    pub last_error: String,
}

/// Error describing a capability that rejected its input.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Capability '{capability}' rejected stage '{stage}': {message}")]
pub struct NonRetryableCapabilityError {
    /// The stage name.
    pub stage: String,
    /// The capability identifier.
    pub capability: String,
    /// The capability's error message.
    pub message: String,
}

/// Error returned when a caller writes against a stale document version.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("State conflict on document '{document_id}': expected version {expected}, found {actual}")]
pub struct StateConflictError {
    /// The document id.
    pub document_id: String,
    /// The version the caller assumed.
    pub expected: u64,
    /// The version actually stored.
    pub actual: u64,
}

/// Errors from the versioned state store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    /// A document with this id already exists.
    #[error("Document already exists: {document_id}")]
    AlreadyExists {
        /// The document id.
        document_id: String,
    },

    /// No document with this id exists.
    #[error("Document not found: {document_id}")]
    NotFound {
        /// The document id.
        document_id: String,
    },

    /// A compare-and-set write lost against a newer version.
    #[error("{0}")]
    Conflict(#[from] StateConflictError),

    /// A snapshot blob could not be decoded or failed its checksum.
    #[error("Invalid snapshot: {reason}")]
    InvalidSnapshot {
        /// Why the blob was rejected.
        reason: String,
    },
}

impl StateError {
    /// Creates an already-exists error.
    #[must_use]
    pub fn already_exists(document_id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            document_id: document_id.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(document_id: impl Into<String>) -> Self {
        Self::NotFound {
            document_id: document_id.into(),
        }
    }

    /// Creates an invalid-snapshot error.
    #[must_use]
    pub fn invalid_snapshot(reason: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            reason: reason.into(),
        }
    }
}

/// Error raised when incomplete stages remain but none can run.
///
/// Validation at build time makes this unreachable for well-formed
/// workflows; seeing it means a defect in the scheduler or the graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Deadlocked stage graph; remaining stages: {}", remaining.join(", "))]
pub struct DeadlockError {
    /// Stages that could not be scheduled.
    pub remaining: Vec<String>,
}

/// Errors from the message router.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The router was closed before the message could be accepted.
    #[error("Message router is closed")]
    Closed,

    /// The recipient mailbox was closed while the message was waiting.
    #[error("Mailbox '{recipient}' is closed")]
    MailboxClosed {
        /// The recipient name.
        recipient: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "draft");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"draft".to_string()));
        assert!(info.to_dict().contains_key("context"));
    }

    #[test]
    fn test_configuration_error_to_dict() {
        let err = ConfigurationError::new("bad workflow")
            .with_stages(vec!["a".to_string(), "b".to_string()])
            .with_error_info(ErrorInfo::new(codes::MISSING_DEP, "missing"));

        let dict = err.to_dict();
        assert_eq!(dict.get("message").unwrap(), "bad workflow");
        assert_eq!(err.code(), Some(codes::MISSING_DEP));
    }

    #[test]
    fn test_cycle_detected_converts_to_configuration_error() {
        let err = CycleDetectedError::new(vec![
            "a".to_string(),
            "b".to_string(),
            "a".to_string(),
        ]);
        assert!(err.to_string().contains("a -> b -> a"));

        let config: ConfigurationError = err.into();
        assert_eq!(config.code(), Some(codes::CYCLE));
        assert_eq!(config.stages.len(), 3);
    }

    #[test]
    fn test_engine_error_from_state_error() {
        let err: EngineError = StateError::not_found("doc-1").into();
        assert!(matches!(err, EngineError::State(StateError::NotFound { .. })));
        assert_eq!(err.to_string(), "Document not found: doc-1");
    }

    #[test]
    fn test_state_conflict_message() {
        let err = StateConflictError {
            document_id: "doc".to_string(),
            expected: 2,
            actual: 4,
        };
        assert!(err.to_string().contains("expected version 2, found 4"));
    }

    #[test]
    fn test_engine_error_wraps_typed_failures() {
        let err: EngineError = ConfigurationError::new("bad workflow").into();
        assert_eq!(err.to_string(), "bad workflow");

        let err: EngineError = ResourceTimeoutError {
            holder: "writing".to_string(),
            waited_ms: 50,
        }
        .into();
        assert!(matches!(err, EngineError::ResourceTimeout(_)));
        assert_eq!(
            err.to_string(),
            "Resource acquisition for 'writing' timed out after 50ms"
        );
    }
}
