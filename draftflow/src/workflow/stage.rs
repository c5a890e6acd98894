//! Stage declarations.

use crate::errors::{codes, ConfigurationError, ErrorInfo};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::OnceLock;
use std::time::Duration;

#[allow(clippy::expect_used)]
fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]*$").expect("valid pattern"))
}

/// Returns true if `name` is a valid stage or capability identifier.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    name_pattern().is_match(name)
}

/// A named unit of work with dependencies.
///
/// Stages are plain data: which capability to call, what must finish first,
/// and how the scheduler may run them. They are immutable once their
/// workflow is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Unique name within the workflow.
    pub name: String,
    /// Identifier of the external capability to invoke.
    pub capability: String,
    /// Names of stages that must complete first.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Whether the stage may run concurrently with other ready stages.
    #[serde(default)]
    pub parallelizable: bool,
    /// Whether a failure of this stage leaves the pass intact.
    #[serde(default)]
    pub optional: bool,
    /// Priority copied onto every task of this stage.
    #[serde(default)]
    pub priority: i32,
    /// Capability timeout override in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Per-stage capability settings (model, temperature, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

impl Stage {
    /// Creates a stage bound to a capability.
    #[must_use]
    pub fn new(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            capability: capability.into(),
            depends_on: BTreeSet::new(),
            parallelizable: false,
            optional: false,
            priority: 0,
            timeout_ms: None,
            settings: serde_json::Map::new(),
        }
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        self.depends_on.insert(dep.into());
        self
    }

    /// Marks the stage as parallelizable.
    #[must_use]
    pub fn parallel(mut self) -> Self {
        self.parallelizable = true;
        self
    }

    /// Marks the stage as optional.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Sets the task priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the capability timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Adds a capability setting.
    #[must_use]
    pub fn with_setting(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.settings.insert(key.into(), value);
        self
    }

    /// Returns the capability timeout override.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Returns true if every dependency is in `completed`.
    #[must_use]
    pub fn is_ready(&self, completed: &BTreeSet<String>) -> bool {
        self.depends_on.iter().all(|dep| completed.contains(dep))
    }

    /// Validates the stage in isolation.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or capability is malformed, the stage
    /// depends on itself, or its timeout override is zero.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !is_valid_name(&self.name) {
            return Err(ConfigurationError::new(format!(
                "Invalid stage name '{}'",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ErrorInfo::new(codes::INVALID_NAME, "Stage names must be identifiers")
                    .with_fix_hint("Use letters, digits, '_', '.' or '-', not starting with '.' or '-'."),
            ));
        }
        if self.capability.trim().is_empty() {
            return Err(ConfigurationError::new(format!(
                "Stage '{}' is not bound to a capability",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(ErrorInfo::new(
                codes::INVALID_NAME,
                "Capability identifier is empty",
            )));
        }
        if self.depends_on.contains(&self.name) {
            return Err(ConfigurationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(ErrorInfo::new(
                codes::SELF_DEP,
                format!("Stage '{}' lists itself as a dependency", self.name),
            )));
        }
        if self.timeout_ms == Some(0) {
            return Err(ConfigurationError::new(format!(
                "Stage '{}' has a zero timeout",
                self.name
            ))
            .with_stages(vec![self.name.clone()])
            .with_error_info(
                ErrorInfo::new(codes::INVALID_OPTION, "timeout_ms must be at least 1")
                    .with_context_entry("option", "timeout_ms")
                    .with_context_entry("stage", self.name.as_str()),
            ));
        }
        Ok(())
    }
}
