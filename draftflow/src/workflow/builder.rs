//! Fluent workflow construction.

use super::{Stage, Workflow};
use crate::errors::ConfigurationError;
use std::collections::HashMap;

/// Builder for creating validated workflows.
///
/// Stages may be added in any order; all validation happens in
/// [`WorkflowBuilder::build`], so forward references are allowed.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    stages: Vec<Stage>,
    metadata: HashMap<String, serde_json::Value>,
}

impl Default for WorkflowBuilder {
    fn default() -> Self {
        Self::new("custom")
    }
}

impl WorkflowBuilder {
    /// Creates a new workflow builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Appends a fully configured stage.
    #[must_use]
    pub fn stage(mut self, stage: Stage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Appends a sequential stage with the given dependencies.
    #[must_use]
    pub fn add_stage(
        self,
        name: impl Into<String>,
        capability: impl Into<String>,
        depends_on: &[&str],
    ) -> Self {
        self.stage(Stage::new(name, capability).with_dependencies(depends_on.iter().copied()))
    }

    /// Sets a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages added so far.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates and builds the workflow.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if validation fails.
    pub fn build(self) -> Result<Workflow, ConfigurationError> {
        Workflow::new(self.name, self.stages, self.metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::codes;

    #[test]
    fn test_builder_creation() {
        let builder = WorkflowBuilder::default();
        assert_eq!(builder.name(), "custom");
        assert_eq!(builder.stage_count(), 0);
    }

    #[test]
    fn test_builder_build_success() {
        let workflow = WorkflowBuilder::new("article")
            .add_stage("research", "research", &[])
            .add_stage("writing", "writing", &["research"])
            .stage(Stage::new("review", "editing").with_dependency("writing").optional())
            .metadata("formal_style", serde_json::json!(false))
            .build()
            .unwrap();

        assert_eq!(workflow.name(), "article");
        assert_eq!(workflow.stage_count(), 3);
        assert!(workflow.stage("review").unwrap().optional);
        assert_eq!(workflow.metadata()["formal_style"], serde_json::json!(false));
    }

    #[test]
    fn test_builder_forward_reference() {
        let workflow = WorkflowBuilder::new("forward")
            .add_stage("writing", "writing", &["research"])
            .add_stage("research", "research", &[])
            .build()
            .unwrap();

        assert_eq!(workflow.topological_order(), &["research", "writing"]);
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = WorkflowBuilder::new("test")
            .add_stage("stage1", "writing", &["missing"])
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some(codes::MISSING_DEP));
        assert_eq!(err.stages, vec!["stage1".to_string(), "missing".to_string()]);
    }

    #[test]
    fn test_builder_cycle_detection() {
        let err = WorkflowBuilder::new("test")
            .add_stage("a", "x", &["b"])
            .add_stage("b", "x", &["a"])
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some(codes::CYCLE));
    }

    #[test]
    fn test_builder_empty_build() {
        let err = WorkflowBuilder::new("test").build().unwrap_err();
        assert_eq!(err.code(), Some(codes::EMPTY));
    }
}
