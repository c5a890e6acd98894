//! Named workflow templates.

use super::{Workflow, WorkflowBuilder};
use crate::errors::ConfigurationError;
use std::collections::HashMap;
use std::sync::Arc;

/// Name of the template used when a lookup misses.
pub const DEFAULT_TEMPLATE: &str = "article";

/// A registry of ready-made workflows keyed by document type.
///
/// The catalog ships with `article`, `paper` and `report`, all of them the
/// research -> writing -> editing -> verification chain with different
/// metadata. Unknown names fall back to `article`.
#[derive(Debug, Clone)]
pub struct WorkflowCatalog {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl WorkflowCatalog {
    /// Creates a catalog with the built-in templates.
    ///
    /// # Errors
    ///
    /// Returns an error only if a built-in template fails validation.
    pub fn with_defaults() -> Result<Self, ConfigurationError> {
        let mut catalog = Self::empty();
        catalog.register(editorial_chain("article").build()?);
        catalog.register(
            editorial_chain("paper")
                .metadata("requires_citations", serde_json::json!(true))
                .metadata("formal_style", serde_json::json!(true))
                .build()?,
        );
        catalog.register(
            editorial_chain("report")
                .metadata("include_executive_summary", serde_json::json!(true))
                .build()?,
        );
        Ok(catalog)
    }

    /// Creates a catalog with no templates.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }

    /// Registers a workflow under its own name, replacing any previous one.
    pub fn register(&mut self, workflow: Workflow) {
        self.workflows
            .insert(workflow.name().to_string(), Arc::new(workflow));
    }

    /// Returns the template for `document_type`, falling back to the default.
    #[must_use]
    pub fn get(&self, document_type: &str) -> Option<Arc<Workflow>> {
        self.workflows
            .get(document_type)
            .or_else(|| self.workflows.get(DEFAULT_TEMPLATE))
            .cloned()
    }

    /// Returns true if a template with exactly this name exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.workflows.contains_key(name)
    }

    /// Returns the registered template names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workflows.keys().cloned().collect();
        names.sort();
        names
    }
}

fn editorial_chain(name: &str) -> WorkflowBuilder {
    WorkflowBuilder::new(name)
        .add_stage("research", "research", &[])
        .add_stage("writing", "writing", &["research"])
        .add_stage("editing", "editing", &["writing"])
        .add_stage("verification", "verification", &["editing"])
}
