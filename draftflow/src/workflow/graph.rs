//! Validated workflow and dependency resolver.
//!
//! A [`Workflow`] only exists once its stage list has passed validation:
//! names are unique, every dependency exists, and the dependency relation
//! is acyclic. Scheduling questions (which stages are ready, in which order
//! could everything run) are answered here without touching any runtime
//! component.

use super::Stage;
use crate::errors::{codes, ConfigurationError, CycleDetectedError, ErrorInfo};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Serializable description of a workflow, as produced by a config loader.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// The workflow name.
    pub name: String,
    /// The stages in declaration order.
    #[serde(default)]
    pub stages: Vec<Stage>,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl TryFrom<WorkflowDefinition> for Workflow {
    type Error = ConfigurationError;

    fn try_from(def: WorkflowDefinition) -> Result<Self, Self::Error> {
        Self::new(def.name, def.stages, def.metadata)
    }
}

/// A validated, immutable workflow.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    stages: Vec<Stage>,
    index: HashMap<String, usize>,
    metadata: HashMap<String, serde_json::Value>,
    execution_order: Vec<String>,
}

impl Workflow {
    /// Validates `stages` and builds the workflow.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if the name is empty, there are no
    /// stages, a stage is malformed, names collide, a dependency is missing,
    /// or the dependencies form a cycle.
    pub fn new(
        name: impl Into<String>,
        stages: Vec<Stage>,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Self, ConfigurationError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(ConfigurationError::new(
                "Workflow name cannot be empty or whitespace-only",
            )
            .with_error_info(ErrorInfo::new(codes::INVALID_NAME, "Empty workflow name")));
        }
        if stages.is_empty() {
            return Err(ConfigurationError::new(format!("Workflow '{name}' has no stages"))
                .with_error_info(
                    ErrorInfo::new(codes::EMPTY, "Cannot build an empty workflow")
                        .with_fix_hint("Add at least one stage to the workflow before building."),
                ));
        }

        let mut index = HashMap::with_capacity(stages.len());
        for (position, stage) in stages.iter().enumerate() {
            stage.validate()?;
            if index.insert(stage.name.clone(), position).is_some() {
                return Err(ConfigurationError::new(format!(
                    "Duplicate stage name '{}' in workflow '{name}'",
                    stage.name
                ))
                .with_stages(vec![stage.name.clone()])
                .with_error_info(ErrorInfo::new(
                    codes::DUPLICATE,
                    format!("Stage '{}' is declared more than once", stage.name),
                )));
            }
        }

        for stage in &stages {
            for dep in &stage.depends_on {
                if !index.contains_key(dep) {
                    return Err(ConfigurationError::new(format!(
                        "Stage '{}' depends on unknown stage '{dep}'",
                        stage.name
                    ))
                    .with_stages(vec![stage.name.clone(), dep.clone()])
                    .with_error_info(
                        ErrorInfo::new(codes::MISSING_DEP, format!("Dependency '{dep}' not found"))
                            .with_fix_hint("Declare the dependency in the same workflow or remove it."),
                    ));
                }
            }
        }

        let execution_order = topological_sort(&stages, &index)?;

        Ok(Self {
            name,
            stages,
            index,
            metadata,
            execution_order,
        })
    }

    /// Parses and validates a JSON workflow definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or validation fails.
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        let def: WorkflowDefinition = serde_json::from_str(json).map_err(|e| {
            ConfigurationError::new(format!("Malformed workflow definition: {e}"))
        })?;
        Self::try_from(def)
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stages in declaration order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Looks up a stage by name.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&Stage> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    /// Returns the declaration index of a stage.
    #[must_use]
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Returns the workflow metadata.
    #[must_use]
    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the stage names in declaration order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name.clone()).collect()
    }

    /// Returns a topological order, ties broken by declaration order.
    #[must_use]
    pub fn topological_order(&self) -> &[String] {
        &self.execution_order
    }

    /// Returns every stage that is not completed and whose dependencies all
    /// are, in declaration order.
    ///
    /// An empty result means either every stage is complete or nothing can
    /// make progress; [`Workflow::is_complete`] tells the two apart.
    #[must_use]
    pub fn next_frontier(&self, completed: &BTreeSet<String>) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|stage| !completed.contains(&stage.name) && stage.is_ready(completed))
            .collect()
    }

    /// Returns true if every stage is in `completed`.
    #[must_use]
    pub fn is_complete(&self, completed: &BTreeSet<String>) -> bool {
        self.stages.iter().all(|s| completed.contains(&s.name))
    }

    /// Returns the stages that directly depend on `name`.
    #[must_use]
    pub fn dependents(&self, name: &str) -> Vec<&Stage> {
        self.stages
            .iter()
            .filter(|stage| stage.depends_on.contains(name))
            .collect()
    }

    /// Returns the layered schedule: each layer is the frontier reached once
    /// every earlier layer has completed.
    #[must_use]
    pub fn layers(&self) -> Vec<Vec<String>> {
        let mut completed = BTreeSet::new();
        let mut layers = Vec::new();
        loop {
            let layer: Vec<String> = self
                .next_frontier(&completed)
                .into_iter()
                .map(|s| s.name.clone())
                .collect();
            if layer.is_empty() {
                break;
            }
            completed.extend(layer.iter().cloned());
            layers.push(layer);
        }
        layers
    }

    /// Returns the serializable definition of this workflow.
    #[must_use]
    pub fn to_definition(&self) -> WorkflowDefinition {
        WorkflowDefinition {
            name: self.name.clone(),
            stages: self.stages.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Kahn's algorithm; ready stages are taken in declaration order.
fn topological_sort(
    stages: &[Stage],
    index: &HashMap<String, usize>,
) -> Result<Vec<String>, CycleDetectedError> {
    let mut in_degree: Vec<usize> = stages.iter().map(|s| s.depends_on.len()).collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, &degree)| degree == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(current) = ready.pop_first() {
        order.push(stages[current].name.clone());
        for (i, stage) in stages.iter().enumerate() {
            if stage.depends_on.contains(&stages[current].name) {
                in_degree[i] -= 1;
                if in_degree[i] == 0 {
                    ready.insert(i);
                }
            }
        }
    }

    if order.len() == stages.len() {
        return Ok(order);
    }

    let sorted: HashSet<&str> = order.iter().map(String::as_str).collect();
    let cycle = find_cycle(stages, index, &sorted).unwrap_or_else(|| {
        stages
            .iter()
            .filter(|s| !sorted.contains(s.name.as_str()))
            .map(|s| s.name.clone())
            .collect()
    });
    Err(CycleDetectedError::new(cycle))
}

/// Finds one concrete cycle among the stages Kahn's algorithm left behind.
fn find_cycle(
    stages: &[Stage],
    index: &HashMap<String, usize>,
    sorted: &HashSet<&str>,
) -> Option<Vec<String>> {
    fn dfs(
        node: &str,
        stages: &[Stage],
        index: &HashMap<String, usize>,
        visited: &mut HashSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        if let Some(start) = path.iter().position(|n| n == node) {
            let mut cycle = path[start..].to_vec();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        if !visited.insert(node.to_string()) {
            return None;
        }
        path.push(node.to_string());
        let stage = &stages[*index.get(node)?];
        for dep in &stage.depends_on {
            if let Some(cycle) = dfs(dep, stages, index, visited, path) {
                return Some(cycle);
            }
        }
        path.pop();
        None
    }

    let mut visited = HashSet::new();
    for stage in stages.iter().filter(|s| !sorted.contains(s.name.as_str())) {
        let mut path = Vec::new();
        if let Some(cycle) = dfs(&stage.name, stages, index, &mut visited, &mut path) {
            return Some(cycle);
        }
    }
    None
}
