//! Capability lookup and per-capability metrics.

use super::Capability;
use crate::errors::{codes, ConfigurationError, ErrorInfo};
use crate::workflow::{is_valid_name, Workflow};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Invocation counters for one capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetrics {
    /// Invocations started.
    pub invocations: u64,
    /// Invocations that succeeded.
    pub successes: u64,
    /// Invocations that failed (including timeouts and panics).
    pub failures: u64,
    /// Total wall-clock time spent inside the capability.
    pub total_time_ms: f64,
}

impl CapabilityMetrics {
    /// Returns the mean invocation time.
    #[must_use]
    pub fn average_time_ms(&self) -> f64 {
        if self.invocations == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let n = self.invocations as f64;
            self.total_time_ms / n
        }
    }
}

/// Maps capability ids to implementations.
///
/// Workflows are bound against the registry once, at run start; a stage
/// naming an unknown capability is a configuration error before any stage
/// runs.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: RwLock<HashMap<String, Arc<dyn Capability>>>,
    metrics: DashMap<String, CapabilityMetrics>,
}

impl CapabilityRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a capability, replacing any previous one with the same id.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is not a valid identifier.
    pub fn register(
        &self,
        capability_id: impl Into<String>,
        capability: Arc<dyn Capability>,
    ) -> Result<(), ConfigurationError> {
        let capability_id = capability_id.into();
        if !is_valid_name(&capability_id) {
            return Err(ConfigurationError::new(format!(
                "Invalid capability id '{capability_id}'"
            ))
            .with_error_info(ErrorInfo::new(
                codes::INVALID_NAME,
                "Capability ids must be identifiers",
            )));
        }
        debug!(capability = %capability_id, "Registered capability");
        self.capabilities.write().insert(capability_id, capability);
        Ok(())
    }

    /// Looks up a capability.
    #[must_use]
    pub fn get(&self, capability_id: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.read().get(capability_id).cloned()
    }

    /// Returns true if the capability is registered.
    #[must_use]
    pub fn contains(&self, capability_id: &str) -> bool {
        self.capabilities.read().contains_key(capability_id)
    }

    /// Returns the registered ids, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.capabilities.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves every capability the workflow uses.
    ///
    /// # Errors
    ///
    /// Returns a `CAPABILITY-UNKNOWN` configuration error listing every
    /// stage bound to an unregistered capability.
    pub fn bind(&self, workflow: &Workflow) -> Result<HashMap<String, Arc<dyn Capability>>, ConfigurationError> {
        let capabilities = self.capabilities.read();
        let mut bound = HashMap::new();
        let mut unknown: Vec<(&str, &str)> = Vec::new();

        for stage in workflow.stages() {
            match capabilities.get(&stage.capability) {
                Some(cap) => {
                    bound.insert(stage.capability.clone(), Arc::clone(cap));
                }
                None => unknown.push((stage.name.as_str(), stage.capability.as_str())),
            }
        }

        if unknown.is_empty() {
            return Ok(bound);
        }

        let listing = unknown
            .iter()
            .map(|(stage, cap)| format!("{stage} -> {cap}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut info = ErrorInfo::new(
            codes::UNKNOWN_CAPABILITY,
            format!("Unregistered capabilities: {listing}"),
        )
        .with_fix_hint("Register the capability with the CapabilityRegistry before starting the run.");
        for (stage, cap) in &unknown {
            info = info.with_context_entry(*stage, *cap);
        }

        Err(ConfigurationError::new(format!(
            "Workflow '{}' uses unregistered capabilities: {listing}",
            workflow.name()
        ))
        .with_stages(unknown.iter().map(|(stage, _)| (*stage).to_string()).collect())
        .with_error_info(info))
    }

    /// Records one finished invocation.
    pub fn record_invocation(&self, capability_id: &str, success: bool, elapsed: Duration) {
        let mut entry = self.metrics.entry(capability_id.to_string()).or_default();
        entry.invocations += 1;
        if success {
            entry.successes += 1;
        } else {
            entry.failures += 1;
        }
        entry.total_time_ms += elapsed.as_secs_f64() * 1000.0;
    }

    /// Returns the metrics of one capability.
    #[must_use]
    pub fn metrics(&self, capability_id: &str) -> Option<CapabilityMetrics> {
        self.metrics.get(capability_id).map(|entry| *entry.value())
    }

    /// Returns the metrics of every invoked capability.
    #[must_use]
    pub fn all_metrics(&self) -> BTreeMap<String, CapabilityMetrics> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("capabilities", &self.ids())
            .finish_non_exhaustive()
    }
}
