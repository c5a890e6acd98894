//! The public entry point: start, observe and cancel runs.

use super::controller::RunController;
use super::outcome::RunOutcome;
use crate::cancellation::CancellationToken;
use crate::capability::{CapabilityRegistry, QualityGate};
use crate::config::{EngineConfig, RunOptions};
use crate::errors::{ConfigurationError, EngineError};
use crate::events::{EventSink, NoOpEventSink};
use crate::executor::StageExecutor;
use crate::observability::run_span;
use crate::resources::ResourcePool;
use crate::router::MessageRouter;
use crate::state::{RunStatus, VersionedStateStore, WorkflowRunState};
use crate::utils::{generate_id, preview};
use crate::workflow::{Workflow, WorkflowCatalog};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, Instrument};

struct RunEntry {
    state: Arc<RwLock<WorkflowRunState>>,
    cancel: CancellationToken,
}

/// A started run.
#[derive(Debug)]
pub struct RunHandle {
    run_id: String,
    document_id: String,
    cancel: CancellationToken,
    join: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// The run id.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The id of the document the run writes.
    #[must_use]
    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    /// Requests cancellation; returns false if already requested.
    pub fn cancel(&self, reason: &str) -> bool {
        self.cancel.cancel(reason)
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for the run to reach a terminal state.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] if the controller task was aborted
    /// or panicked.
    pub async fn wait(self) -> Result<RunOutcome, EngineError> {
        self.join
            .await
            .map_err(|e| EngineError::Internal(format!("run {} did not finish: {e}", self.run_id)))
    }
}

/// Runs workflows against registered capabilities and a quality gate.
///
/// The resource pool, router and state store are shared by every run the
/// orchestrator starts, so the pool bound holds across concurrent runs.
pub struct Orchestrator {
    config: EngineConfig,
    registry: Arc<CapabilityRegistry>,
    gate: Arc<dyn QualityGate>,
    pool: ResourcePool,
    router: MessageRouter,
    store: Arc<VersionedStateStore>,
    catalog: WorkflowCatalog,
    sink: Arc<dyn EventSink>,
    runs: DashMap<String, RunEntry>,
}

impl Orchestrator {
    /// Creates an orchestrator with the built-in workflow templates.
    ///
    /// # Errors
    ///
    /// Returns an error if `config` does not validate.
    pub fn new(
        config: EngineConfig,
        registry: Arc<CapabilityRegistry>,
        gate: Arc<dyn QualityGate>,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        Ok(Self {
            pool: ResourcePool::new(config.pool_size),
            router: MessageRouter::new(config.router_config()),
            store: Arc::new(VersionedStateStore::new()),
            catalog: WorkflowCatalog::with_defaults()?,
            sink: Arc::new(NoOpEventSink),
            runs: DashMap::new(),
            config,
            registry,
            gate,
        })
    }

    /// Sends lifecycle events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Replaces the template catalog.
    #[must_use]
    pub fn with_catalog(mut self, catalog: WorkflowCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared resource pool.
    #[must_use]
    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// The shared message router.
    #[must_use]
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// The shared document store.
    #[must_use]
    pub fn store(&self) -> &Arc<VersionedStateStore> {
        &self.store
    }

    /// The capability registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// The workflow templates.
    #[must_use]
    pub fn catalog(&self) -> &WorkflowCatalog {
        &self.catalog
    }

    /// Starts a run and returns immediately.
    ///
    /// Capabilities are bound and the run document is created before the
    /// controller starts, so configuration problems surface here and no
    /// task is ever created for a rejected run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Configuration`] for unknown capabilities or
    /// bad overrides, and [`EngineError::State`] if the requested document
    /// id is taken.
    pub async fn start_run(
        &self,
        workflow: Arc<Workflow>,
        request: serde_json::Value,
        options: RunOptions,
    ) -> Result<RunHandle, EngineError> {
        let (threshold, max_iterations) = options.resolve(&self.config)?;
        let capabilities = self.registry.bind(&workflow)?;

        let run_id = generate_id();
        let document_id = options
            .document_id
            .clone()
            .unwrap_or_else(|| format!("doc-{run_id}"));

        let mut metadata = serde_json::Map::new();
        metadata.insert("run_id".into(), run_id.clone().into());
        metadata.insert("workflow".into(), workflow.name().into());
        if let Some(document_type) = &options.document_type {
            metadata.insert("document_type".into(), document_type.clone().into());
        }
        let request_text = request.as_str().map_or_else(|| request.to_string(), str::to_string);
        metadata.insert("request".into(), preview(&request_text, 100).into());
        let initial = options
            .initial_content
            .clone()
            .unwrap_or_else(|| serde_json::Value::String(String::new()));
        self.store
            .create_document_with_metadata(&document_id, initial, metadata)
            .await?;

        let cancel = options.cancel.clone().unwrap_or_default();
        let state = Arc::new(RwLock::new(WorkflowRunState::new(&run_id, &workflow)));
        self.runs.insert(
            run_id.clone(),
            RunEntry {
                state: Arc::clone(&state),
                cancel: cancel.clone(),
            },
        );

        let address = format!("controller:{run_id}");
        let inbox = self.router.register_recipient(&address);
        let executor = StageExecutor::new(
            self.pool.clone(),
            self.router.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.config.executor_config(),
        )
        .with_cancellation(cancel.clone())
        .with_document(document_id.clone())
        .with_reply_to(address);

        info!(
            run_id = %run_id,
            workflow = %workflow.name(),
            document_type = ?options.document_type,
            "Starting run"
        );

        let span = run_span(&run_id, workflow.name());
        let controller = RunController {
            run_id: run_id.clone(),
            workflow,
            request,
            document_id: document_id.clone(),
            threshold,
            max_iterations,
            capabilities,
            executor: Arc::new(executor),
            gate: Arc::clone(&self.gate),
            store: Arc::clone(&self.store),
            router: self.router.clone(),
            inbox,
            state,
            cancel: cancel.clone(),
            sink: Arc::clone(&self.sink),
        };
        let join = tokio::spawn(controller.run().instrument(span));

        Ok(RunHandle {
            run_id,
            document_id,
            cancel,
            join,
        })
    }

    /// Starts a run and waits for its outcome.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::start_run`] and [`RunHandle::wait`].
    pub async fn run(
        &self,
        workflow: Arc<Workflow>,
        request: serde_json::Value,
        options: RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        self.start_run(workflow, request, options).await?.wait().await
    }

    /// Runs a catalog template; unknown types fall back to the default
    /// template.
    ///
    /// # Errors
    ///
    /// Same as [`Orchestrator::run`], plus a configuration error when the
    /// catalog has neither the type nor the default template.
    pub async fn run_template(
        &self,
        document_type: &str,
        request: serde_json::Value,
        options: RunOptions,
    ) -> Result<RunOutcome, EngineError> {
        let workflow = self.catalog.get(document_type).ok_or_else(|| {
            ConfigurationError::new(format!("No workflow template for '{document_type}'"))
        })?;
        let options = RunOptions {
            document_type: Some(document_type.to_string()),
            ..options
        };
        self.run(workflow, request, options).await
    }

    /// Requests cancellation of a run; false for unknown or already
    /// cancelled runs.
    pub fn cancel(&self, run_id: &str, reason: &str) -> bool {
        self.runs
            .get(run_id)
            .map_or(false, |entry| entry.cancel.cancel(reason))
    }

    /// Returns the current status of a run, finished runs included.
    #[must_use]
    pub fn get_status(&self, run_id: &str) -> Option<RunStatus> {
        self.runs.get(run_id).map(|entry| entry.state.read().status())
    }

    /// Ids of every known run.
    #[must_use]
    pub fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Forgets a finished run's status; returns false for unknown or
    /// active runs.
    pub fn forget_run(&self, run_id: &str) -> bool {
        self.runs
            .remove_if(run_id, |_, entry| entry.state.read().phase.is_terminal())
            .is_some()
    }

    /// Closes the router once every run has finished.
    pub async fn shutdown(&self) {
        self.router.close().await;
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("runs", &self.runs.len())
            .finish_non_exhaustive()
    }
}
