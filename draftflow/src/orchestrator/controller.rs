//! The iteration controller: one instance drives one run.

use super::outcome::{BestDocument, RunOutcome};
use crate::cancellation::CancellationToken;
use crate::capability::{evaluate_gate, Capability, QualityGate};
use crate::core::{ErrorKind, Message, MessageType, ResultMetrics, RunPhase, Task, TaskResult, TerminalState};
use crate::errors::DeadlockError;
use crate::events::{event_types, EventSink};
use crate::executor::{StageBinding, StageExecutor};
use crate::router::{Mailbox, MessageRouter};
use crate::state::{DocumentState, StageFailure, VersionedStateStore, WorkflowRunState};
use crate::workflow::{Stage, Workflow};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Stage output key a capability uses to report its own quality score.
pub const QUALITY_SCORE_KEY: &str = "quality_score";

struct InFlight {
    stage: String,
    parallel: bool,
}

#[derive(Default)]
struct PassReport {
    aborted: bool,
    cancelled: bool,
    deadlock: Option<DeadlockError>,
}

/// Everything one pass tracks while it runs.
struct Pass {
    iteration: u32,
    completed: BTreeSet<String>,
    dispatched: BTreeSet<String>,
    outputs: serde_json::Map<String, serde_json::Value>,
    in_flight: HashMap<String, InFlight>,
    tasks: FuturesUnordered<JoinHandle<TaskResult>>,
    report: PassReport,
}

impl Pass {
    fn new(iteration: u32) -> Self {
        Self {
            iteration,
            completed: BTreeSet::new(),
            dispatched: BTreeSet::new(),
            outputs: serde_json::Map::new(),
            in_flight: HashMap::new(),
            tasks: FuturesUnordered::new(),
            report: PassReport::default(),
        }
    }

    fn serial_in_flight(&self) -> bool {
        self.in_flight.values().any(|f| !f.parallel)
    }

    fn dispatch_allowed(&self) -> bool {
        !self.report.aborted && !self.report.cancelled
    }
}

pub(crate) struct RunController {
    pub(crate) run_id: String,
    pub(crate) workflow: Arc<Workflow>,
    pub(crate) request: serde_json::Value,
    pub(crate) document_id: String,
    pub(crate) threshold: f64,
    pub(crate) max_iterations: u32,
    pub(crate) capabilities: HashMap<String, Arc<dyn Capability>>,
    pub(crate) executor: Arc<StageExecutor>,
    pub(crate) gate: Arc<dyn QualityGate>,
    pub(crate) store: Arc<VersionedStateStore>,
    pub(crate) router: MessageRouter,
    pub(crate) inbox: Arc<Mailbox>,
    pub(crate) state: Arc<RwLock<WorkflowRunState>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) sink: Arc<dyn EventSink>,
}

impl RunController {
    fn address(&self) -> &str {
        self.inbox.name()
    }

    pub(crate) async fn run(self) -> RunOutcome {
        let started = Instant::now();
        let mut diagnostics = Vec::new();
        let mut best: Option<BestDocument> = None;
        let mut last_document: Option<DocumentState> = None;
        let mut iterations = 0;

        info!(
            workflow = %self.workflow.name(),
            document_id = %self.document_id,
            threshold = self.threshold,
            max_iterations = self.max_iterations,
            "Run started"
        );
        self.sink
            .emit(
                event_types::RUN_STARTED,
                Some(serde_json::json!({
                    "run_id": self.run_id,
                    "workflow": self.workflow.name(),
                    "document_id": self.document_id,
                })),
            )
            .await;

        let mut terminal = TerminalState::Failed;
        for iteration in 1..=self.max_iterations {
            if self.cancel.is_cancelled() {
                self.announce_cancel().await;
                terminal = TerminalState::Cancelled;
                break;
            }

            iterations = iteration;
            self.state.write().begin_pass(iteration, &self.workflow);
            self.publish_status().await;
            self.sink
                .emit(
                    event_types::PASS_STARTED,
                    Some(serde_json::json!({"run_id": self.run_id, "iteration": iteration})),
                )
                .await;

            let report = self.run_pass(iteration).await;

            if let Some(deadlock) = report.deadlock {
                error!(iteration, error = %deadlock, "Scheduler deadlocked");
                diagnostics.push(deadlock.to_string());
                break;
            }
            if report.cancelled || self.cancel.is_cancelled() {
                terminal = TerminalState::Cancelled;
                break;
            }
            if report.aborted {
                self.sink
                    .emit(
                        event_types::PASS_ABORTED,
                        Some(serde_json::json!({"run_id": self.run_id, "iteration": iteration})),
                    )
                    .await;
            }

            self.state.write().set_phase(RunPhase::GateCheck { pass: iteration });
            self.publish_status().await;

            let document = match self.store.get_document(&self.document_id).await {
                Ok(document) => document,
                Err(e) => {
                    error!(error = %e, "Run document disappeared");
                    diagnostics.push(e.to_string());
                    break;
                }
            };

            let verdict = evaluate_gate(self.gate.as_ref(), &document).await;
            if let Some(diagnostic) = &verdict.diagnostic {
                diagnostics.push(format!("iteration {iteration}: {diagnostic}"));
            }
            self.state.write().record_gate_score(verdict.score);
            info!(
                iteration,
                score = verdict.score,
                threshold = self.threshold,
                aborted = report.aborted,
                "Quality gate evaluated"
            );
            self.sink
                .emit(
                    event_types::GATE_EVALUATED,
                    Some(serde_json::json!({
                        "run_id": self.run_id,
                        "iteration": iteration,
                        "score": verdict.score,
                        "version": document.version,
                    })),
                )
                .await;

            if best.as_ref().map_or(true, |b| verdict.score > b.score) {
                match self.store.snapshot(&self.document_id).await {
                    Ok(snapshot) => {
                        best = Some(BestDocument {
                            iteration,
                            score: verdict.score,
                            document: document.clone(),
                            snapshot,
                        });
                    }
                    Err(e) => diagnostics.push(format!("snapshot failed: {e}")),
                }
            }

            if !report.aborted && verdict.score >= self.threshold {
                last_document = Some(document);
                terminal = TerminalState::Complete;
                break;
            }

            if iteration < self.max_iterations {
                let feedback = match self.gate.generate_feedback(&document, verdict.score).await {
                    Ok(feedback) => feedback,
                    Err(e) => {
                        warn!(error = %e, "Feedback generation failed");
                        diagnostics.push(format!("iteration {iteration}: feedback error: {e}"));
                        serde_json::json!({"error": e.to_string()})
                    }
                };
                self.state.write().record_feedback(verdict.score, feedback);
            }
            last_document = Some(document);
        }

        self.finish(terminal, iterations, best, last_document, diagnostics, started)
            .await
    }

    async fn run_pass(&self, iteration: u32) -> PassReport {
        let mut pass = Pass::new(iteration);
        let mut inbox_open = true;

        loop {
            if pass.dispatch_allowed() {
                self.dispatch_ready(&mut pass).await;
            }

            if pass.in_flight.is_empty() {
                if !pass.dispatch_allowed() || self.workflow.is_complete(&pass.completed) {
                    break;
                }
                let remaining = self
                    .workflow
                    .stage_names()
                    .into_iter()
                    .filter(|name| !pass.completed.contains(name))
                    .collect();
                pass.report.deadlock = Some(DeadlockError { remaining });
                break;
            }

            tokio::select! {
                biased;
                message = self.inbox.recv(), if inbox_open => match message {
                    Some(message) => self.accept_message(&mut pass, message).await,
                    None => {
                        warn!("Controller inbox closed, falling back to task handles");
                        inbox_open = false;
                    }
                },
                joined = pass.tasks.next(), if !pass.tasks.is_empty() => match joined {
                    Some(Ok(result)) => {
                        while let Some(message) = self.inbox.try_recv() {
                            self.accept_message(&mut pass, message).await;
                        }
                        if pass.in_flight.contains_key(&result.task_id) {
                            warn!(stage = %result.stage_name, "RESULT message missing, using task handle");
                            self.accept_result(&mut pass, result).await;
                        }
                    }
                    Some(Err(e)) => error!(error = %e, "Stage task did not complete"),
                    None => {}
                },
                () = self.cancel.cancelled(), if !pass.report.cancelled => {
                    pass.report.cancelled = true;
                    self.announce_cancel().await;
                }
            }

            if pass.tasks.is_empty() && !inbox_open && !pass.in_flight.is_empty() {
                self.abandon_in_flight(&mut pass).await;
            }
        }

        pass.report
    }

    async fn dispatch_ready(&self, pass: &mut Pass) {
        let mut serial_busy = pass.serial_in_flight();
        let ready: Vec<&Stage> = self
            .workflow
            .next_frontier(&pass.completed)
            .into_iter()
            .filter(|stage| !pass.dispatched.contains(&stage.name))
            .collect();

        for stage in ready {
            if self.cancel.is_cancelled() {
                if !pass.report.cancelled {
                    pass.report.cancelled = true;
                    self.announce_cancel().await;
                }
                return;
            }
            if !stage.parallelizable {
                if serial_busy {
                    continue;
                }
                serial_busy = true;
            }
            self.dispatch(pass, stage).await;
        }
    }

    async fn dispatch(&self, pass: &mut Pass, stage: &Stage) {
        let payload = self.task_payload(pass, stage).await;
        let task = Task::new(&self.run_id, &stage.name, &stage.capability, payload)
            .with_priority(stage.priority)
            .with_iteration(pass.iteration);

        let announcement = Message::broadcast(
            MessageType::Task,
            self.address(),
            serde_json::json!({
                "task_id": task.task_id,
                "stage": stage.name,
                "capability": stage.capability,
                "iteration": pass.iteration,
            }),
        )
        .with_priority(stage.priority);
        let correlation_id = match self.router.publish(announcement).await {
            Ok(message) => Some(message.id),
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "Failed to publish TASK");
                None
            }
        };

        debug!(stage = %stage.name, task_id = %task.task_id, iteration = pass.iteration, "Dispatching stage");
        self.sink.try_emit(
            event_types::STAGE_STARTED,
            Some(serde_json::json!({
                "run_id": self.run_id,
                "stage": stage.name,
                "iteration": pass.iteration,
            })),
        );

        pass.dispatched.insert(stage.name.clone());
        pass.in_flight.insert(
            task.task_id.clone(),
            InFlight {
                stage: stage.name.clone(),
                parallel: stage.parallelizable,
            },
        );

        let Some(capability) = self.capabilities.get(&stage.capability).cloned() else {
            let result = TaskResult::failure(
                &task,
                ErrorKind::Internal,
                format!("capability '{}' is not bound", stage.capability),
                ResultMetrics::default(),
            );
            pass.tasks.push(tokio::spawn(async move { result }));
            return;
        };

        let binding = StageBinding {
            capability,
            timeout: stage.timeout(),
            settings: stage.settings.clone(),
            correlation_id,
        };
        let executor = Arc::clone(&self.executor);
        pass.tasks.push(tokio::spawn(async move {
            let fallback = task.clone();
            match AssertUnwindSafe(executor.execute(task, &binding)).catch_unwind().await {
                Ok(result) => result,
                Err(_) => TaskResult::failure(
                    &fallback,
                    ErrorKind::Internal,
                    "executor panicked",
                    ResultMetrics::default(),
                ),
            }
        }));
    }

    async fn task_payload(&self, pass: &Pass, stage: &Stage) -> serde_json::Value {
        let dependencies: serde_json::Map<String, serde_json::Value> = stage
            .depends_on
            .iter()
            .filter_map(|dep| pass.outputs.get(dep).map(|out| (dep.clone(), out.clone())))
            .collect();
        let feedback = serde_json::to_value(&self.state.read().feedback_history)
            .unwrap_or_else(|_| serde_json::Value::Array(Vec::new()));
        let document = match self.store.get_document(&self.document_id).await {
            Ok(doc) => serde_json::json!({"version": doc.version, "content": doc.content}),
            Err(_) => serde_json::Value::Null,
        };

        serde_json::json!({
            "request": self.request,
            "iteration": pass.iteration,
            "feedback": feedback,
            "dependencies": dependencies,
            "settings": stage.settings,
            "document": document,
        })
    }

    async fn accept_message(&self, pass: &mut Pass, message: Message) {
        if message.message_type != MessageType::Result {
            debug!(message_type = %message.message_type, "Ignoring non-RESULT message");
            return;
        }
        match serde_json::from_value::<TaskResult>(message.payload) {
            Ok(result) => self.accept_result(pass, result).await,
            Err(e) => warn!(message_id = %message.id, error = %e, "Malformed RESULT payload"),
        }
    }

    async fn accept_result(&self, pass: &mut Pass, result: TaskResult) {
        let Some(entry) = pass.in_flight.remove(&result.task_id) else {
            debug!(task_id = %result.task_id, "Result for unknown or finished task");
            return;
        };
        let optional = self
            .workflow
            .stage(&entry.stage)
            .map_or(false, |stage| stage.optional);

        if result.success {
            let output = result.output.unwrap_or(serde_json::Value::Null);
            let quality_score = output.get(QUALITY_SCORE_KEY).and_then(serde_json::Value::as_f64);
            self.state.write().complete_stage(&entry.stage, quality_score);
            pass.completed.insert(entry.stage.clone());
            pass.outputs.insert(entry.stage.clone(), output);
            self.sink.try_emit(
                event_types::STAGE_COMPLETED,
                Some(serde_json::json!({
                    "run_id": self.run_id,
                    "stage": entry.stage,
                    "attempt": result.attempt,
                    "elapsed_ms": result.metrics.elapsed_ms,
                })),
            );
            return;
        }

        let failure = StageFailure {
            stage: entry.stage.clone(),
            iteration: pass.iteration,
            kind: result.error_kind.unwrap_or(ErrorKind::Internal),
            message: result.message.unwrap_or_default(),
            optional,
        };
        self.state.write().fail_stage(failure.clone());
        self.publish(Message::broadcast(
            MessageType::Error,
            self.address(),
            serde_json::to_value(&failure).unwrap_or(serde_json::Value::Null),
        ))
        .await;
        self.sink.try_emit(
            event_types::STAGE_FAILED,
            Some(serde_json::json!({
                "run_id": self.run_id,
                "stage": failure.stage,
                "kind": failure.kind,
                "optional": optional,
            })),
        );

        if optional {
            warn!(stage = %failure.stage, kind = %failure.kind, "Optional stage failed, continuing");
            pass.completed.insert(entry.stage);
        } else {
            warn!(stage = %failure.stage, kind = %failure.kind, message = %failure.message, "Stage failed, aborting pass");
            pass.report.aborted = true;
        }
    }

    async fn abandon_in_flight(&self, pass: &mut Pass) {
        let orphaned: Vec<String> = pass.in_flight.keys().cloned().collect();
        for task_id in orphaned {
            let stage = pass.in_flight.get(&task_id).map(|f| f.stage.clone()).unwrap_or_default();
            let task = Task {
                task_id,
                ..Task::new(&self.run_id, stage, "", serde_json::Value::Null)
            };
            let result = TaskResult::failure(&task, ErrorKind::Internal, "result lost", ResultMetrics::default());
            self.accept_result(pass, result).await;
        }
    }

    async fn announce_cancel(&self) {
        let reason = self.cancel.reason().unwrap_or_else(|| "cancelled".to_string());
        info!(reason = %reason, "Cancellation observed");
        self.publish(Message::broadcast(
            MessageType::Control,
            self.address(),
            serde_json::json!({"command": "cancel", "run_id": self.run_id, "reason": reason}),
        ))
        .await;
    }

    async fn publish_status(&self) {
        let status = self.state.read().status();
        let payload = serde_json::to_value(&status).unwrap_or(serde_json::Value::Null);
        self.publish(Message::broadcast(MessageType::Status, self.address(), payload))
            .await;
    }

    async fn publish(&self, message: Message) {
        let message_type = message.message_type;
        if let Err(e) = self.router.publish(message).await {
            warn!(message_type = %message_type, error = %e, "Failed to publish");
        }
    }

    async fn finish(
        &self,
        terminal: TerminalState,
        iterations: u32,
        best: Option<BestDocument>,
        last_document: Option<DocumentState>,
        diagnostics: Vec<String>,
        started: Instant,
    ) -> RunOutcome {
        let document = match self.store.get_document(&self.document_id).await {
            Ok(document) => document,
            Err(_) => last_document
                .or_else(|| best.as_ref().map(|b| b.document.clone()))
                .unwrap_or_else(|| {
                    DocumentState::new(&self.document_id, serde_json::Value::Null, serde_json::Map::new())
                }),
        };

        let snapshot = {
            let mut state = self.state.write();
            state.set_phase(terminal.into());
            state.clone()
        };
        self.publish_status().await;
        self.router.unregister_recipient(self.address());

        let outcome = RunOutcome {
            run_id: self.run_id.clone(),
            workflow: self.workflow.name().to_string(),
            state: terminal,
            iterations,
            final_score: snapshot.gate_scores.last().copied(),
            document,
            best,
            completed_stages: snapshot.completed_stages.into_iter().collect(),
            quality_scores: snapshot.quality_scores,
            gate_scores: snapshot.gate_scores,
            feedback_history: snapshot.feedback_history,
            failures: snapshot.failures,
            diagnostics,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        };

        let event = match terminal {
            TerminalState::Complete => event_types::RUN_COMPLETED,
            TerminalState::Failed => event_types::RUN_FAILED,
            TerminalState::Cancelled => event_types::RUN_CANCELLED,
        };
        info!(
            state = %terminal,
            iterations,
            final_score = ?outcome.final_score,
            duration_ms = outcome.duration_ms,
            "Run finished"
        );
        self.sink.emit(event, Some(outcome.summary())).await;
        outcome
    }
}
