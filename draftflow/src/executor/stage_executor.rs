//! Runs one task: acquire a slot, invoke the capability, retry, report.

use super::{RetryConfig, RetryDecision};
use crate::cancellation::CancellationToken;
use crate::capability::{
    Capability, CapabilityContext, CapabilityError, CapabilityOutput, CapabilityRegistry,
    CapabilityRequest,
};
use crate::core::{ErrorKind, Message, MessageType, ResultMetrics, Task, TaskResult};
use crate::resources::{Acquisition, ResourcePool};
use crate::router::MessageRouter;
use crate::state::VersionedStateStore;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Executor settings shared by every task of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Capability timeout when the stage sets none.
    pub default_timeout: Duration,
    /// Pool acquisition timeout per attempt; `None` waits indefinitely.
    pub acquire_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            default_timeout: Duration::from_secs(120),
            acquire_timeout: None,
        }
    }
}

/// Everything a task needs besides the task itself.
#[derive(Clone)]
pub struct StageBinding {
    /// The resolved capability.
    pub capability: Arc<dyn Capability>,
    /// Stage timeout override.
    pub timeout: Option<Duration>,
    /// Stage settings forwarded in the capability context.
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Id of the TASK message this execution answers.
    pub correlation_id: Option<String>,
}

impl std::fmt::Debug for StageBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageBinding")
            .field("timeout", &self.timeout)
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}

enum InvokeError {
    Capability(CapabilityError),
    Panicked(String),
}

enum Outcome {
    Success {
        output: serde_json::Value,
        committed_version: Option<u64>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

impl Outcome {
    fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }
}

/// Executes tasks for one run.
///
/// [`StageExecutor::execute`] never fails and never panics: every outcome,
/// including cancellation and capability panics, is encoded in the
/// returned [`TaskResult`], and exactly one RESULT message is published per
/// task.
pub struct StageExecutor {
    pool: ResourcePool,
    router: MessageRouter,
    store: Arc<VersionedStateStore>,
    registry: Arc<CapabilityRegistry>,
    config: ExecutorConfig,
    cancel: CancellationToken,
    document_id: Option<String>,
    reply_to: Option<String>,
}

impl StageExecutor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        pool: ResourcePool,
        router: MessageRouter,
        store: Arc<VersionedStateStore>,
        registry: Arc<CapabilityRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            pool,
            router,
            store,
            registry,
            config,
            cancel: CancellationToken::new(),
            document_id: None,
            reply_to: None,
        }
    }

    /// Observes `token` while waiting for a slot or backing off.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Commits capability documents to `document_id`.
    #[must_use]
    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Sends RESULT messages to `recipient` instead of broadcasting them.
    #[must_use]
    pub fn with_reply_to(mut self, recipient: impl Into<String>) -> Self {
        self.reply_to = Some(recipient.into());
        self
    }

    /// Runs the task to completion.
    pub async fn execute(&self, mut task: Task, binding: &StageBinding) -> TaskResult {
        let started = Instant::now();
        let mut metrics = ResultMetrics::default();
        let holder = format!("{}#{}", task.stage_name, task.task_id);

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break Outcome::failure(ErrorKind::Cancelled, self.cancel_reason());
            }

            let guard = match self
                .pool
                .acquire(&holder, self.config.acquire_timeout, Some(&self.cancel))
                .await
            {
                Ok(Acquisition::Granted(guard)) => guard,
                Ok(Acquisition::Cancelled) => {
                    break Outcome::failure(ErrorKind::Cancelled, self.cancel_reason());
                }
                Err(timeout) => match self.config.retry.decide(task.attempt, true) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            stage = %task.stage_name,
                            attempt = task.attempt,
                            delay_ms = delay_ms(delay),
                            "Resource acquisition timed out, retrying"
                        );
                        if !self.backoff(delay).await {
                            break Outcome::failure(ErrorKind::Cancelled, self.cancel_reason());
                        }
                        task.attempt += 1;
                        continue;
                    }
                    _ => break Outcome::failure(ErrorKind::ResourceTimeout, timeout.to_string()),
                },
            };

            metrics.resource_units += 1;
            metrics.invocations += 1;
            let invoked = self.invoke(&task, binding).await;
            drop(guard);

            match invoked {
                Ok(output) => break self.commit(&task, output).await,
                Err(InvokeError::Panicked(message)) => {
                    error!(stage = %task.stage_name, message = %message, "Capability panicked");
                    break Outcome::failure(
                        ErrorKind::Internal,
                        format!("capability panicked: {message}"),
                    );
                }
                Err(InvokeError::Capability(err)) => {
                    match self.config.retry.decide(task.attempt, err.is_retryable()) {
                        RetryDecision::Retry(delay) => {
                            warn!(
                                stage = %task.stage_name,
                                attempt = task.attempt,
                                delay_ms = delay_ms(delay),
                                error = %err,
                                "Transient capability failure, retrying"
                            );
                            if !self.backoff(delay).await {
                                break Outcome::failure(ErrorKind::Cancelled, self.cancel_reason());
                            }
                            task.attempt += 1;
                        }
                        RetryDecision::GiveUp => {
                            break Outcome::failure(ErrorKind::RetriesExhausted, err.to_string());
                        }
                        RetryDecision::NotRetryable => {
                            break Outcome::failure(ErrorKind::NonRetryable, err.to_string());
                        }
                    }
                }
            }
        };

        metrics.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let result = match outcome {
            Outcome::Success {
                output,
                committed_version,
            } => {
                info!(
                    stage = %task.stage_name,
                    attempt = task.attempt,
                    elapsed_ms = metrics.elapsed_ms,
                    "Stage succeeded"
                );
                let result = TaskResult::success(&task, output, metrics);
                match committed_version {
                    Some(version) => result.with_committed_version(version),
                    None => result,
                }
            }
            Outcome::Failure { kind, message } => {
                warn!(
                    stage = %task.stage_name,
                    attempt = task.attempt,
                    error_kind = %kind,
                    message = %message,
                    "Stage failed"
                );
                TaskResult::failure(&task, kind, message, metrics)
            }
        };

        self.publish_result(&task, binding, &result).await;
        result
    }

    async fn invoke(&self, task: &Task, binding: &StageBinding) -> Result<CapabilityOutput, InvokeError> {
        let timeout = binding.timeout.unwrap_or(self.config.default_timeout);
        let request = CapabilityRequest {
            capability_id: task.capability.clone(),
            payload: task.payload.clone(),
            timeout,
            context: CapabilityContext {
                run_id: task.run_id.clone(),
                task_id: task.task_id.clone(),
                stage: task.stage_name.clone(),
                attempt: task.attempt,
                iteration: task.iteration,
                settings: binding.settings.clone(),
            },
        };

        debug!(stage = %task.stage_name, attempt = task.attempt, "Invoking capability");
        let started = Instant::now();
        let call = AssertUnwindSafe(binding.capability.invoke(request)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(err))) => Err(InvokeError::Capability(err)),
            Ok(Err(panic)) => Err(InvokeError::Panicked(panic_message(panic.as_ref()))),
            Err(_) => Err(InvokeError::Capability(CapabilityError::timeout(format!(
                "capability '{}' timed out after {}ms",
                task.capability,
                delay_ms(timeout)
            )))),
        };
        self.registry
            .record_invocation(&task.capability, outcome.is_ok(), started.elapsed());
        outcome
    }

    async fn commit(&self, task: &Task, output: CapabilityOutput) -> Outcome {
        let committed_version = match (output.document, self.document_id.as_deref()) {
            (Some(document), Some(document_id)) => {
                match self
                    .store
                    .update_content(document_id, document, &task.stage_name)
                    .await
                {
                    Ok(version) => Some(version),
                    Err(e) => {
                        return Outcome::failure(
                            ErrorKind::Internal,
                            format!("document commit failed: {e}"),
                        );
                    }
                }
            }
            (Some(_), None) => {
                debug!(stage = %task.stage_name, "No document bound, output document ignored");
                None
            }
            (None, _) => None,
        };
        Outcome::Success {
            output: output.data,
            committed_version,
        }
    }

    async fn backoff(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    async fn publish_result(&self, task: &Task, binding: &StageBinding, result: &TaskResult) {
        let payload = serde_json::to_value(result).unwrap_or_else(|e| {
            serde_json::json!({
                "task_id": result.task_id,
                "stage_name": result.stage_name,
                "success": false,
                "message": format!("unserializable result: {e}"),
            })
        });
        let sender = format!("executor:{}", task.stage_name);
        let message = match self.reply_to.as_deref() {
            Some(recipient) => Message::new(MessageType::Result, sender, recipient, payload),
            None => Message::broadcast(MessageType::Result, sender, payload),
        }
        .with_priority(task.priority);
        let message = match &binding.correlation_id {
            Some(id) => message.with_correlation_id(id.clone()),
            None => message,
        };

        if let Err(e) = self.router.publish(message).await {
            error!(stage = %task.stage_name, task_id = %task.task_id, error = %e, "Failed to publish RESULT");
        }
    }

    fn cancel_reason(&self) -> String {
        self.cancel
            .reason()
            .unwrap_or_else(|| "cancelled".to_string())
    }
}

impl std::fmt::Debug for StageExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageExecutor")
            .field("config", &self.config)
            .field("document_id", &self.document_id)
            .field("reply_to", &self.reply_to)
            .finish_non_exhaustive()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn delay_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::capability_fn;
    use crate::testing::ScriptedCapability;
    use pretty_assertions::assert_eq;

    struct Harness {
        pool: ResourcePool,
        router: MessageRouter,
        store: Arc<VersionedStateStore>,
        registry: Arc<CapabilityRegistry>,
    }

    impl Harness {
        fn new(capacity: usize) -> Self {
            Self {
                pool: ResourcePool::new(capacity),
                router: MessageRouter::default(),
                store: Arc::new(VersionedStateStore::new()),
                registry: Arc::new(CapabilityRegistry::new()),
            }
        }

        fn executor(&self, retry: RetryConfig) -> StageExecutor {
            StageExecutor::new(
                self.pool.clone(),
                self.router.clone(),
                Arc::clone(&self.store),
                Arc::clone(&self.registry),
                ExecutorConfig {
                    retry,
                    default_timeout: Duration::from_secs(1),
                    acquire_timeout: None,
                },
            )
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig::default()
            .with_max_retries(max_retries)
            .with_base_delay_ms(1)
            .with_max_delay_ms(4)
    }

    fn binding(capability: Arc<dyn Capability>) -> StageBinding {
        StageBinding {
            capability,
            timeout: None,
            settings: serde_json::Map::new(),
            correlation_id: Some("task-msg".to_string()),
        }
    }

    fn task(stage: &str) -> Task {
        Task::new("run-1", stage, "writing", serde_json::json!({"topic": "rust"}))
    }

    #[tokio::test]
    async fn test_success_commits_document() {
        let h = Harness::new(2);
        h.store.create_document("doc", serde_json::json!("")).await.unwrap();
        let inbox = h.router.register_recipient("controller");
        let executor = h.executor(fast_retry(3)).with_document("doc").with_reply_to("controller");

        let cap = capability_fn(|_| async {
            Ok(CapabilityOutput::new(serde_json::json!({"words": 3})).with_document(serde_json::json!("draft")))
        });
        let result = executor.execute(task("writing"), &binding(cap)).await;

        assert!(result.success);
        assert_eq!(result.attempt, 0);
        assert_eq!(result.committed_version, Some(1));
        let doc = h.store.get_document("doc").await.unwrap();
        assert_eq!(doc.content, serde_json::json!("draft"));
        assert_eq!(doc.history[0].actor, "writing");

        let message = inbox.try_recv().unwrap();
        assert_eq!(message.message_type, MessageType::Result);
        assert_eq!(message.correlation_id.as_deref(), Some("task-msg"));
        let echoed: TaskResult = serde_json::from_value(message.payload).unwrap();
        assert_eq!(echoed, result);
        assert!(inbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let h = Harness::new(1);
        let executor = h.executor(fast_retry(3));
        let cap = Arc::new(
            ScriptedCapability::new()
                .then_err(CapabilityError::rate_limited("429"))
                .then_err(CapabilityError::timeout("slow"))
                .then_ok(serde_json::json!("done")),
        );

        let result = executor.execute(task("writing"), &binding(cap.clone())).await;

        assert!(result.success);
        assert_eq!(result.attempt, 2);
        assert_eq!(result.metrics.invocations, 3);
        assert_eq!(cap.calls(), 3);
        let attempts: Vec<u32> = cap.requests().iter().map(|r| r.context.attempt).collect();
        assert_eq!(attempts, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let h = Harness::new(1);
        let executor = h.executor(fast_retry(2));
        let cap = Arc::new(ScriptedCapability::new().fallback_err(CapabilityError::rate_limited("429")));

        let result = executor.execute(task("writing"), &binding(cap.clone())).await;

        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::RetriesExhausted));
        assert_eq!(result.attempt, 2);
        assert_eq!(cap.calls(), 3);
        assert_eq!(h.registry.metrics("writing").unwrap().failures, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let h = Harness::new(1);
        let executor = h.executor(fast_retry(3));
        let cap = Arc::new(ScriptedCapability::new().then_err(CapabilityError::invalid_input("bad")));

        let result = executor.execute(task("writing"), &binding(cap.clone())).await;

        assert_eq!(result.error_kind, Some(ErrorKind::NonRetryable));
        assert_eq!(result.attempt, 0);
        assert_eq!(cap.calls(), 1);
    }

    #[tokio::test]
    async fn test_capability_timeout_is_transient() {
        let h = Harness::new(1);
        let executor = h.executor(fast_retry(1));
        let cap = capability_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(CapabilityOutput::default())
        });
        let mut bound = binding(cap);
        bound.timeout = Some(Duration::from_millis(10));

        let result = executor.execute(task("writing"), &bound).await;

        assert_eq!(result.error_kind, Some(ErrorKind::RetriesExhausted));
        assert_eq!(result.attempt, 1);
        assert!(result.message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_panic_is_internal_failure() {
        let h = Harness::new(1);
        let executor = h.executor(fast_retry(3));
        let cap = capability_fn(|request: CapabilityRequest| async move {
            assert!(request.payload.is_null(), "capability exploded");
            Ok(CapabilityOutput::default())
        });

        let result = executor.execute(task("writing"), &binding(cap)).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Internal));
        assert!(result.message.unwrap().contains("capability exploded"));
        assert_eq!(h.pool.available(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let h = Harness::new(1);
        let token = CancellationToken::new();
        token.cancel("user stop");
        let executor = h.executor(fast_retry(3)).with_cancellation(token);
        let cap = Arc::new(ScriptedCapability::new().then_ok(serde_json::json!(1)));

        let result = executor.execute(task("writing"), &binding(cap.clone())).await;

        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(result.message.as_deref(), Some("user stop"));
        assert_eq!(cap.calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let h = Harness::new(1);
        let token = CancellationToken::new();
        let executor = h
            .executor(RetryConfig::default().with_base_delay_ms(10_000).with_max_delay_ms(10_000))
            .with_cancellation(token.clone());
        let cap = Arc::new(ScriptedCapability::new().fallback_err(CapabilityError::rate_limited("429")));

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel("stop");
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            executor.execute(task("writing"), &binding(cap.clone())),
        )
        .await
        .unwrap();
        assert_eq!(result.error_kind, Some(ErrorKind::Cancelled));
        assert_eq!(cap.calls(), 1);
    }

    #[tokio::test]
    async fn test_resource_timeout_exhausts() {
        let h = Harness::new(1);
        let _held = h.pool.try_acquire("other").unwrap();
        let mut executor = h.executor(fast_retry(1));
        executor.config.acquire_timeout = Some(Duration::from_millis(5));
        let cap = Arc::new(ScriptedCapability::new().then_ok(serde_json::json!(1)));

        let result = executor.execute(task("writing"), &binding(cap.clone())).await;

        assert_eq!(result.error_kind, Some(ErrorKind::ResourceTimeout));
        assert_eq!(result.attempt, 1);
        assert_eq!(cap.calls(), 0);
    }
}
