//! Scripted capability and quality gate doubles.

use crate::capability::{
    Capability, CapabilityError, CapabilityOutput, CapabilityRequest, QualityGate,
};
use crate::state::DocumentState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Reply = Result<CapabilityOutput, CapabilityError>;

/// A capability that replays queued replies, then a fallback.
///
/// Records every request and the peak number of overlapping invocations.
#[derive(Debug)]
pub struct ScriptedCapability {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    delay: Duration,
    requests: Mutex<Vec<CapabilityRequest>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for ScriptedCapability {
    fn default() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Ok(CapabilityOutput::default()),
            delay: Duration::ZERO,
            requests: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

impl ScriptedCapability {
    /// Creates a capability that succeeds with empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a success with `data`.
    #[must_use]
    pub fn then_ok(self, data: serde_json::Value) -> Self {
        self.then_output(CapabilityOutput::new(data))
    }

    /// Queues a full output.
    #[must_use]
    pub fn then_output(self, output: CapabilityOutput) -> Self {
        self.script.lock().push_back(Ok(output));
        self
    }

    /// Queues a failure.
    #[must_use]
    pub fn then_err(self, error: CapabilityError) -> Self {
        self.script.lock().push_back(Err(error));
        self
    }

    /// Replies with `output` once the script is exhausted.
    #[must_use]
    pub fn fallback_output(mut self, output: CapabilityOutput) -> Self {
        self.fallback = Ok(output);
        self
    }

    /// Fails with `error` once the script is exhausted.
    #[must_use]
    pub fn fallback_err(mut self, error: CapabilityError) -> Self {
        self.fallback = Err(error);
        self
    }

    /// Sleeps for `delay` inside every invocation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of invocations so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request received, in arrival order.
    #[must_use]
    pub fn requests(&self) -> Vec<CapabilityRequest> {
        self.requests.lock().clone()
    }

    /// Highest number of invocations that overlapped.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Capability for ScriptedCapability {
    async fn invoke(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(current, Ordering::SeqCst);
        self.requests.lock().push(request);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

/// A quality gate that returns queued scores; the last one repeats.
#[derive(Debug)]
pub struct ScriptedQualityGate {
    scores: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
    evaluated: Mutex<Vec<u64>>,
}

impl ScriptedQualityGate {
    /// Creates a gate returning `scores` in order.
    #[must_use]
    pub fn new(scores: impl IntoIterator<Item = f64>) -> Self {
        Self {
            scores: Mutex::new(scores.into_iter().collect()),
            last: Mutex::new(0.0),
            evaluated: Mutex::new(Vec::new()),
        }
    }

    /// Document versions the gate was asked to score.
    #[must_use]
    pub fn evaluated_versions(&self) -> Vec<u64> {
        self.evaluated.lock().clone()
    }

    /// Number of evaluations so far.
    #[must_use]
    pub fn evaluations(&self) -> usize {
        self.evaluated.lock().len()
    }
}

#[async_trait]
impl QualityGate for ScriptedQualityGate {
    async fn evaluate(&self, document: &DocumentState) -> anyhow::Result<f64> {
        self.evaluated.lock().push(document.version);
        let mut last = self.last.lock();
        if let Some(score) = self.scores.lock().pop_front() {
            *last = score;
        }
        Ok(*last)
    }

    async fn generate_feedback(
        &self,
        document: &DocumentState,
        score: f64,
    ) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::json!({
            "score": score,
            "version": document.version,
            "suggestions": ["tighten the argument"],
        }))
    }
}
