//! External capability seam.
//!
//! A capability is the opaque unit of content work a stage is bound to
//! (research, drafting, editing, verification...). The engine never looks
//! inside one: it hands over a [`CapabilityRequest`], waits with a timeout,
//! and classifies the [`CapabilityError`] it gets back as retryable or not.

mod gate;
mod registry;

pub use gate::{evaluate_gate, normalize_score, GateVerdict, QualityGate};
pub use registry::{CapabilityMetrics, CapabilityRegistry};

#[cfg(test)]
pub use gate::MockQualityGate;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Per-invocation context passed explicitly to the capability.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityContext {
    /// The run this invocation belongs to.
    pub run_id: String,
    /// The task being executed.
    pub task_id: String,
    /// The stage being executed.
    pub stage: String,
    /// Retry counter of the task, 0 on the first attempt.
    pub attempt: u32,
    /// The controller pass.
    pub iteration: u32,
    /// The stage's settings (model, temperature, ...).
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// One capability invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// The capability identifier.
    pub capability_id: String,
    /// The task payload.
    pub payload: serde_json::Value,
    /// Time budget enforced by the executor.
    pub timeout: Duration,
    /// Invocation context.
    pub context: CapabilityContext,
}

/// What a capability returns on success.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutput {
    /// Stage output, handed to dependents and recorded in the result.
    pub data: serde_json::Value,
    /// New document content, committed to the state store if present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
}

impl CapabilityOutput {
    /// Creates an output without a document change.
    #[must_use]
    pub fn new(data: serde_json::Value) -> Self {
        Self {
            data,
            document: None,
        }
    }

    /// Attaches new document content.
    #[must_use]
    pub fn with_document(mut self, document: serde_json::Value) -> Self {
        self.document = Some(document);
        self
    }
}

/// Capability failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityErrorKind {
    /// The call took too long.
    Timeout,
    /// The backing service asked us to slow down.
    RateLimited,
    /// The input was rejected.
    InvalidInput,
    /// The capability itself is broken.
    Internal,
}

impl CapabilityErrorKind {
    /// Returns true for failures worth retrying.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited)
    }
}

impl fmt::Display for CapabilityErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::RateLimited => write!(f, "rate_limited"),
            Self::InvalidInput => write!(f, "invalid_input"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A classified capability failure.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct CapabilityError {
    /// Failure class.
    pub kind: CapabilityErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl CapabilityError {
    /// Creates an error of the given kind.
    #[must_use]
    pub fn new(kind: CapabilityErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Timeout, message)
    }

    /// Creates a rate-limit error.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::RateLimited, message)
    }

    /// Creates an invalid-input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::InvalidInput, message)
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Internal, message)
    }

    /// Returns true if the executor should retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// An external content-producing function.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Performs one invocation.
    async fn invoke(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError>;
}

/// Adapts an async closure into a [`Capability`].
pub struct FnCapability<F> {
    f: F,
}

impl<F> FnCapability<F> {
    /// Wraps a closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Capability for FnCapability<F>
where
    F: Fn(CapabilityRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<CapabilityOutput, CapabilityError>> + Send,
{
    async fn invoke(&self, request: CapabilityRequest) -> Result<CapabilityOutput, CapabilityError> {
        (self.f)(request).await
    }
}

/// Wraps an async closure as a shareable capability.
pub fn capability_fn<F, Fut>(f: F) -> Arc<dyn Capability>
where
    F: Fn(CapabilityRequest) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CapabilityOutput, CapabilityError>> + Send + 'static,
{
    Arc::new(FnCapability::new(f))
}
