//! Engine and per-run configuration.

use crate::cancellation::CancellationToken;
use crate::errors::{codes, ConfigurationError, ErrorInfo};
use crate::executor::{ExecutorConfig, RetryConfig};
use crate::router::RouterConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of concurrent capability invocations.
pub const DEFAULT_POOL_SIZE: usize = 10;
/// Default gate score at which a run completes.
pub const DEFAULT_QUALITY_THRESHOLD: f64 = 0.85;
/// Default number of passes before a run fails.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;
/// Default per-invocation capability timeout.
pub const DEFAULT_STAGE_TIMEOUT_MS: u64 = 120_000;

/// Engine-wide settings.
///
/// Every field has a default, so partial JSON documents deserialize:
///
/// ```
/// use draftflow::config::EngineConfig;
///
/// let config = EngineConfig::from_json_str(r#"{"pool_size": 4}"#).unwrap();
/// assert_eq!(config.pool_size, 4);
/// assert_eq!(config.max_iterations, 3);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Resource pool capacity.
    pub pool_size: usize,
    /// Gate score in `[0, 1]` at which a run completes.
    pub quality_threshold: f64,
    /// Maximum passes per run.
    pub max_iterations: u32,
    /// Retry policy for transient failures.
    pub retry: RetryConfig,
    /// Capability timeout for stages that set none.
    pub stage_timeout_ms: u64,
    /// Pool acquisition timeout per attempt; `None` waits indefinitely.
    pub acquire_timeout_ms: Option<u64>,
    /// Per-mailbox and per-subscriber queue bound.
    pub queue_capacity: usize,
    /// Dead-letter list bound.
    pub dead_letter_capacity: usize,
    /// Router message history bound.
    pub history_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let router = RouterConfig::default();
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            quality_threshold: DEFAULT_QUALITY_THRESHOLD,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            retry: RetryConfig::default(),
            stage_timeout_ms: DEFAULT_STAGE_TIMEOUT_MS,
            acquire_timeout_ms: None,
            queue_capacity: router.queue_capacity,
            dead_letter_capacity: router.dead_letter_capacity,
            history_capacity: router.history_capacity,
        }
    }
}

impl EngineConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses and validates a JSON configuration.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-INVALID_OPTION` error for malformed JSON or
    /// out-of-range values.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigurationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| {
            invalid_option("config", format!("Malformed engine configuration: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the pool capacity.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Sets the quality threshold.
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = threshold;
        self
    }

    /// Sets the iteration budget.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the default stage timeout.
    #[must_use]
    pub fn with_stage_timeout(mut self, timeout: Duration) -> Self {
        self.stage_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the pool acquisition timeout.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Sets the dead-letter bound.
    #[must_use]
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = capacity;
        self
    }

    /// Checks every option is in range.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-INVALID_OPTION` error naming the first bad option.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.pool_size == 0 {
            return Err(invalid_option("pool_size", "pool_size must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.quality_threshold) {
            return Err(invalid_option(
                "quality_threshold",
                format!("quality_threshold must be in [0, 1], got {}", self.quality_threshold),
            ));
        }
        if self.max_iterations == 0 {
            return Err(invalid_option("max_iterations", "max_iterations must be at least 1"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid_option(
                "retry",
                "retry.base_delay_ms must not exceed retry.max_delay_ms",
            ));
        }
        if self.stage_timeout_ms == 0 {
            return Err(invalid_option("stage_timeout_ms", "stage_timeout_ms must be positive"));
        }
        for (option, value) in [
            ("queue_capacity", self.queue_capacity),
            ("dead_letter_capacity", self.dead_letter_capacity),
            ("history_capacity", self.history_capacity),
        ] {
            if value == 0 {
                return Err(invalid_option(option, format!("{option} must be at least 1")));
            }
        }
        Ok(())
    }

    /// Returns the default stage timeout.
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    /// Router settings derived from this config.
    #[must_use]
    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            queue_capacity: self.queue_capacity,
            dead_letter_capacity: self.dead_letter_capacity,
            history_capacity: self.history_capacity,
        }
    }

    /// Executor settings derived from this config.
    #[must_use]
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            retry: self.retry,
            default_timeout: self.stage_timeout(),
            acquire_timeout: self.acquire_timeout_ms.map(Duration::from_millis),
        }
    }
}

fn invalid_option(option: &str, message: impl Into<String>) -> ConfigurationError {
    let message = message.into();
    ConfigurationError::new(message.clone()).with_error_info(
        ErrorInfo::new(codes::INVALID_OPTION, message).with_context_entry("option", option),
    )
}

/// Per-run overrides.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Template the run was started from, for logging.
    pub document_type: Option<String>,
    /// Id of the document the run writes; generated when absent.
    pub document_id: Option<String>,
    /// Initial document content.
    pub initial_content: Option<serde_json::Value>,
    /// Overrides the engine quality threshold.
    pub quality_threshold: Option<f64>,
    /// Overrides the engine iteration budget.
    pub max_iterations: Option<u32>,
    /// External cancellation token; a fresh one is created when absent.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the document type.
    #[must_use]
    pub fn with_document_type(mut self, document_type: impl Into<String>) -> Self {
        self.document_type = Some(document_type.into());
        self
    }

    /// Sets the document id.
    #[must_use]
    pub fn with_document_id(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    /// Sets the initial document content.
    #[must_use]
    pub fn with_initial_content(mut self, content: serde_json::Value) -> Self {
        self.initial_content = Some(content);
        self
    }

    /// Overrides the quality threshold.
    #[must_use]
    pub fn with_quality_threshold(mut self, threshold: f64) -> Self {
        self.quality_threshold = Some(threshold);
        self
    }

    /// Overrides the iteration budget.
    #[must_use]
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = Some(max_iterations);
        self
    }

    /// Uses an external cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Resolves the effective threshold and budget against `config`.
    ///
    /// # Errors
    ///
    /// Returns a `CONFIG-INVALID_OPTION` error for out-of-range overrides.
    pub fn resolve(&self, config: &EngineConfig) -> Result<(f64, u32), ConfigurationError> {
        let threshold = self.quality_threshold.unwrap_or(config.quality_threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(invalid_option(
                "quality_threshold",
                format!("quality_threshold must be in [0, 1], got {threshold}"),
            ));
        }
        let max_iterations = self.max_iterations.unwrap_or(config.max_iterations);
        if max_iterations == 0 {
            return Err(invalid_option("max_iterations", "max_iterations must be at least 1"));
        }
        Ok((threshold, max_iterations))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.pool_size, 10);
        assert_eq!(config.quality_threshold, 0.85);
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.stage_timeout(), Duration::from_secs(120));
        assert_eq!(config.dead_letter_capacity, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = EngineConfig::from_json_str(
            r#"{"quality_threshold": 0.9, "retry": {"max_retries": 1}}"#,
        )
        .unwrap();
        assert_eq!(config.quality_threshold, 0.9);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.base_delay_ms, 1000);
        assert_eq!(config.pool_size, 10);
    }

    #[test]
    fn test_invalid_options() {
        let err = EngineConfig::default().with_pool_size(0).validate().unwrap_err();
        assert_eq!(err.code(), Some(codes::INVALID_OPTION));

        assert!(EngineConfig::default().with_quality_threshold(1.5).validate().is_err());
        assert!(EngineConfig::default().with_max_iterations(0).validate().is_err());
        assert!(EngineConfig::from_json_str("{not json").is_err());
        assert!(EngineConfig::from_json_str(r#"{"history_capacity": 0}"#).is_err());
    }

    #[test]
    fn test_derived_configs() {
        let config = EngineConfig::default()
            .with_acquire_timeout(Duration::from_millis(250))
            .with_dead_letter_capacity(5);
        assert_eq!(config.router_config().dead_letter_capacity, 5);
        let executor = config.executor_config();
        assert_eq!(executor.acquire_timeout, Some(Duration::from_millis(250)));
        assert_eq!(executor.default_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_run_options_resolve() {
        let config = EngineConfig::default();
        assert_eq!(RunOptions::new().resolve(&config).unwrap(), (0.85, 3));

        let options = RunOptions::new().with_quality_threshold(0.5).with_max_iterations(1);
        assert_eq!(options.resolve(&config).unwrap(), (0.5, 1));

        assert!(RunOptions::new().with_max_iterations(0).resolve(&config).is_err());
    }
}
