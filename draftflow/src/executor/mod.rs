//! Stage execution with bounded concurrency and retries.

mod retry;
mod stage_executor;

pub use retry::{JitterStrategy, RetryConfig, RetryDecision};
pub use stage_executor::{ExecutorConfig, StageBinding, StageExecutor};
