//! Concurrency limiting for capability invocations.

mod pool;

pub use pool::{Acquisition, PoolStats, ResourceGuard, ResourcePool};
