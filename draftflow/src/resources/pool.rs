//! Bounded pool of execution slots.

use crate::cancellation::CancellationToken;
use crate::errors::ResourceTimeoutError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[derive(Default)]
struct PoolState {
    holders: Mutex<HashMap<u64, String>>,
    next_guard_id: AtomicU64,
    allocations: AtomicU64,
    releases: AtomicU64,
    timeouts: AtomicU64,
    peak_usage: AtomicUsize,
    total_wait_us: AtomicU64,
}

/// Outcome of a pool acquisition that did not time out.
#[derive(Debug)]
pub enum Acquisition {
    /// A slot was granted; it is released when the guard drops.
    Granted(ResourceGuard),
    /// The caller's cancellation token fired while waiting.
    Cancelled,
}

/// A point-in-time view of pool usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total slots.
    pub capacity: usize,
    /// Free slots.
    pub available: usize,
    /// Slots currently held.
    pub in_use: usize,
    /// Names of current holders, sorted.
    pub holders: Vec<String>,
    /// Highest simultaneous usage observed.
    pub peak_usage: usize,
    /// Slots granted so far.
    pub total_allocations: u64,
    /// Slots returned so far.
    pub total_releases: u64,
    /// Acquisitions that timed out.
    pub timeouts: u64,
    /// Mean wait of granted acquisitions.
    pub avg_wait_ms: f64,
    /// `in_use / capacity`.
    pub utilization: f64,
}

/// A counting semaphore over `capacity` slots with holder bookkeeping.
///
/// At any instant at most `capacity` guards exist. Waiters are served in
/// FIFO order.
#[derive(Clone)]
pub struct ResourcePool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    state: Arc<PoolState>,
}

impl ResourcePool {
    /// Creates a pool with `capacity` slots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "Resource pool initialized");
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            state: Arc::new(PoolState::default()),
        }
    }

    /// Returns the total number of slots.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of free slots.
    #[must_use]
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Waits for a slot.
    ///
    /// With `timeout == None` the call waits indefinitely. Cancellation of
    /// `cancel` while waiting yields [`Acquisition::Cancelled`]; a token that
    /// is already cancelled wins over a free slot.
    ///
    /// # Errors
    ///
    /// Returns [`ResourceTimeoutError`] if no slot became free in time.
    pub async fn acquire(
        &self,
        holder: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Acquisition, ResourceTimeoutError> {
        let started = Instant::now();
        let permit = self.semaphore.clone().acquire_owned();
        let waited = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, permit).await.ok(),
                None => Some(permit.await),
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            () = cancelled => return Ok(Acquisition::Cancelled),
            outcome = waited => outcome,
        };

        match outcome {
            Some(Ok(permit)) => Ok(Acquisition::Granted(self.grant(holder, permit, started))),
            // The semaphore is never closed, so only the timeout lands here.
            Some(Err(_)) | None => {
                self.state.timeouts.fetch_add(1, Ordering::Relaxed);
                let waited_ms = duration_ms(started.elapsed());
                warn!(holder, waited_ms, "Resource acquisition timed out");
                Err(ResourceTimeoutError {
                    holder: holder.to_string(),
                    waited_ms,
                })
            }
        }
    }

    /// Takes a slot if one is free right now.
    #[must_use]
    pub fn try_acquire(&self, holder: &str) -> Option<ResourceGuard> {
        let started = Instant::now();
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| self.grant(holder, permit, started))
    }

    /// Returns current usage statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let mut holders: Vec<String> = self.state.holders.lock().values().cloned().collect();
        holders.sort();
        let allocations = self.state.allocations.load(Ordering::Relaxed);
        let total_wait_us = self.state.total_wait_us.load(Ordering::Relaxed);
        #[allow(clippy::cast_precision_loss)]
        let avg_wait_ms = if allocations == 0 {
            0.0
        } else {
            total_wait_us as f64 / allocations as f64 / 1000.0
        };
        #[allow(clippy::cast_precision_loss)]
        let utilization = if self.capacity == 0 {
            0.0
        } else {
            holders.len() as f64 / self.capacity as f64
        };

        PoolStats {
            capacity: self.capacity,
            available: self.available(),
            in_use: holders.len(),
            holders,
            peak_usage: self.state.peak_usage.load(Ordering::Relaxed),
            total_allocations: allocations,
            total_releases: self.state.releases.load(Ordering::Relaxed),
            timeouts: self.state.timeouts.load(Ordering::Relaxed),
            avg_wait_ms,
            utilization,
        }
    }

    fn grant(&self, holder: &str, permit: OwnedSemaphorePermit, started: Instant) -> ResourceGuard {
        let id = self.state.next_guard_id.fetch_add(1, Ordering::Relaxed);
        let in_use = {
            let mut holders = self.state.holders.lock();
            holders.insert(id, holder.to_string());
            holders.len()
        };
        self.state.peak_usage.fetch_max(in_use, Ordering::Relaxed);
        self.state.allocations.fetch_add(1, Ordering::Relaxed);
        let wait_us = u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.state.total_wait_us.fetch_add(wait_us, Ordering::Relaxed);
        debug!(holder, available = self.available(), "Resource acquired");

        ResourceGuard {
            _permit: permit,
            id,
            holder: holder.to_string(),
            state: Arc::clone(&self.state),
        }
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("capacity", &self.capacity)
            .field("available", &self.available())
            .finish_non_exhaustive()
    }
}

/// A held pool slot, returned to the pool on drop.
pub struct ResourceGuard {
    _permit: OwnedSemaphorePermit,
    id: u64,
    holder: String,
    state: Arc<PoolState>,
}

impl ResourceGuard {
    /// Returns the holder name the slot was granted to.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.state.holders.lock().remove(&self.id);
        self.state.releases.fetch_add(1, Ordering::Relaxed);
        debug!(holder = %self.holder, "Resource released");
    }
}

impl std::fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn granted(acquisition: Acquisition) -> ResourceGuard {
        match acquisition {
            Acquisition::Granted(guard) => guard,
            Acquisition::Cancelled => panic!("unexpected cancellation"),
        }
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = ResourcePool::new(2);
        let guard = granted(pool.acquire("draft", None, None).await.unwrap());
        assert_eq!(guard.holder(), "draft");
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.stats().holders, vec!["draft".to_string()]);

        drop(guard);
        let stats = pool.stats();
        assert_eq!(stats.available, 2);
        assert_eq!(stats.total_allocations, 1);
        assert_eq!(stats.total_releases, 1);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn test_capacity_never_exceeded() {
        let pool = ResourcePool::new(1);
        let _held = granted(pool.acquire("a", None, None).await.unwrap());
        assert!(pool.try_acquire("b").is_none());

        let err = pool
            .acquire("b", Some(Duration::from_millis(20)), None)
            .await
            .unwrap_err();
        assert_eq!(err.holder, "b");
        assert_eq!(pool.stats().timeouts, 1);
        assert_eq!(pool.stats().peak_usage, 1);
    }

    #[tokio::test]
    async fn test_waiter_granted_after_release() {
        let pool = ResourcePool::new(1);
        let held = granted(pool.acquire("a", None, None).await.unwrap());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                matches!(
                    pool.acquire("b", Some(Duration::from_secs(1)), None).await,
                    Ok(Acquisition::Granted(_))
                )
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_while_waiting() {
        let pool = ResourcePool::new(1);
        let _held = granted(pool.acquire("a", None, None).await.unwrap());
        let token = CancellationToken::new();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel("stop");
        });

        let outcome = pool.acquire("b", None, Some(&token)).await.unwrap();
        assert!(matches!(outcome, Acquisition::Cancelled));
        assert_eq!(pool.stats().total_allocations, 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_wins_over_free_slot() {
        let pool = ResourcePool::new(1);
        let token = CancellationToken::new();
        token.cancel("gone");

        let outcome = pool.acquire("a", None, Some(&token)).await.unwrap();
        assert!(matches!(outcome, Acquisition::Cancelled));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_with_free_slot() {
        let pool = ResourcePool::new(1);
        let outcome = pool.acquire("a", Some(Duration::ZERO), None).await.unwrap();
        assert!(matches!(outcome, Acquisition::Granted(_)));
    }
}
