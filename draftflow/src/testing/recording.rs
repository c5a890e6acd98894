//! Message handler doubles.

use crate::core::Message;
use crate::router::MessageHandler;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Records every delivered message.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<Message>>,
}

impl RecordingHandler {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received so far, in delivery order.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Number of messages received.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Returns true if nothing was delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Waits until at least `count` messages arrived; false on timeout.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.len() >= count {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}

/// Fails every delivery and counts the attempts.
#[derive(Debug, Default)]
pub struct FailingHandler {
    failures: AtomicUsize,
}

impl FailingHandler {
    /// Creates a handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliveries seen.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for FailingHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        self.failures.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("refused message {}", message.id)
    }
}
