//! Bounded priority mailbox for direct delivery.

use crate::core::Message;
use crate::errors::RouterError;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

/// Per-sender FIFO lanes. The next message is the highest-priority lane
/// head; equal priorities go by arrival sequence.
#[derive(Default)]
struct Lanes {
    by_sender: HashMap<String, VecDeque<Message>>,
    len: usize,
}

impl Lanes {
    fn push(&mut self, message: Message) {
        self.by_sender
            .entry(message.sender.clone())
            .or_default()
            .push_back(message);
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Message> {
        let sender = self
            .by_sender
            .iter()
            .filter_map(|(sender, lane)| lane.front().map(|head| (sender, head)))
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.sequence.cmp(&a.sequence))
            })
            .map(|(sender, _)| sender.clone())?;

        let lane = self.by_sender.get_mut(&sender)?;
        let message = lane.pop_front();
        if lane.is_empty() {
            self.by_sender.remove(&sender);
        }
        if message.is_some() {
            self.len -= 1;
        }
        message
    }
}

/// A recipient's inbox.
///
/// Pushes wait while the mailbox is full. After [`Mailbox::close`] new
/// pushes are refused but queued messages can still be received.
pub struct Mailbox {
    name: String,
    lanes: Mutex<Lanes>,
    slots: Semaphore,
    ready: Notify,
    closed: AtomicBool,
}

impl Mailbox {
    /// Creates a mailbox holding at most `capacity` messages.
    #[must_use]
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            lanes: Mutex::new(Lanes::default()),
            slots: Semaphore::new(capacity.max(1)),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the recipient name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueues a message, waiting for space if the mailbox is full.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::MailboxClosed`] if the mailbox is or becomes
    /// closed before space is available.
    pub async fn push(&self, message: Message) -> Result<(), RouterError> {
        let closed = || RouterError::MailboxClosed {
            recipient: self.name.clone(),
        };
        if self.is_closed() {
            return Err(closed());
        }
        self.slots.acquire().await.map_err(|_| closed())?.forget();
        self.lanes.lock().push(message);
        self.ready.notify_one();
        Ok(())
    }

    /// Takes the next message without waiting.
    #[must_use]
    pub fn try_recv(&self) -> Option<Message> {
        let message = self.lanes.lock().pop();
        if message.is_some() {
            self.slots.add_permits(1);
        }
        message
    }

    /// Waits for the next message.
    ///
    /// Returns `None` once the mailbox is closed and drained.
    pub async fn recv(&self) -> Option<Message> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(message) = self.try_recv() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            notified.await;
        }
    }

    /// Waits for the next message for at most `timeout`.
    pub async fn recv_timeout(&self, timeout: Option<Duration>) -> Option<Message> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, self.recv()).await.ok().flatten(),
            None => self.recv().await,
        }
    }

    /// Returns the number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lanes.lock().len
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuses further pushes and wakes every waiting receiver.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.slots.close();
            self.ready.notify_waiters();
        }
    }

    /// Returns true once [`Mailbox::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("name", &self.name)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MessageType;
    use std::sync::Arc;

    fn msg(sender: &str, priority: i32, sequence: u64) -> Message {
        let mut message = Message::new(
            MessageType::Result,
            sender,
            "inbox",
            serde_json::json!(sequence),
        )
        .with_priority(priority);
        message.sequence = sequence;
        message
    }

    #[tokio::test]
    async fn test_priority_across_senders() {
        let mailbox = Mailbox::new("inbox", 8);
        mailbox.push(msg("a", 0, 1)).await.unwrap();
        mailbox.push(msg("b", 5, 2)).await.unwrap();
        mailbox.push(msg("c", 0, 3)).await.unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| mailbox.try_recv())
            .map(|m| m.sequence)
            .collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn test_same_sender_stays_fifo() {
        let mailbox = Mailbox::new("inbox", 8);
        mailbox.push(msg("a", 0, 1)).await.unwrap();
        mailbox.push(msg("a", 9, 2)).await.unwrap();
        mailbox.push(msg("b", 3, 3)).await.unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| mailbox.try_recv())
            .map(|m| m.sequence)
            .collect();
        assert_eq!(order, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_full_mailbox_applies_backpressure() {
        let mailbox = Arc::new(Mailbox::new("inbox", 1));
        mailbox.push(msg("a", 0, 1)).await.unwrap();

        let pusher = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.push(msg("a", 0, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pusher.is_finished());

        assert_eq!(mailbox.recv().await.unwrap().sequence, 1);
        pusher.await.unwrap().unwrap();
        assert_eq!(mailbox.recv().await.unwrap().sequence, 2);
    }

    #[tokio::test]
    async fn test_recv_timeout_empty() {
        let mailbox = Mailbox::new("inbox", 1);
        assert!(mailbox
            .recv_timeout(Some(Duration::from_millis(10)))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let mailbox = Mailbox::new("inbox", 4);
        mailbox.push(msg("a", 0, 1)).await.unwrap();
        mailbox.close();

        assert!(mailbox.push(msg("a", 0, 2)).await.is_err());
        assert_eq!(mailbox.recv().await.unwrap().sequence, 1);
        assert!(mailbox.recv().await.is_none());
    }
}
