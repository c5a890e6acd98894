//! Publish/subscribe and point-to-point message routing.

use super::{Mailbox, MessageHandler};
use crate::core::{Message, MessageType};
use crate::errors::RouterError;
use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What a subscription listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Every message of one type.
    Type(MessageType),
    /// Every broadcast message, whatever its type.
    Broadcast,
}

impl From<MessageType> for Topic {
    fn from(message_type: MessageType) -> Self {
        Self::Type(message_type)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(t) => write!(f, "{t}"),
            Self::Broadcast => write!(f, "broadcast"),
        }
    }
}

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Router capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Capacity of each mailbox and each subscriber queue.
    pub queue_capacity: usize,
    /// Maximum retained dead letters.
    pub dead_letter_capacity: usize,
    /// Maximum retained history entries.
    pub history_capacity: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            dead_letter_capacity: 1000,
            history_capacity: 1000,
        }
    }
}

/// Router counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Messages placed in a recipient mailbox.
    pub delivered_direct: u64,
    /// Messages handed to subscriber queues.
    pub delivered_to_subscribers: u64,
    /// Messages handled successfully by subscribers.
    pub handled: u64,
    /// Handler calls that returned an error or panicked.
    pub handler_failures: u64,
    /// Messages routed to the dead-letter list.
    pub dead_lettered: u64,
    /// Dead letters evicted because the list was full.
    pub dead_letters_evicted: u64,
    /// Registered recipients.
    pub recipients: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered_direct: AtomicU64,
    delivered_to_subscribers: AtomicU64,
    handled: AtomicU64,
    handler_failures: AtomicU64,
    dead_lettered: AtomicU64,
    dead_letters_evicted: AtomicU64,
}

struct Subscription {
    id: SubscriptionId,
    tx: mpsc::Sender<Message>,
}

struct RouterInner {
    config: RouterConfig,
    mailboxes: DashMap<String, Arc<Mailbox>>,
    subscriptions: RwLock<HashMap<Topic, Vec<Subscription>>>,
    dead_letters: Mutex<VecDeque<Message>>,
    history: Mutex<VecDeque<Message>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    sequence: AtomicU64,
    next_subscription: AtomicU64,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

/// Asynchronous message router.
///
/// Direct messages land in the recipient's [`Mailbox`]; unknown recipients
/// go to a bounded dead-letter list. Every published message is also
/// offered to the subscribers of its type, and broadcast messages to
/// [`Topic::Broadcast`] subscribers. Each subscription owns a bounded queue
/// drained by its own delivery task, so a slow handler only slows its own
/// queue and a publisher waits only when that queue is full.
///
/// Cloning is cheap; clones share the same router.
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl Default for MessageRouter {
    fn default() -> Self {
        Self::new(RouterConfig::default())
    }
}

impl MessageRouter {
    /// Creates a router.
    #[must_use]
    pub fn new(config: RouterConfig) -> Self {
        info!(
            queue_capacity = config.queue_capacity,
            dead_letter_capacity = config.dead_letter_capacity,
            "Message router initialized"
        );
        Self {
            inner: Arc::new(RouterInner {
                config,
                mailboxes: DashMap::new(),
                subscriptions: RwLock::new(HashMap::new()),
                dead_letters: Mutex::new(VecDeque::new()),
                history: Mutex::new(VecDeque::new()),
                workers: Mutex::new(Vec::new()),
                sequence: AtomicU64::new(0),
                next_subscription: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                counters: Arc::new(Counters::default()),
            }),
        }
    }

    /// Returns the router configuration.
    #[must_use]
    pub fn config(&self) -> RouterConfig {
        self.inner.config
    }

    /// Registers a recipient and returns its mailbox.
    ///
    /// Registering an existing name returns the existing mailbox.
    pub fn register_recipient(&self, name: &str) -> Arc<Mailbox> {
        let mailbox = self
            .inner
            .mailboxes
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mailbox::new(name, self.inner.config.queue_capacity)));
        debug!(recipient = name, "Registered recipient");
        Arc::clone(mailbox.value())
    }

    /// Removes a recipient and closes its mailbox.
    ///
    /// Later messages for that name are dead-lettered.
    pub fn unregister_recipient(&self, name: &str) -> bool {
        match self.inner.mailboxes.remove(name) {
            Some((_, mailbox)) => {
                mailbox.close();
                debug!(recipient = name, "Unregistered recipient");
                true
            }
            None => false,
        }
    }

    /// Creates and publishes a direct message.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] if the router is closed.
    pub async fn send(
        &self,
        sender: &str,
        recipient: &str,
        message_type: MessageType,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<Message, RouterError> {
        let message = Message::new(message_type, sender, recipient, payload).with_priority(priority);
        self.publish(message).await
    }

    /// Publishes a message and returns it with its arrival sequence set.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Closed`] if the router is closed.
    pub async fn publish(&self, mut message: Message) -> Result<Message, RouterError> {
        if self.is_closed() {
            return Err(RouterError::Closed);
        }

        message.sequence = self.inner.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.record_history(&message);

        if let Some(recipient) = message.recipient.as_deref().filter(|r| !r.is_empty()) {
            let mailbox = self
                .inner
                .mailboxes
                .get(recipient)
                .map(|entry| Arc::clone(entry.value()));
            match mailbox {
                Some(mailbox) => match mailbox.push(message.clone()).await {
                    Ok(()) => {
                        self.inner
                            .counters
                            .delivered_direct
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(message_id = %message.id, error = %e, "Direct delivery failed");
                        self.dead_letter(message.clone());
                    }
                },
                None => {
                    warn!(
                        message_id = %message.id,
                        recipient,
                        "Unknown recipient, message dead-lettered"
                    );
                    self.dead_letter(message.clone());
                }
            }
        }

        for tx in self.subscribers_for(&message) {
            if tx.send(message.clone()).await.is_ok() {
                self.inner
                    .counters
                    .delivered_to_subscribers
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        debug!(
            message_id = %message.id,
            message_type = %message.message_type,
            sender = %message.sender,
            recipient = ?message.recipient,
            "Published message"
        );
        Ok(message)
    }

    /// Subscribes a handler to a topic.
    ///
    /// Must be called from within a Tokio runtime: the subscription's
    /// delivery task is spawned here. Only messages published after this
    /// call are delivered.
    pub fn subscribe(&self, topic: impl Into<Topic>, handler: Arc<dyn MessageHandler>) -> SubscriptionId {
        let topic = topic.into();
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed) + 1);
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));

        let worker = tokio::spawn(deliver(
            id,
            topic,
            handler,
            rx,
            Arc::clone(&self.inner.counters),
        ));
        {
            let mut workers = self.inner.workers.lock();
            workers.retain(|handle| !handle.is_finished());
            workers.push(worker);
        }

        self.inner
            .subscriptions
            .write()
            .entry(topic)
            .or_default()
            .push(Subscription { id, tx });
        debug!(subscription = %id, topic = %topic, "New subscription");
        id
    }

    /// Removes a subscription. Returns false if it did not exist.
    ///
    /// Messages already queued for the subscription are still delivered.
    pub fn unsubscribe(&self, topic: impl Into<Topic>, id: SubscriptionId) -> bool {
        let topic = topic.into();
        let mut subscriptions = self.inner.subscriptions.write();
        let Some(list) = subscriptions.get_mut(&topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|sub| sub.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscriptions.remove(&topic);
        }
        if removed {
            debug!(subscription = %id, topic = %topic, "Unsubscribed");
        }
        removed
    }

    /// Receives the next message for `recipient`.
    ///
    /// Returns `None` on timeout, for unknown recipients, and once the
    /// mailbox is closed and drained.
    pub async fn receive(&self, recipient: &str, timeout: Option<Duration>) -> Option<Message> {
        let mailbox = self
            .inner
            .mailboxes
            .get(recipient)
            .map(|entry| Arc::clone(entry.value()));
        match mailbox {
            Some(mailbox) => mailbox.recv_timeout(timeout).await,
            None => {
                warn!(recipient, "Receive on unregistered recipient");
                None
            }
        }
    }

    /// Returns the number of messages waiting for `recipient`.
    #[must_use]
    pub fn queue_size(&self, recipient: &str) -> usize {
        self.inner
            .mailboxes
            .get(recipient)
            .map_or(0, |entry| entry.value().len())
    }

    /// Returns the most recent `limit` published messages, oldest first.
    #[must_use]
    pub fn history(&self, limit: usize) -> Vec<Message> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Returns the retained dead letters, oldest first.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<Message> {
        self.inner.dead_letters.lock().iter().cloned().collect()
    }

    /// Returns router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        let counters = &self.inner.counters;
        RouterStats {
            published: counters.published.load(Ordering::Relaxed),
            delivered_direct: counters.delivered_direct.load(Ordering::Relaxed),
            delivered_to_subscribers: counters.delivered_to_subscribers.load(Ordering::Relaxed),
            handled: counters.handled.load(Ordering::Relaxed),
            handler_failures: counters.handler_failures.load(Ordering::Relaxed),
            dead_lettered: counters.dead_lettered.load(Ordering::Relaxed),
            dead_letters_evicted: counters.dead_letters_evicted.load(Ordering::Relaxed),
            recipients: self.inner.mailboxes.len(),
            subscriptions: self.inner.subscriptions.read().values().map(Vec::len).sum(),
        }
    }

    /// Returns true once the router is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Closes the router.
    ///
    /// New publishes are refused, mailboxes are closed, and every delivery
    /// task drains its queue before this returns.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Closing message router");

        for entry in &self.inner.mailboxes {
            entry.value().close();
        }
        self.inner.subscriptions.write().clear();

        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        info!("Message router closed");
    }

    fn record_history(&self, message: &Message) {
        let capacity = self.inner.config.history_capacity;
        if capacity == 0 {
            return;
        }
        let mut history = self.inner.history.lock();
        if history.len() >= capacity {
            history.pop_front();
        }
        history.push_back(message.clone());
    }

    fn dead_letter(&self, message: Message) {
        let counters = &self.inner.counters;
        counters.dead_lettered.fetch_add(1, Ordering::Relaxed);

        let capacity = self.inner.config.dead_letter_capacity;
        let mut dead_letters = self.inner.dead_letters.lock();
        while !dead_letters.is_empty() && dead_letters.len() >= capacity {
            if let Some(evicted) = dead_letters.pop_front() {
                counters.dead_letters_evicted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id = %evicted.id,
                    capacity,
                    "Dead-letter list full, evicting oldest"
                );
            }
        }
        if capacity > 0 {
            dead_letters.push_back(message);
        }
    }

    fn subscribers_for(&self, message: &Message) -> Vec<mpsc::Sender<Message>> {
        let subscriptions = self.inner.subscriptions.read();
        let mut targets: Vec<mpsc::Sender<Message>> = subscriptions
            .get(&Topic::Type(message.message_type))
            .map(|subs| subs.iter().map(|s| s.tx.clone()).collect())
            .unwrap_or_default();
        if message.is_broadcast() {
            if let Some(subs) = subscriptions.get(&Topic::Broadcast) {
                targets.extend(subs.iter().map(|s| s.tx.clone()));
            }
        }
        targets
    }
}

impl fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRouter")
            .field("config", &self.inner.config)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

async fn deliver(
    id: SubscriptionId,
    topic: Topic,
    handler: Arc<dyn MessageHandler>,
    mut rx: mpsc::Receiver<Message>,
    counters: Arc<Counters>,
) {
    while let Some(message) = rx.recv().await {
        match AssertUnwindSafe(handler.handle(&message)).catch_unwind().await {
            Ok(Ok(())) => {
                counters.handled.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscription = %id,
                    topic = %topic,
                    message_id = %message.id,
                    error = %e,
                    "Message handler failed"
                );
            }
            Err(_) => {
                counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    subscription = %id,
                    topic = %topic,
                    message_id = %message.id,
                    "Message handler panicked"
                );
            }
        }
    }
    debug!(subscription = %id, "Delivery loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::handler_fn;
    use crate::testing::RecordingHandler;
    use pretty_assertions::assert_eq;

    const WAIT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn test_send_and_receive() {
        let router = MessageRouter::default();
        router.register_recipient("writer");

        let sent = router
            .send("controller", "writer", MessageType::Task, serde_json::json!({"n": 1}), 0)
            .await
            .unwrap();
        assert_eq!(sent.sequence, 1);
        assert_eq!(router.queue_size("writer"), 1);

        let received = router.receive("writer", Some(WAIT)).await.unwrap();
        assert_eq!(received.id, sent.id);
        assert_eq!(router.queue_size("writer"), 0);
    }

    #[tokio::test]
    async fn test_priority_then_arrival_order() {
        let router = MessageRouter::default();
        router.register_recipient("inbox");

        router.send("a", "inbox", MessageType::Result, serde_json::json!("low"), 0).await.unwrap();
        router.send("b", "inbox", MessageType::Result, serde_json::json!("high"), 10).await.unwrap();
        router.send("c", "inbox", MessageType::Result, serde_json::json!("low2"), 0).await.unwrap();

        let mut payloads = Vec::new();
        while let Some(m) = router.receive("inbox", Some(Duration::from_millis(10))).await {
            payloads.push(m.payload);
        }
        assert_eq!(
            payloads,
            vec![
                serde_json::json!("high"),
                serde_json::json!("low"),
                serde_json::json!("low2")
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_recipient_dead_letter_eviction() {
        let router = MessageRouter::new(RouterConfig {
            dead_letter_capacity: 2,
            ..RouterConfig::default()
        });

        for n in 0..3 {
            router
                .send("controller", "ghost", MessageType::Task, serde_json::json!(n), 0)
                .await
                .unwrap();
        }

        let dead: Vec<_> = router.dead_letters().into_iter().map(|m| m.payload).collect();
        assert_eq!(dead, vec![serde_json::json!(1), serde_json::json!(2)]);
        let stats = router.stats();
        assert_eq!(stats.dead_lettered, 3);
        assert_eq!(stats.dead_letters_evicted, 1);
    }

    #[tokio::test]
    async fn test_subscribers_receive_by_type() {
        let router = MessageRouter::default();
        let status = Arc::new(RecordingHandler::new());
        let results = Arc::new(RecordingHandler::new());
        router.subscribe(MessageType::Status, status.clone());
        router.subscribe(MessageType::Result, results.clone());

        router
            .publish(Message::broadcast(MessageType::Status, "controller", serde_json::json!(1)))
            .await
            .unwrap();

        assert!(status.wait_for(1, WAIT).await);
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_skip_direct_messages() {
        let router = MessageRouter::default();
        router.register_recipient("worker");
        let all = Arc::new(RecordingHandler::new());
        router.subscribe(Topic::Broadcast, all.clone());

        router
            .send("controller", "worker", MessageType::Status, serde_json::json!("direct"), 0)
            .await
            .unwrap();
        router
            .publish(Message::broadcast(MessageType::Control, "controller", serde_json::json!("all")))
            .await
            .unwrap();

        assert!(all.wait_for(1, WAIT).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let seen = all.messages();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, serde_json::json!("all"));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let router = MessageRouter::default();
        let handler = Arc::new(RecordingHandler::new());
        let id = router.subscribe(MessageType::Status, handler.clone());

        assert!(router.unsubscribe(MessageType::Status, id));
        assert!(!router.unsubscribe(MessageType::Status, id));
        assert_eq!(router.stats().subscriptions, 0);

        router
            .publish(Message::broadcast(MessageType::Status, "controller", serde_json::json!(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(handler.is_empty());
    }

    #[tokio::test]
    async fn test_failing_handlers_are_isolated() {
        let router = MessageRouter::default();
        router.subscribe(
            MessageType::Error,
            handler_fn(|_| async { Err::<(), _>(anyhow::anyhow!("handler failure")) }),
        );
        router.subscribe(
            MessageType::Error,
            handler_fn(|message: Message| async move {
                assert!(message.payload.is_null(), "handler panic");
                Ok(())
            }),
        );
        let healthy = Arc::new(RecordingHandler::new());
        router.subscribe(MessageType::Error, healthy.clone());

        for n in 0..3 {
            router
                .publish(Message::broadcast(MessageType::Error, "executor", serde_json::json!(n)))
                .await
                .unwrap();
        }

        assert!(healthy.wait_for(3, WAIT).await);
        router.close().await;
        assert_eq!(router.stats().handler_failures, 6);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let router = MessageRouter::new(RouterConfig {
            history_capacity: 2,
            ..RouterConfig::default()
        });
        for n in 0..5 {
            router
                .publish(Message::broadcast(MessageType::Status, "c", serde_json::json!(n)))
                .await
                .unwrap();
        }
        let history = router.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].payload, serde_json::json!(4));
        assert_eq!(router.history(1).len(), 1);
    }

    #[tokio::test]
    async fn test_receive_unknown_and_timeout() {
        let router = MessageRouter::default();
        assert!(router.receive("nobody", Some(Duration::from_millis(5))).await.is_none());
        router.register_recipient("idle");
        assert!(router.receive("idle", Some(Duration::from_millis(5))).await.is_none());
    }

    #[tokio::test]
    async fn test_close_refuses_publish() {
        let router = MessageRouter::default();
        router.close().await;
        let err = router
            .publish(Message::broadcast(MessageType::Status, "c", serde_json::Value::Null))
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::Closed);
    }

    #[tokio::test]
    async fn test_unregistered_recipient_dead_letters() {
        let router = MessageRouter::default();
        router.register_recipient("inbox");
        assert!(router.unregister_recipient("inbox"));
        assert!(!router.unregister_recipient("inbox"));

        router
            .send("c", "inbox", MessageType::Result, serde_json::Value::Null, 0)
            .await
            .unwrap();
        assert_eq!(router.dead_letters().len(), 1);
    }
}
