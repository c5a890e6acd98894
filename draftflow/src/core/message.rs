//! Router message envelope.

use crate::utils::{generate_id, now, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of payload a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// A task assignment.
    Task,
    /// A task result.
    Result,
    /// A status update.
    Status,
    /// An error report.
    Error,
    /// A control command such as cancellation.
    Control,
}

impl MessageType {
    /// All message types, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Task,
        Self::Result,
        Self::Status,
        Self::Error,
        Self::Control,
    ];
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => write!(f, "task"),
            Self::Result => write!(f, "result"),
            Self::Status => write!(f, "status"),
            Self::Error => write!(f, "error"),
            Self::Control => write!(f, "control"),
        }
    }
}

/// An envelope exchanged between the controller and workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message id.
    pub id: String,
    /// The payload kind.
    pub message_type: MessageType,
    /// Who sent the message.
    pub sender: String,
    /// Direct recipient; `None` means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<String>,
    /// The payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Priority, higher is delivered first.
    #[serde(default)]
    pub priority: i32,
    /// Links a result back to the task message that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// When the message was created.
    pub created_at: Timestamp,
    /// Arrival order assigned by the router.
    #[serde(default)]
    pub sequence: u64,
}

impl Message {
    /// Creates a direct message.
    #[must_use]
    pub fn new(
        message_type: MessageType,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: generate_id(),
            message_type,
            sender: sender.into(),
            recipient: Some(recipient.into()),
            payload,
            priority: 0,
            correlation_id: None,
            created_at: now(),
            sequence: 0,
        }
    }

    /// Creates a broadcast message.
    #[must_use]
    pub fn broadcast(
        message_type: MessageType,
        sender: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            recipient: None,
            ..Self::new(message_type, sender, String::new(), payload)
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Returns true if the message has no direct recipient.
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        self.recipient.as_deref().map_or(true, str::is_empty)
    }
}
