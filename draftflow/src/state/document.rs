//! Document state and its change log.

use crate::utils::{now, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of mutation a [`StateChange`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    /// The content was replaced.
    UpdateContent,
    /// Metadata keys were merged in.
    UpdateMetadata,
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateContent => write!(f, "update_content"),
            Self::UpdateMetadata => write!(f, "update_metadata"),
        }
    }
}

/// One entry of a document's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// The version this change produced.
    pub version: u64,
    /// Who made the change (a stage name, usually).
    pub actor: String,
    /// The kind of change.
    pub action: ChangeAction,
    /// When the change was applied.
    pub timestamp: Timestamp,
    /// Short human-readable description.
    pub summary: String,
}

/// The shared document a run works on.
///
/// `version` starts at 0 and grows by one per mutation, and
/// `history.len() == version` always holds. Only
/// [`VersionedStateStore`](super::VersionedStateStore) mutates it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    /// Document id.
    pub document_id: String,
    /// Current version.
    pub version: u64,
    /// Opaque content.
    pub content: serde_json::Value,
    /// Free-form metadata (topic, requirements, ...).
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Change log, one entry per version.
    #[serde(default)]
    pub history: Vec<StateChange>,
    /// When the document was created.
    pub created_at: Timestamp,
    /// When the document last changed.
    pub updated_at: Timestamp,
}

impl DocumentState {
    pub(crate) fn new(
        document_id: impl Into<String>,
        content: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let created_at = now();
        Self {
            document_id: document_id.into(),
            version: 0,
            content,
            metadata,
            history: Vec::new(),
            created_at,
            updated_at: created_at,
        }
    }

    pub(crate) fn record(&mut self, actor: &str, action: ChangeAction, summary: String) -> u64 {
        self.version += 1;
        self.updated_at = now();
        self.history.push(StateChange {
            version: self.version,
            actor: actor.to_string(),
            action,
            timestamp: self.updated_at,
            summary,
        });
        self.version
    }

    /// Returns the content as text if it is a JSON string.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.as_str()
    }

    /// Returns the most recent change, if any.
    #[must_use]
    pub fn last_change(&self) -> Option<&StateChange> {
        self.history.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_keeps_history_in_step() {
        let mut doc = DocumentState::new("doc", serde_json::json!(""), serde_json::Map::new());
        assert_eq!(doc.version, 0);
        assert!(doc.last_change().is_none());

        let v = doc.record("writing", ChangeAction::UpdateContent, "draft".to_string());
        assert_eq!(v, 1);
        assert_eq!(doc.history.len() as u64, doc.version);
        assert_eq!(doc.last_change().unwrap().actor, "writing");
    }

    #[test]
    fn test_text_accessor() {
        let doc = DocumentState::new("doc", serde_json::json!("hello"), serde_json::Map::new());
        assert_eq!(doc.text(), Some("hello"));
        assert_eq!(ChangeAction::UpdateMetadata.to_string(), "update_metadata");
    }
}
