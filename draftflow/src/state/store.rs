//! Versioned document store with per-document serialization.

use super::{ChangeAction, DocumentState, SnapshotBlob, StateChange};
use crate::errors::{StateConflictError, StateError};
use crate::utils::{now, preview, Timestamp};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SUMMARY_PREVIEW_CHARS: usize = 100;

/// One audited restore, the only operation that shrinks a history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRecord {
    /// The restored document.
    pub document_id: String,
    /// Version before the restore; `None` if the document did not exist.
    pub from_version: Option<u64>,
    /// Version after the restore.
    pub to_version: u64,
    /// When the restore happened.
    pub restored_at: Timestamp,
}

/// Owns every document of the engine.
///
/// Mutations of one document are serialized by that document's lock and
/// each successful mutation bumps the version by exactly one and appends
/// exactly one [`StateChange`]. Documents are independent of each other.
#[derive(Default)]
pub struct VersionedStateStore {
    documents: DashMap<String, Arc<Mutex<DocumentState>>>,
    restore_log: SyncMutex<Vec<RestoreRecord>>,
}

impl VersionedStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a document at version 0.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AlreadyExists`] if the id is taken.
    pub async fn create_document(
        &self,
        document_id: &str,
        content: serde_json::Value,
    ) -> Result<DocumentState, StateError> {
        self.create_document_with_metadata(document_id, content, serde_json::Map::new())
            .await
    }

    /// Creates a document at version 0 with initial metadata.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::AlreadyExists`] if the id is taken.
    pub async fn create_document_with_metadata(
        &self,
        document_id: &str,
        content: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<DocumentState, StateError> {
        match self.documents.entry(document_id.to_string()) {
            Entry::Occupied(_) => Err(StateError::already_exists(document_id)),
            Entry::Vacant(slot) => {
                let state = DocumentState::new(document_id, content, metadata);
                slot.insert(Arc::new(Mutex::new(state.clone())));
                debug!(document_id, "Created document");
                Ok(state)
            }
        }
    }

    /// Replaces the content and returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] for unknown ids.
    pub async fn update_content(
        &self,
        document_id: &str,
        content: serde_json::Value,
        actor: &str,
    ) -> Result<u64, StateError> {
        let cell = self.cell(document_id)?;
        let mut doc = cell.lock().await;
        Ok(apply_content(&mut doc, content, actor))
    }

    /// Replaces the content only if the document is still at `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] if another writer got there first,
    /// or [`StateError::NotFound`] for unknown ids.
    pub async fn commit_if_version(
        &self,
        document_id: &str,
        expected: u64,
        content: serde_json::Value,
        actor: &str,
    ) -> Result<u64, StateError> {
        let cell = self.cell(document_id)?;
        let mut doc = cell.lock().await;
        if doc.version != expected {
            return Err(StateConflictError {
                document_id: document_id.to_string(),
                expected,
                actual: doc.version,
            }
            .into());
        }
        Ok(apply_content(&mut doc, content, actor))
    }

    /// Merges `patch` into the metadata and returns the new version.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] for unknown ids.
    pub async fn update_metadata(
        &self,
        document_id: &str,
        patch: serde_json::Map<String, serde_json::Value>,
        actor: &str,
    ) -> Result<u64, StateError> {
        let cell = self.cell(document_id)?;
        let mut doc = cell.lock().await;
        let mut keys: Vec<&String> = patch.keys().collect();
        keys.sort();
        let summary = format!(
            "metadata: {}",
            keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", ")
        );
        doc.metadata.extend(patch);
        let version = doc.record(actor, ChangeAction::UpdateMetadata, summary);
        debug!(document_id, version, actor, "Updated document metadata");
        Ok(version)
    }

    /// Returns a copy of the document.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] for unknown ids.
    pub async fn get_document(&self, document_id: &str) -> Result<DocumentState, StateError> {
        let cell = self.cell(document_id)?;
        let doc = cell.lock().await;
        Ok(doc.clone())
    }

    /// Returns the document's change log.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] for unknown ids.
    pub async fn history(&self, document_id: &str) -> Result<Vec<StateChange>, StateError> {
        let cell = self.cell(document_id)?;
        let doc = cell.lock().await;
        Ok(doc.history.clone())
    }

    /// Captures the document as an opaque blob.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] for unknown ids.
    pub async fn snapshot(&self, document_id: &str) -> Result<SnapshotBlob, StateError> {
        let cell = self.cell(document_id)?;
        let doc = cell.lock().await;
        SnapshotBlob::encode(&doc)
    }

    /// Replaces a document with a snapshot.
    ///
    /// Version, content, metadata and history all return to the snapshot's
    /// values, which truncates history written after the snapshot. The
    /// document is created if it no longer exists. Every restore is logged
    /// and recorded in [`VersionedStateStore::restore_log`].
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidSnapshot`] if the blob does not verify.
    pub async fn restore(&self, blob: &SnapshotBlob) -> Result<DocumentState, StateError> {
        let state = blob.decode()?;
        let document_id = state.document_id.clone();

        let existing = match self.documents.entry(document_id.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(Mutex::new(state.clone())));
                self.log_restore(&document_id, None, state.version);
                return Ok(state);
            }
        };

        let mut doc = existing.lock().await;
        let from_version = doc.version;
        *doc = state.clone();
        drop(doc);
        self.log_restore(&document_id, Some(from_version), state.version);
        Ok(state)
    }

    /// Returns every restore performed so far.
    #[must_use]
    pub fn restore_log(&self) -> Vec<RestoreRecord> {
        self.restore_log.lock().clone()
    }

    /// Deletes a document. Returns false if it did not exist.
    pub fn remove_document(&self, document_id: &str) -> bool {
        let removed = self.documents.remove(document_id).is_some();
        if removed {
            debug!(document_id, "Removed document");
        }
        removed
    }

    /// Returns true if the document exists.
    #[must_use]
    pub fn contains(&self, document_id: &str) -> bool {
        self.documents.contains_key(document_id)
    }

    /// Returns all document ids, sorted.
    #[must_use]
    pub fn document_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Returns the number of documents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the store holds no documents.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn cell(&self, document_id: &str) -> Result<Arc<Mutex<DocumentState>>, StateError> {
        self.documents
            .get(document_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| StateError::not_found(document_id))
    }

    fn log_restore(&self, document_id: &str, from_version: Option<u64>, to_version: u64) {
        warn!(
            document_id,
            from_version = ?from_version,
            to_version,
            "Document restored from snapshot; later history discarded"
        );
        self.restore_log.lock().push(RestoreRecord {
            document_id: document_id.to_string(),
            from_version,
            to_version,
            restored_at: now(),
        });
    }
}

impl std::fmt::Debug for VersionedStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionedStateStore")
            .field("documents", &self.len())
            .finish_non_exhaustive()
    }
}

fn apply_content(doc: &mut DocumentState, content: serde_json::Value, actor: &str) -> u64 {
    let summary = match &content {
        serde_json::Value::String(text) => preview(text, SUMMARY_PREVIEW_CHARS),
        other => preview(&other.to_string(), SUMMARY_PREVIEW_CHARS),
    };
    doc.content = content;
    let version = doc.record(actor, ChangeAction::UpdateContent, summary);
    info!(document_id = %doc.document_id, version, actor, "Document updated");
    version
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_create_and_get() {
        let store = VersionedStateStore::new();
        let doc = store.create_document("doc", serde_json::json!("")).await.unwrap();
        assert_eq!(doc.version, 0);

        let err = store.create_document("doc", serde_json::json!("")).await.unwrap_err();
        assert_eq!(err, StateError::already_exists("doc"));

        let err = store.get_document("missing").await.unwrap_err();
        assert_eq!(err, StateError::not_found("missing"));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_history() {
        let store = VersionedStateStore::new();
        store.create_document("doc", serde_json::json!("")).await.unwrap();

        assert_eq!(store.update_content("doc", serde_json::json!("a"), "research").await.unwrap(), 1);
        assert_eq!(store.update_content("doc", serde_json::json!("b"), "writing").await.unwrap(), 2);

        let doc = store.get_document("doc").await.unwrap();
        assert_eq!(doc.version, 2);
        assert_eq!(doc.content, serde_json::json!("b"));
        assert_eq!(doc.history.len(), 2);
        assert_eq!(doc.history[1].actor, "writing");
        assert_eq!(doc.history[1].version, 2);
    }

    #[tokio::test]
    async fn test_summary_is_truncated() {
        let store = VersionedStateStore::new();
        store.create_document("doc", serde_json::json!("")).await.unwrap();
        store
            .update_content("doc", serde_json::json!("x".repeat(500)), "writing")
            .await
            .unwrap();
        let history = store.history("doc").await.unwrap();
        assert_eq!(history[0].summary.chars().count(), SUMMARY_PREVIEW_CHARS + 3);
    }

    #[tokio::test]
    async fn test_metadata_update_is_a_mutation() {
        let store = VersionedStateStore::new();
        store.create_document("doc", serde_json::json!("")).await.unwrap();

        let mut patch = serde_json::Map::new();
        patch.insert("topic".to_string(), serde_json::json!("rust"));
        let version = store.update_metadata("doc", patch, "controller").await.unwrap();

        let doc = store.get_document("doc").await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(doc.metadata["topic"], serde_json::json!("rust"));
        assert_eq!(doc.history[0].action, ChangeAction::UpdateMetadata);
    }

    #[tokio::test]
    async fn test_commit_if_version_conflict() {
        let store = VersionedStateStore::new();
        store.create_document("doc", serde_json::json!("")).await.unwrap();
        store.commit_if_version("doc", 0, serde_json::json!("a"), "w1").await.unwrap();

        let err = store
            .commit_if_version("doc", 0, serde_json::json!("b"), "w2")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StateError::Conflict(StateConflictError { expected: 0, actual: 1, .. })
        ));
        assert_eq!(store.get_document("doc").await.unwrap().version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_have_gap_free_versions() {
        let store = Arc::new(VersionedStateStore::new());
        store.create_document("doc", serde_json::json!(0)).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .update_content("doc", serde_json::json!(n), &format!("writer-{n}"))
                    .await
                    .unwrap()
            }));
        }
        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap());
        }
        versions.sort_unstable();

        assert_eq!(versions, (1..=20).collect::<Vec<u64>>());
        let doc = store.get_document("doc").await.unwrap();
        assert_eq!(doc.version, 20);
        let recorded: Vec<u64> = doc.history.iter().map(|c| c.version).collect();
        assert_eq!(recorded, (1..=20).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_snapshot_restore_round_trip() {
        let store = VersionedStateStore::new();
        store.create_document("doc", serde_json::json!("")).await.unwrap();
        store.update_content("doc", serde_json::json!("one"), "writing").await.unwrap();
        let blob = store.snapshot("doc").await.unwrap();
        let at_snapshot = store.get_document("doc").await.unwrap();

        store.update_content("doc", serde_json::json!("two"), "editing").await.unwrap();
        store.update_content("doc", serde_json::json!("three"), "editing").await.unwrap();

        let restored = store.restore(&blob).await.unwrap();
        assert_eq!(restored, at_snapshot);
        assert_eq!(store.get_document("doc").await.unwrap(), at_snapshot);

        let log = store.restore_log();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].from_version, Some(3));
        assert_eq!(log[0].to_version, 1);

        assert_eq!(store.update_content("doc", serde_json::json!("2b"), "editing").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_restore_recreates_removed_document() {
        let store = VersionedStateStore::new();
        store.create_document("doc", serde_json::json!("x")).await.unwrap();
        let blob = store.snapshot("doc").await.unwrap();

        assert!(store.remove_document("doc"));
        assert!(!store.remove_document("doc"));
        assert!(store.is_empty());

        store.restore(&blob).await.unwrap();
        assert_eq!(store.document_ids(), vec!["doc".to_string()]);
        assert_eq!(store.restore_log()[0].from_version, None);
    }

    #[tokio::test]
    async fn test_snapshot_restore_keeps_numeric_content_exact() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let store = VersionedStateStore::new();
        for i in 0..2_000 {
            let id = format!("doc-{i}");
            let value = if i % 2 == 0 {
                rng.gen_range(0.0..100.0)
            } else {
                let bits: u64 = rng.gen();
                let raw = f64::from_bits(bits);
                if raw.is_finite() { raw } else { f64::MIN_POSITIVE }
            };
            store.create_document(&id, serde_json::json!(0)).await.unwrap();
            store
                .update_content(&id, serde_json::json!({"score": value, "scores": [value, -value]}), "verification")
                .await
                .unwrap();

            let before = store.get_document(&id).await.unwrap();
            let blob = store.snapshot(&id).await.unwrap();
            store.update_content(&id, serde_json::json!("overwritten"), "editing").await.unwrap();

            let restored = store.restore(&blob).await.unwrap();
            assert_eq!(restored, before, "value {value:e}");
            assert_eq!(store.get_document(&id).await.unwrap(), before);
        }
    }
}
