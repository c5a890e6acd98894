//! Opaque, checksummed document snapshots.

use super::DocumentState;
use crate::errors::StateError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SNAPSHOT_FORMAT: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    format: u32,
    checksum: String,
    payload: String,
}

/// A serialized [`DocumentState`].
///
/// The blob is base64 text wrapping the JSON state and a SHA-256 checksum
/// of it. Treat it as opaque; [`SnapshotBlob::decode`] rejects anything
/// that was altered.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotBlob(String);

impl SnapshotBlob {
    /// Encodes a document state.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be serialized.
    pub fn encode(state: &DocumentState) -> Result<Self, StateError> {
        let payload = serde_json::to_string(state)
            .map_err(|e| StateError::invalid_snapshot(format!("serialize: {e}")))?;
        let envelope = Envelope {
            format: SNAPSHOT_FORMAT,
            checksum: checksum(&payload),
            payload,
        };
        let json = serde_json::to_vec(&envelope)
            .map_err(|e| StateError::invalid_snapshot(format!("serialize: {e}")))?;
        Ok(Self(STANDARD.encode(json)))
    }

    /// Decodes and verifies the blob.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidSnapshot`] for bad base64, bad JSON, an
    /// unknown format, or a checksum mismatch.
    pub fn decode(&self) -> Result<DocumentState, StateError> {
        let bytes = STANDARD
            .decode(self.0.as_bytes())
            .map_err(|e| StateError::invalid_snapshot(format!("base64: {e}")))?;
        let envelope: Envelope = serde_json::from_slice(&bytes)
            .map_err(|e| StateError::invalid_snapshot(format!("envelope: {e}")))?;
        if envelope.format != SNAPSHOT_FORMAT {
            return Err(StateError::invalid_snapshot(format!(
                "unsupported format {}",
                envelope.format
            )));
        }
        if checksum(&envelope.payload) != envelope.checksum {
            return Err(StateError::invalid_snapshot("checksum mismatch"));
        }
        let state: DocumentState = serde_json::from_str(&envelope.payload)
            .map_err(|e| StateError::invalid_snapshot(format!("payload: {e}")))?;
        if state.history.len() as u64 != state.version {
            return Err(StateError::invalid_snapshot(format!(
                "history length {} does not match version {}",
                state.history.len(),
                state.version
            )));
        }
        Ok(state)
    }

    /// Wraps previously exported blob text.
    #[must_use]
    pub fn from_encoded(text: impl Into<String>) -> Self {
        Self(text.into())
    }

    /// Returns the blob text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn checksum(payload: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}
