//! Quality gate seam.

use crate::state::DocumentState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Scores a document and explains what to improve.
///
/// Scores outside `[0, 1]` are clamped by the engine; errors count as a
/// score of 0.0.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QualityGate: Send + Sync {
    /// Returns a quality score for the document.
    async fn evaluate(&self, document: &DocumentState) -> anyhow::Result<f64>;

    /// Returns structured feedback for the next pass.
    async fn generate_feedback(
        &self,
        document: &DocumentState,
        score: f64,
    ) -> anyhow::Result<serde_json::Value>;
}

/// The normalized outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Score in `[0, 1]`.
    pub score: f64,
    /// Set when the gate errored or returned a non-finite score.
    pub diagnostic: Option<String>,
}

/// Clamps a raw gate score to `[0, 1]`; NaN and infinities become 0.
#[must_use]
pub fn normalize_score(raw: f64) -> f64 {
    if !raw.is_finite() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Evaluates the gate, never failing.
pub async fn evaluate_gate(gate: &dyn QualityGate, document: &DocumentState) -> GateVerdict {
    match gate.evaluate(document).await {
        Ok(raw) if raw.is_finite() => GateVerdict {
            score: normalize_score(raw),
            diagnostic: None,
        },
        Ok(raw) => {
            warn!(document_id = %document.document_id, raw, "Quality gate returned a non-finite score");
            GateVerdict {
                score: 0.0,
                diagnostic: Some(format!("non-finite gate score {raw}")),
            }
        }
        Err(e) => {
            warn!(document_id = %document.document_id, error = %e, "Quality gate failed");
            GateVerdict {
                score: 0.0,
                diagnostic: Some(format!("quality gate error: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::VersionedStateStore;

    async fn document() -> DocumentState {
        let store = VersionedStateStore::new();
        store.create_document("doc", serde_json::json!("text")).await.unwrap()
    }

    #[test]
    fn test_normalize_score() {
        assert_eq!(normalize_score(1.7), 1.0);
        assert_eq!(normalize_score(-0.2), 0.0);
        assert_eq!(normalize_score(0.42), 0.42);
        assert_eq!(normalize_score(f64::NAN), 0.0);
        assert_eq!(normalize_score(f64::INFINITY), 0.0);
        assert_eq!(normalize_score(f64::NEG_INFINITY), 0.0);
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_clamped() {
        let mut gate = MockQualityGate::new();
        gate.expect_evaluate().times(1).returning(|_| Ok(1.5));

        let verdict = evaluate_gate(&gate, &document().await).await;
        assert_eq!(verdict.score, 1.0);
        assert!(verdict.diagnostic.is_none());
    }

    #[tokio::test]
    async fn test_gate_error_scores_zero() {
        let mut gate = MockQualityGate::new();
        gate.expect_evaluate()
            .returning(|_| Err(anyhow::anyhow!("scorer offline")));

        let verdict = evaluate_gate(&gate, &document().await).await;
        assert_eq!(verdict.score, 0.0);
        assert!(verdict.diagnostic.unwrap().contains("scorer offline"));
    }

    #[tokio::test]
    async fn test_nan_score_is_diagnosed() {
        let mut gate = MockQualityGate::new();
        gate.expect_evaluate().returning(|_| Ok(f64::NAN));

        let verdict = evaluate_gate(&gate, &document().await).await;
        assert_eq!(verdict.score, 0.0);
        assert!(verdict.diagnostic.is_some());
    }

    #[tokio::test]
    async fn test_infinite_score_counts_as_zero() {
        let mut gate = MockQualityGate::new();
        gate.expect_evaluate().returning(|_| Ok(f64::INFINITY));

        let verdict = evaluate_gate(&gate, &document().await).await;
        assert_eq!(verdict.score, 0.0);
        assert_eq!(verdict.diagnostic.as_deref(), Some("non-finite gate score inf"));
    }
}
