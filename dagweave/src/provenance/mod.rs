//! Field-level provenance for the final run output.
//!
//! Each top-level field of the merged output is attributed to the terminal
//! node that produced it, together with the transform method that fed that
//! node and a confidence derived from the compatibility score.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::{NodeId, TransformMethod};

/// Trust factor applied to synthesized payloads unless configured otherwise.
pub const DEFAULT_SYNTHESIS_TRUST: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub origin: NodeId,
    pub method: TransformMethod,
    pub confidence: f64,
}

/// What a terminal node contributed to the final merge.
#[derive(Debug, Clone, Copy)]
pub struct Contribution<'a> {
    pub node_id: &'a str,
    pub output: &'a Value,
    pub method: &'a TransformMethod,
    /// Compatibility score of the payload the node was called with
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ProvenanceTracker {
    synthesis_trust: f64,
    records: BTreeMap<String, ProvenanceRecord>,
}

impl Default for ProvenanceTracker {
    fn default() -> Self {
        Self::new(DEFAULT_SYNTHESIS_TRUST)
    }
}

impl ProvenanceTracker {
    pub fn new(synthesis_trust: f64) -> Self {
        Self {
            synthesis_trust,
            records: BTreeMap::new(),
        }
    }

    /// direct: 1.0; deterministic and cached: score; suggested: oracle
    /// confidence x score; synthesized: score x trust. Clamped to [0, 1].
    pub fn confidence(&self, method: &TransformMethod, score: f64) -> f64 {
        let raw = match method {
            TransformMethod::Direct => 1.0,
            TransformMethod::Deterministic | TransformMethod::CachedRecipe { .. } => score,
            TransformMethod::Suggested { confidence, .. } => confidence * score,
            TransformMethod::Synthesized => score * self.synthesis_trust,
        };
        raw.clamp(0.0, 1.0)
    }

    pub fn record_field(
        &mut self,
        field: impl Into<String>,
        origin: impl Into<NodeId>,
        method: TransformMethod,
        confidence: f64,
    ) {
        self.records.insert(
            field.into(),
            ProvenanceRecord {
                origin: origin.into(),
                method,
                confidence: confidence.clamp(0.0, 1.0),
            },
        );
    }

    /// Attributes every top-level field of `output` to the first contributor
    /// holding a non-null value for it. `contributions` must be in the
    /// precedence order of the merge that built `output`. Fields built by the merge itself
    /// (e.g. joined `text`) fall back to the first contributor that has the
    /// key at all, then to the first contributor. A non-object output is
    /// recorded under `value`.
    pub fn attribute(&mut self, output: &Value, contributions: &[Contribution<'_>]) {
        let Some(first) = contributions.first() else {
            return;
        };
        let fields: Vec<&str> = match output {
            Value::Object(map) => map.keys().map(String::as_str).collect(),
            _ => vec!["value"],
        };
        for field in fields {
            let holder = contributions
                .iter()
                .find(|c| c.output.get(field).map(|v| !v.is_null()).unwrap_or(false))
                .or_else(|| contributions.iter().find(|c| c.output.get(field).is_some()))
                .unwrap_or(first);
            let confidence = self.confidence(holder.method, holder.score);
            self.record_field(field, holder.node_id, holder.method.clone(), confidence);
        }
    }

    pub fn get(&self, field: &str) -> Option<&ProvenanceRecord> {
        self.records.get(field)
    }

    pub fn records(&self) -> &BTreeMap<String, ProvenanceRecord> {
        &self.records
    }

    pub fn into_records(self) -> BTreeMap<String, ProvenanceRecord> {
        self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_confidence_by_method() {
        let tracker = ProvenanceTracker::default();
        assert_eq!(tracker.confidence(&TransformMethod::Direct, 0.3), 1.0);
        assert_eq!(tracker.confidence(&TransformMethod::Deterministic, 0.9), 0.9);
        let suggested = TransformMethod::Suggested {
            recipe_id: "r".into(),
            confidence: 0.5,
        };
        assert!((tracker.confidence(&suggested, 0.9) - 0.45).abs() < 1e-9);
        assert!((tracker.confidence(&TransformMethod::Synthesized, 1.0) - 0.8).abs() < 1e-9);
        let overconfident = TransformMethod::Suggested {
            recipe_id: "r".into(),
            confidence: 3.0,
        };
        assert_eq!(tracker.confidence(&overconfident, 1.0), 1.0);
    }

    #[test]
    fn test_attribute_prefers_first_non_null_holder() {
        let a = json!({"label": null, "score": 1});
        let b = json!({"label": "pos", "extra": 2});
        let mut tracker = ProvenanceTracker::default();
        tracker.attribute(
            &json!({"label": "pos", "score": 1, "extra": 2}),
            &[
                Contribution {
                    node_id: "A",
                    output: &a,
                    method: &TransformMethod::Direct,
                    score: 1.0,
                },
                Contribution {
                    node_id: "B",
                    output: &b,
                    method: &TransformMethod::Deterministic,
                    score: 0.9,
                },
            ],
        );
        assert_eq!(tracker.get("label").unwrap().origin, "B");
        assert_eq!(tracker.get("label").unwrap().confidence, 0.9);
        assert_eq!(tracker.get("score").unwrap().origin, "A");
        assert_eq!(tracker.records().len(), 3);
    }
}
