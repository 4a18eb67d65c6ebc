//! Merge policies for nodes with several parents
//!
//! Every policy takes the parent outputs in node definition order and
//! produces one payload. Parents are normalized first: `null` counts as an
//! empty object and any other non-object value is wrapped as
//! `{"value": v}`. With no parents the result is `{}`; a single parent is
//! passed through unchanged.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Field read by [`MergePolicy::PreferHighestConfidence`].
pub const CONFIDENCE_FIELD: &str = "_confidence";
/// Confidence assumed for parents without [`CONFIDENCE_FIELD`].
pub const DEFAULT_CONFIDENCE: f64 = 0.5;
/// Output key written by [`MergePolicy::ConcatenateText`].
pub const TEXT_FIELD: &str = "text";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    /// Start from the first parent and fill missing or null keys from the
    /// following ones
    FirstAuthoritativeFillGaps,
    /// Union of keys; first non-null value wins, arrays are concatenated
    #[default]
    #[serde(alias = "merge-by-key-prefer-non-null")]
    MergeByKey,
    /// Sentence-level dedupe of text-like fields into `text`
    ConcatenateText,
    /// Order parents by `_confidence` (descending), then fill gaps
    PreferHighestConfidence,
}

impl MergePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstAuthoritativeFillGaps => "first-authoritative-fill-gaps",
            Self::MergeByKey => "merge-by-key",
            Self::ConcatenateText => "concatenate-text",
            Self::PreferHighestConfidence => "prefer-highest-confidence",
        }
    }

    pub fn merge(&self, parents: &[Value]) -> Value {
        match parents {
            [] => Value::Object(Map::new()),
            [single] => single.clone(),
            _ => {
                let objects: Vec<Map<String, Value>> = parents.iter().map(normalize).collect();
                let merged = match self {
                    Self::FirstAuthoritativeFillGaps => fill_gaps(objects.iter()),
                    Self::MergeByKey => merge_by_key(objects.iter()),
                    Self::ConcatenateText => concatenate_text(&objects),
                    Self::PreferHighestConfidence => {
                        fill_gaps(self.precedence(parents).into_iter().map(|i| &objects[i]))
                    }
                };
                Value::Object(merged)
            }
        }
    }

    /// Parent indices in the order they take precedence for a key: the
    /// merged value of a key comes from the first parent in this order that
    /// holds a non-null value for it. Definition order, except under
    /// [`MergePolicy::PreferHighestConfidence`].
    pub fn precedence(&self, parents: &[Value]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..parents.len()).collect();
        if *self == Self::PreferHighestConfidence {
            let confidence: Vec<f64> = parents.iter().map(confidence_of).collect();
            // sort_by is stable: equal confidence keeps parent order
            order.sort_by(|&a, &b| {
                confidence[b]
                    .partial_cmp(&confidence[a])
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
        }
        order
    }
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "first-authoritative-fill-gaps" => Ok(Self::FirstAuthoritativeFillGaps),
            "merge-by-key" | "merge-by-key-prefer-non-null" => Ok(Self::MergeByKey),
            "concatenate-text" => Ok(Self::ConcatenateText),
            "prefer-highest-confidence" => Ok(Self::PreferHighestConfidence),
            other => Err(format!("unknown merge policy '{}'", other)),
        }
    }
}

/// Object view of a parent payload.
pub fn normalize(value: &Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    }
}

fn fill_gaps<'a>(parents: impl Iterator<Item = &'a Map<String, Value>>) -> Map<String, Value> {
    let mut out = Map::new();
    for parent in parents {
        for (key, value) in parent {
            let gap = out.get(key).map(Value::is_null).unwrap_or(true);
            if gap {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

fn merge_by_key<'a>(parents: impl Iterator<Item = &'a Map<String, Value>>) -> Map<String, Value> {
    let mut out = Map::new();
    for parent in parents {
        for (key, value) in parent {
            match out.get_mut(key) {
                Some(existing) => match (existing, value) {
                    (Value::Array(items), Value::Array(more)) => {
                        items.extend(more.iter().cloned());
                    }
                    (slot, _) if slot.is_null() => *slot = value.clone(),
                    _ => {}
                },
                None => {
                    out.insert(key.clone(), value.clone());
                }
            }
        }
    }
    out
}

fn is_text_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.contains("text") || lower.contains("summary")
}

/// Splits on sentence terminators; pieces are trimmed and empty ones dropped.
fn sentences(text: &str) -> impl Iterator<Item = &str> {
    text.split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn concatenate_text(parents: &[Map<String, Value>]) -> Map<String, Value> {
    let mut collected: Vec<String> = Vec::new();
    let mut rest: Vec<Map<String, Value>> = Vec::with_capacity(parents.len());
    for parent in parents {
        let mut others = Map::new();
        for (key, value) in parent {
            match value {
                Value::String(text) if is_text_key(key) => {
                    for sentence in sentences(text) {
                        if !collected.iter().any(|s| s == sentence) {
                            collected.push(sentence.to_string());
                        }
                    }
                }
                _ => {
                    others.insert(key.clone(), value.clone());
                }
            }
        }
        rest.push(others);
    }

    let mut out = merge_by_key(rest.iter());
    if !collected.is_empty() {
        out.insert(
            TEXT_FIELD.to_string(),
            Value::String(format!("{}.", collected.join(". "))),
        );
    }
    out
}

fn confidence_of(parent: &Value) -> f64 {
    parent
        .get(CONFIDENCE_FIELD)
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_CONFIDENCE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_concatenate_text_dedupes_sentences() {
        let merged = MergePolicy::ConcatenateText.merge(&[
            json!({"summary": "A cat sat."}),
            json!({"text": "A cat sat. It slept."}),
        ]);
        assert_eq!(merged, json!({"text": "A cat sat. It slept."}));
    }

    #[test]
    fn test_concatenate_text_keeps_other_keys() {
        let merged = MergePolicy::ConcatenateText.merge(&[
            json!({"summary_text": "One", "lang": null, "tags": ["a"]}),
            json!({"lang": "en", "tags": ["b"], "text_len": 3}),
        ]);
        assert_eq!(
            merged,
            json!({"text": "One.", "lang": "en", "tags": ["a", "b"], "text_len": 3})
        );
    }

    #[test]
    fn test_merge_by_key_prefers_non_null_and_concatenates_arrays() {
        let merged = MergePolicy::MergeByKey.merge(&[
            json!({"a": null, "b": 1, "items": [1]}),
            json!({"a": "x", "b": 2, "items": [2, 3]}),
        ]);
        assert_eq!(merged, json!({"a": "x", "b": 1, "items": [1, 2, 3]}));
    }

    #[test]
    fn test_fill_gaps_keeps_first_parent_authoritative() {
        let merged = MergePolicy::FirstAuthoritativeFillGaps.merge(&[
            json!({"a": 1, "items": [1], "c": null}),
            json!({"a": 2, "items": [2], "c": 3, "d": 4}),
        ]);
        assert_eq!(merged, json!({"a": 1, "items": [1], "c": 3, "d": 4}));
    }

    #[test]
    fn test_prefer_highest_confidence() {
        let merged = MergePolicy::PreferHighestConfidence.merge(&[
            json!({"label": "low", "_confidence": 0.2}),
            json!({"label": "default", "extra": true}),
            json!({"label": "high", "_confidence": 0.9}),
        ]);
        assert_eq!(
            merged,
            json!({"label": "high", "_confidence": 0.9, "extra": true})
        );
    }

    #[test]
    fn test_precedence_follows_policy() {
        let parents = [
            json!({"label": "low", "_confidence": 0.2}),
            json!("bare"),
            json!({"label": "high", "_confidence": 0.9}),
        ];
        assert_eq!(MergePolicy::PreferHighestConfidence.precedence(&parents), vec![2, 1, 0]);
        for policy in [
            MergePolicy::FirstAuthoritativeFillGaps,
            MergePolicy::MergeByKey,
            MergePolicy::ConcatenateText,
        ] {
            assert_eq!(policy.precedence(&parents), vec![0, 1, 2], "{}", policy);
        }
    }

    #[test]
    fn test_parent_normalization() {
        assert_eq!(MergePolicy::MergeByKey.merge(&[]), json!({}));
        assert_eq!(MergePolicy::MergeByKey.merge(&[json!("solo")]), json!("solo"));
        assert_eq!(
            MergePolicy::MergeByKey.merge(&[json!(null), json!(7)]),
            json!({"value": 7})
        );
    }

    #[test]
    fn test_policy_names() {
        let parsed: MergePolicy = serde_json::from_value(json!("merge-by-key-prefer-non-null")).unwrap();
        assert_eq!(parsed, MergePolicy::MergeByKey);
        assert_eq!(
            "concatenate-text".parse::<MergePolicy>().unwrap(),
            MergePolicy::ConcatenateText
        );
        assert_eq!(
            serde_json::to_value(MergePolicy::PreferHighestConfidence).unwrap(),
            json!("prefer-highest-confidence")
        );
        assert!("newest-wins".parse::<MergePolicy>().is_err());
    }
}
