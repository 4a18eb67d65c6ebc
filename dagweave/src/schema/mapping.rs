use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use super::{DataSchema, FieldType};
use crate::recipes::{MappingRecipe, RecipeOp, RecipeOrigin};

/// Target field -> source keys that may stand in for it, in preference order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AliasTable(BTreeMap<String, Vec<String>>);

impl Default for AliasTable {
    fn default() -> Self {
        let entries: &[(&str, &[&str])] = &[
            ("text", &["summary", "content", "body", "message"]),
            ("summary", &["text", "abstract", "content", "body"]),
            ("content", &["text", "body", "message"]),
            ("message", &["text", "content", "body"]),
            ("query", &["question", "prompt", "q", "search"]),
            ("question", &["query", "prompt"]),
            ("url", &["link", "href", "uri"]),
            ("label", &["category", "class", "sentiment"]),
            ("score", &["confidence", "probability"]),
            ("items", &["results", "entries", "list"]),
            ("results", &["items", "entries"]),
            ("language", &["lang", "locale"]),
        ];
        Self(
            entries
                .iter()
                .map(|(target, sources)| {
                    (
                        target.to_string(),
                        sources.iter().map(|s| s.to_string()).collect(),
                    )
                })
                .collect(),
        )
    }
}

impl AliasTable {
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Appends aliases for a target field, keeping existing ones first.
    pub fn extend_target(&mut self, target: &str, sources: &[String]) {
        let entry = self.0.entry(target.to_string()).or_default();
        for source in sources {
            if !entry.contains(source) {
                entry.push(source.clone());
            }
        }
    }

    pub fn with_extra(mut self, extra: &BTreeMap<String, Vec<String>>) -> Self {
        for (target, sources) in extra {
            self.extend_target(target, sources);
        }
        self
    }

    pub fn sources_for(&self, target: &str) -> &[String] {
        self.0.get(target).map(|v| v.as_slice()).unwrap_or(&[])
    }
}

/// How a target field found its source key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    Exact,
    Alias,
    CaseInsensitive,
    Substring,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBinding {
    pub target: String,
    pub source: String,
    pub strategy: MatchStrategy,
    pub target_type: FieldType,
    /// The source value had a different runtime type and was coerced
    pub coerced: bool,
}

/// Output of the deterministic mapper: the mapped payload plus the bindings
/// that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicMapping {
    pub payload: Value,
    pub bindings: Vec<FieldBinding>,
}

impl DeterministicMapping {
    /// Expresses the mapping as a reusable recipe.
    pub fn to_recipe(&self, source_fingerprint: &str, target_fingerprint: &str) -> MappingRecipe {
        let mut ops = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            ops.push(RecipeOp::Rename {
                from: binding.source.clone(),
                to: binding.target.clone(),
            });
            if binding.coerced {
                ops.push(RecipeOp::CoerceType {
                    field: binding.target.clone(),
                    to: binding.target_type,
                });
            }
        }
        MappingRecipe::new(
            source_fingerprint,
            target_fingerprint,
            ops,
            RecipeOrigin::Deterministic,
        )
    }
}

fn find_source(
    object: &Map<String, Value>,
    target: &str,
    aliases: &AliasTable,
) -> Option<(String, MatchStrategy)> {
    if object.contains_key(target) {
        return Some((target.to_string(), MatchStrategy::Exact));
    }
    for alias in aliases.sources_for(target) {
        if object.contains_key(alias) {
            return Some((alias.clone(), MatchStrategy::Alias));
        }
    }
    let lowered = target.to_lowercase();
    // serde_json maps iterate in sorted key order
    if let Some(key) = object.keys().find(|k| k.to_lowercase() == lowered) {
        return Some((key.clone(), MatchStrategy::CaseInsensitive));
    }
    if lowered.is_empty() {
        return None;
    }
    object
        .keys()
        .find(|k| {
            let k = k.to_lowercase();
            !k.is_empty() && (k.contains(&lowered) || lowered.contains(&k))
        })
        .map(|k| (k.clone(), MatchStrategy::Substring))
}

pub(super) fn build(
    payload: &Value,
    schema: &DataSchema,
    aliases: &AliasTable,
) -> Option<DeterministicMapping> {
    let empty = Map::new();
    let object = payload.as_object().unwrap_or(&empty);

    let mut out = Map::new();
    let mut bindings = Vec::new();
    for (target, ty, required) in schema.fields() {
        match find_source(object, &target, aliases) {
            Some((source, strategy)) => {
                let value = object.get(&source).cloned().unwrap_or(Value::Null);
                let coerced = !ty.matches_exactly(&value);
                let mapped = if coerced { coerce(&value, ty) } else { value };
                out.insert(target.clone(), mapped);
                bindings.push(FieldBinding {
                    target,
                    source,
                    strategy,
                    target_type: ty,
                    coerced,
                });
            }
            None if required => return None,
            None => {}
        }
    }

    Some(DeterministicMapping {
        payload: Value::Object(out),
        bindings,
    })
}

/// Converts a value to `to`; a value that cannot be converted becomes null.
///
/// Supported conversions: string <-> number/integer <-> boolean, any scalar
/// into a single-element array, single-element arrays unwrapped.
pub fn coerce(value: &Value, to: FieldType) -> Value {
    if to.matches_exactly(value) {
        return value.clone();
    }
    // Single-element arrays unwrap before any scalar conversion
    if let Value::Array(items) = value {
        if items.len() == 1 && to != FieldType::Array {
            return coerce(&items[0], to);
        }
    }
    match to {
        FieldType::String => match value {
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
            _ => Value::Null,
        },
        FieldType::Number => match value {
            Value::Number(n) => n
                .as_f64()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .ok()
                .and_then(Number::from_f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Value::Bool(b) => Value::from(if *b { 1.0 } else { 0.0 }),
            _ => Value::Null,
        },
        FieldType::Integer => {
            let as_float = match value {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            };
            match as_float {
                Some(f) if f.fract() == 0.0 && f.is_finite() => Value::from(f as i64),
                _ => Value::Null,
            }
        }
        FieldType::Boolean => match value {
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "yes" | "y" | "1" => Value::Bool(true),
                "false" | "no" | "n" | "0" => Value::Bool(false),
                _ => Value::Null,
            },
            Value::Number(n) => n
                .as_f64()
                .map(|f| Value::Bool(f != 0.0))
                .unwrap_or(Value::Null),
            _ => Value::Null,
        },
        FieldType::Array => match value {
            Value::Null => Value::Null,
            other => Value::Array(vec![other.clone()]),
        },
        FieldType::Object => match value {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(parsed @ Value::Object(_)) => parsed,
                _ => Value::Null,
            },
            _ => Value::Null,
        },
        FieldType::Null => Value::Null,
        FieldType::Any => value.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(payload: Value, schema: &DataSchema) -> Option<DeterministicMapping> {
        build(&payload, schema, &AliasTable::default())
    }

    #[test]
    fn test_alias_summary_maps_to_text() {
        let schema = DataSchema::new().require("text", FieldType::String);
        let mapping = map(json!({"summary": "ok"}), &schema).unwrap();
        assert_eq!(mapping.payload, json!({"text": "ok"}));
        assert_eq!(mapping.bindings[0].strategy, MatchStrategy::Alias);
        assert!(!mapping.bindings[0].coerced);
    }

    #[test]
    fn test_match_order_prefers_exact_then_alias() {
        let schema = DataSchema::new().require("text", FieldType::String);
        let mapping = map(json!({"summary": "s", "text": "t"}), &schema).unwrap();
        assert_eq!(mapping.payload["text"], "t");
        assert_eq!(mapping.bindings[0].strategy, MatchStrategy::Exact);
    }

    #[test]
    fn test_case_insensitive_and_substring() {
        let schema = DataSchema::new()
            .require("title", FieldType::String)
            .require("count", FieldType::Integer);
        let mapping = map(json!({"Title": "T", "item_count": "7"}), &schema).unwrap();
        assert_eq!(mapping.payload, json!({"title": "T", "count": 7}));
        assert_eq!(mapping.bindings[0].strategy, MatchStrategy::CaseInsensitive);
        assert_eq!(mapping.bindings[1].strategy, MatchStrategy::Substring);
        assert!(mapping.bindings[1].coerced);
    }

    #[test]
    fn test_unfilled_required_field_returns_none() {
        let schema = DataSchema::new()
            .require("text", FieldType::String)
            .require("language", FieldType::String);
        assert!(map(json!({"summary": "ok"}), &schema).is_none());
    }

    #[test]
    fn test_optional_fields_are_best_effort() {
        let schema = DataSchema::new()
            .require("text", FieldType::String)
            .optional("language", FieldType::String);
        let mapping = map(json!({"body": "b"}), &schema).unwrap();
        assert_eq!(mapping.payload, json!({"text": "b"}));
    }

    #[test]
    fn test_failed_coercion_is_null() {
        let schema = DataSchema::new().require("count", FieldType::Integer);
        let mapping = map(json!({"count": "many"}), &schema).unwrap();
        assert_eq!(mapping.payload, json!({"count": null}));
    }

    #[test]
    fn test_coercions() {
        assert_eq!(coerce(&json!(42), FieldType::String), json!("42"));
        assert_eq!(coerce(&json!("3.5"), FieldType::Number), json!(3.5));
        assert_eq!(coerce(&json!("yes"), FieldType::Boolean), json!(true));
        assert_eq!(coerce(&json!(0), FieldType::Boolean), json!(false));
        assert_eq!(coerce(&json!("x"), FieldType::Array), json!(["x"]));
        assert_eq!(coerce(&json!(["only"]), FieldType::String), json!("only"));
        assert_eq!(coerce(&json!(2.5), FieldType::Integer), Value::Null);
        assert_eq!(coerce(&json!(true), FieldType::Integer), json!(1));
    }

    #[test]
    fn test_mapping_to_recipe() {
        let schema = DataSchema::new().require("count", FieldType::Integer);
        let mapping = map(json!({"total_count": "3"}), &schema).unwrap();
        let recipe = mapping.to_recipe("src", "dst");
        assert_eq!(recipe.ops.len(), 2);
        assert_eq!(recipe.apply(&json!({"total_count": "9"})), json!({"count": 9}));
    }

    #[test]
    fn test_extra_aliases_are_appended() {
        let mut extra = BTreeMap::new();
        extra.insert("text".to_string(), vec!["transcript".to_string()]);
        let aliases = AliasTable::default().with_extra(&extra);
        let schema = DataSchema::new().require("text", FieldType::String);
        let mapping = build(&json!({"transcript": "hi"}), &schema, &aliases).unwrap();
        assert_eq!(mapping.payload, json!({"text": "hi"}));
        assert_eq!(aliases.sources_for("text")[0], "summary");
    }
}
