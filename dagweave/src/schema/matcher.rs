use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::mapping::{self, AliasTable, DeterministicMapping};
use super::{DataSchema, FieldType};

/// Relative weights of the three compatibility terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    /// Fraction of required fields present
    pub required: f64,
    /// Fraction of present declared fields with an exact runtime type match
    pub type_match: f64,
    /// Full JSON Schema validation passing
    pub validation: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            required: 0.6,
            type_match: 0.2,
            validation: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn total(&self) -> f64 {
        self.required + self.type_match + self.validation
    }
}

/// Result of scoring a payload against a schema.
///
/// `score` may be high while `valid` is false; callers check both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchReport {
    pub score: f64,
    pub valid: bool,
    pub errors: Vec<String>,
    pub missing: Vec<String>,
    pub mismatched: Vec<String>,
}

/// Scores payloads against schemas and proposes deterministic mappings.
#[derive(Debug, Clone, Default)]
pub struct SchemaMatcher {
    weights: ScoreWeights,
    aliases: AliasTable,
}

impl SchemaMatcher {
    pub fn new(weights: ScoreWeights, aliases: AliasTable) -> Self {
        Self { weights, aliases }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Compatibility of `payload` with `schema`, in `[0, 1]`.
    pub fn score(&self, payload: &Value, schema: &DataSchema) -> MatchReport {
        let mut errors = Vec::new();
        let mut missing = Vec::new();
        let mut mismatched = Vec::new();
        let object = payload.as_object();

        // Required fields
        let required = schema.required();
        let mut present = 0usize;
        for field in required {
            if object.map(|o| o.contains_key(field)).unwrap_or(false) {
                present += 1;
            } else {
                missing.push(field.clone());
                errors.push(format!("missing required field '{}'", field));
            }
        }
        let required_fraction = if required.is_empty() {
            1.0
        } else {
            present as f64 / required.len() as f64
        };

        // Declared types of present fields
        let declared = schema.properties();
        let type_fraction = if declared.is_empty() {
            1.0
        } else {
            let mut seen = 0usize;
            let mut exact = 0usize;
            if let Some(object) = object {
                for (name, ty) in declared {
                    let Some(value) = object.get(name) else {
                        continue;
                    };
                    seen += 1;
                    if ty.matches_exactly(value) {
                        exact += 1;
                    } else if !ty.is_compatible(value) {
                        mismatched.push(name.clone());
                        errors.push(format!(
                            "field '{}' expected {}, got {}",
                            name,
                            ty,
                            FieldType::of(value)
                        ));
                    }
                }
            }
            if seen == 0 {
                0.0
            } else {
                exact as f64 / seen as f64
            }
        };

        let validation_errors = validate(payload, schema);
        let passes = validation_errors.is_empty();
        for e in validation_errors {
            if !errors.contains(&e) {
                errors.push(e);
            }
        }

        let w = &self.weights;
        let raw = w.required * required_fraction
            + w.type_match * type_fraction
            + w.validation * if passes { 1.0 } else { 0.0 };
        let score = if w.total() > 0.0 {
            (raw / w.total()).clamp(0.0, 1.0)
        } else {
            0.0
        };

        MatchReport {
            score,
            valid: missing.is_empty() && mismatched.is_empty() && passes,
            errors,
            missing,
            mismatched,
        }
    }

    /// Maps payload fields onto the schema's fields without any learned
    /// component. Returns `None` when a required field has no source.
    pub fn build_deterministic_mapping(
        &self,
        payload: &Value,
        schema: &DataSchema,
    ) -> Option<DeterministicMapping> {
        mapping::build(payload, schema, &self.aliases)
    }
}

/// Full JSON Schema validation; returns one message per violation.
fn validate(payload: &Value, schema: &DataSchema) -> Vec<String> {
    let compiled = match JSONSchema::compile(schema.to_json()) {
        Ok(compiled) => compiled,
        Err(e) => return vec![format!("schema does not compile: {}", e)],
    };
    let result = match compiled.validate(payload) {
        Ok(()) => Vec::new(),
        Err(errors) => errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    format!("validation: {}", e)
                } else {
                    format!("validation at {}: {}", path, e)
                }
            })
            .collect(),
    };
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sentiment_schema() -> DataSchema {
        DataSchema::new().require("text", FieldType::String)
    }

    #[test]
    fn test_perfect_match_scores_one() {
        let report = SchemaMatcher::default().score(&json!({"text": "ok"}), &sentiment_schema());
        assert!((report.score - 1.0).abs() < 1e-9);
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_missing_required_field() {
        let report =
            SchemaMatcher::default().score(&json!({"summary": "ok"}), &sentiment_schema());
        assert!(report.score < 0.85);
        assert!(!report.valid);
        assert_eq!(report.missing, vec!["text".to_string()]);
    }

    #[test]
    fn test_high_score_can_still_be_invalid() {
        let schema = DataSchema::new()
            .require("a", FieldType::String)
            .require("b", FieldType::String)
            .require("c", FieldType::String)
            .require("d", FieldType::String)
            .require("e", FieldType::Integer);
        let payload = json!({"a": "1", "b": "2", "c": "3", "d": "4", "e": "five"});
        let report = SchemaMatcher::default().score(&payload, &schema);
        // 0.6 * 1.0 + 0.2 * 0.8 + 0.2 * 0.0
        assert!((report.score - 0.76).abs() < 1e-9);
        assert!(!report.valid);
        assert_eq!(report.mismatched, vec!["e".to_string()]);
    }

    #[test]
    fn test_integer_is_compatible_but_not_exact_for_number() {
        let schema = DataSchema::new().require("score", FieldType::Number);
        let report = SchemaMatcher::default().score(&json!({"score": 3}), &schema);
        assert!(report.valid);
        assert!((report.score - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_adding_matching_required_fields_never_lowers_score() {
        let schema = DataSchema::new()
            .require("a", FieldType::String)
            .require("b", FieldType::Integer)
            .require("c", FieldType::Boolean)
            .optional("d", FieldType::String);
        let matcher = SchemaMatcher::default();
        let additions = [("a", json!("x")), ("b", json!(2)), ("c", json!(true))];
        // Start from a payload with a mistyped optional field and an unrelated key
        let mut payload = json!({"d": 5, "noise": "n"});
        let mut last = matcher.score(&payload, &schema).score;
        for (key, value) in additions {
            payload[key] = value;
            let next = matcher.score(&payload, &schema).score;
            assert!(next >= last, "score dropped from {} to {}", last, next);
            last = next;
        }
    }

    #[test]
    fn test_non_object_payload() {
        let report = SchemaMatcher::default().score(&json!("just text"), &sentiment_schema());
        assert_eq!(report.score, 0.0);
        assert!(!report.valid);
    }

    #[test]
    fn test_custom_weights_are_normalised() {
        let matcher = SchemaMatcher::new(
            ScoreWeights {
                required: 1.0,
                type_match: 0.0,
                validation: 0.0,
            },
            AliasTable::default(),
        );
        let schema = DataSchema::new()
            .require("a", FieldType::String)
            .require("b", FieldType::String);
        let report = matcher.score(&json!({"a": "x"}), &schema);
        assert!((report.score - 0.5).abs() < 1e-9);
    }
}
