//! Mapping recipes
//!
//! A recipe is a replayable, value-independent description of how to turn
//! one payload shape into another. Recipes are keyed by the fingerprints of
//! the source shape and the target schema and accumulate success and failure
//! counts across runs so that proven recipes are tried first.

mod cache;

pub use cache::MappingCache;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::schema::{coerce, FieldType};
use crate::tokens::{PathSegment, TokenPath};

/// A single step of a recipe. Steps read from the source payload and write
/// into a fresh output object, except `coerce-type` and `default-value`,
/// which adjust the output in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum RecipeOp {
    /// Copy source field `from` into output field `to`
    Rename { from: String, to: String },
    /// Coerce an output field to a declared type
    CoerceType { field: String, to: FieldType },
    /// Join the string forms of several source fields
    ConcatenateFields {
        fields: Vec<String>,
        into: String,
        #[serde(default = "default_separator")]
        separator: String,
    },
    /// Fill an output field that is missing or null
    DefaultValue { field: String, value: Value },
    /// Copy a nested source value, addressed with `a.b[0].c` syntax
    ExtractNested { path: String, into: String },
}

fn default_separator() -> String {
    " ".to_string()
}

/// Where a recipe was first learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeOrigin {
    Deterministic,
    Suggested,
}

impl RecipeOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "deterministic",
            Self::Suggested => "suggested",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "suggested" => Self::Suggested,
            _ => Self::Deterministic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRecipe {
    /// Stable id derived from the fingerprints and the operations
    pub id: String,
    pub source_fingerprint: String,
    pub target_fingerprint: String,
    pub ops: Vec<RecipeOp>,
    pub success_count: u64,
    pub fail_count: u64,
    pub origin: RecipeOrigin,
}

impl MappingRecipe {
    pub fn new(
        source_fingerprint: &str,
        target_fingerprint: &str,
        ops: Vec<RecipeOp>,
        origin: RecipeOrigin,
    ) -> Self {
        let id = recipe_id(source_fingerprint, target_fingerprint, &ops);
        Self {
            id,
            source_fingerprint: source_fingerprint.to_string(),
            target_fingerprint: target_fingerprint.to_string(),
            ops,
            success_count: 0,
            fail_count: 0,
            origin,
        }
    }

    /// Re-keys a recipe (e.g. one proposed by an oracle) to the given shape
    /// pair, recomputing its id.
    pub fn rekeyed(mut self, source_fingerprint: &str, target_fingerprint: &str) -> Self {
        self.source_fingerprint = source_fingerprint.to_string();
        self.target_fingerprint = target_fingerprint.to_string();
        self.id = recipe_id(source_fingerprint, target_fingerprint, &self.ops);
        self
    }

    /// Applies the recipe to a payload. Missing source fields are skipped;
    /// the caller scores the result.
    pub fn apply(&self, source: &Value) -> Value {
        let mut out = Map::new();
        for op in &self.ops {
            match op {
                RecipeOp::Rename { from, to } => {
                    if let Some(v) = source.get(from) {
                        out.insert(to.clone(), v.clone());
                    }
                }
                RecipeOp::CoerceType { field, to } => {
                    if let Some(v) = out.get(field) {
                        let coerced = coerce(v, *to);
                        out.insert(field.clone(), coerced);
                    }
                }
                RecipeOp::ConcatenateFields {
                    fields,
                    into,
                    separator,
                } => {
                    let parts: Vec<String> = fields
                        .iter()
                        .filter_map(|f| source.get(f))
                        .filter(|v| !v.is_null())
                        .map(|v| match v {
                            Value::String(s) => s.clone(),
                            other => other.to_string(),
                        })
                        .collect();
                    if !parts.is_empty() {
                        out.insert(into.clone(), Value::String(parts.join(separator)));
                    }
                }
                RecipeOp::DefaultValue { field, value } => {
                    let missing = out.get(field).map(Value::is_null).unwrap_or(true);
                    if missing {
                        out.insert(field.clone(), value.clone());
                    }
                }
                RecipeOp::ExtractNested { path, into } => {
                    if let Some(v) = extract(source, path) {
                        out.insert(into.clone(), v.clone());
                    }
                }
            }
        }
        Value::Object(out)
    }

    pub fn attempts(&self) -> u64 {
        self.success_count + self.fail_count
    }
}

fn extract<'a>(source: &'a Value, path: &str) -> Option<&'a Value> {
    // Same grammar as the path part of an `@token`
    let parsed = TokenPath::parse_path(path).ok()?;
    let mut current = source;
    for segment in &parsed {
        current = match segment {
            PathSegment::Field(name) => current.as_object()?.get(name)?,
            PathSegment::Index(i) => current.as_array()?.get(*i)?,
        };
    }
    Some(current)
}

fn recipe_id(source_fingerprint: &str, target_fingerprint: &str, ops: &[RecipeOp]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_fingerprint.as_bytes());
    hasher.update(b"->");
    hasher.update(target_fingerprint.as_bytes());
    for op in ops {
        // Serializing a RecipeOp cannot fail: it only holds strings and JSON values
        hasher.update(serde_json::to_string(op).unwrap_or_default().as_bytes());
    }
    format!("rcp-{:x}", hasher.finalize())[..20].to_string()
}
