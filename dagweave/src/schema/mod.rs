//! Schema compatibility
//!
//! Nodes declare the shape they expect as a small JSON-Schema-like document:
//! a list of required fields plus a primitive type per property. This module
//! provides:
//! - [`DataSchema`]: parsed form of that document (round-trips to JSON Schema)
//! - [`SchemaMatcher`]: weighted compatibility scoring and deterministic
//!   field mapping through alias tables and fuzzy key matching
//! - [`fingerprint`]: value-independent shape hashes used as cache keys

pub mod fingerprint;
mod mapping;
mod matcher;

pub use fingerprint::{schema_fingerprint, shape_fingerprint};
pub use mapping::{coerce, AliasTable, DeterministicMapping, FieldBinding, MatchStrategy};
pub use matcher::{MatchReport, SchemaMatcher, ScoreWeights};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Schema must be a JSON object, got {0}")]
    NotAnObject(String),
    #[error("Unknown type '{ty}' for property '{property}'")]
    UnknownType { property: String, ty: String },
    #[error("Invalid schema: {0}")]
    Invalid(String),
}

/// Primitive type vocabulary used for declared and inferred field types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
    Null,
    /// Declared without a type; accepts anything
    Any,
}

impl FieldType {
    /// Runtime type of a JSON value. Whole numbers infer as `Integer`.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => Self::String,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    Self::Integer
                } else {
                    Self::Number
                }
            }
            Value::Bool(_) => Self::Boolean,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
            Value::Null => Self::Null,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" => Some(Self::String),
            "number" => Some(Self::Number),
            "integer" => Some(Self::Integer),
            "boolean" => Some(Self::Boolean),
            "array" => Some(Self::Array),
            "object" => Some(Self::Object),
            "null" => Some(Self::Null),
            "any" => Some(Self::Any),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Null => "null",
            Self::Any => "any",
        }
    }

    /// Exact runtime type match (used for the type-match score term).
    pub fn matches_exactly(&self, value: &Value) -> bool {
        *self == Self::Any || Self::of(value) == *self
    }

    /// Compatible for coercion purposes: an integer is an acceptable number.
    pub fn is_compatible(&self, value: &Value) -> bool {
        self.matches_exactly(value)
            || (*self == Self::Number && Self::of(value) == Self::Integer)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Expected input or output shape of a node.
///
/// Serializes to (and parses from) a JSON Schema object document. The raw
/// document is kept so that full validation sees every constraint the author
/// wrote, not only the subset modelled here.
#[derive(Debug, Clone, PartialEq)]
pub struct DataSchema {
    required: Vec<String>,
    properties: BTreeMap<String, FieldType>,
    raw: Value,
}

impl DataSchema {
    /// Empty object schema.
    pub fn new() -> Self {
        Self::build(Vec::new(), BTreeMap::new())
    }

    /// Adds a required field with a declared type.
    pub fn require(mut self, field: &str, ty: FieldType) -> Self {
        self.properties.insert(field.to_string(), ty);
        if !self.required.iter().any(|r| r == field) {
            self.required.push(field.to_string());
        }
        Self::build(self.required, self.properties)
    }

    /// Adds an optional, typed property.
    pub fn optional(mut self, field: &str, ty: FieldType) -> Self {
        self.properties.insert(field.to_string(), ty);
        Self::build(self.required, self.properties)
    }

    fn build(required: Vec<String>, properties: BTreeMap<String, FieldType>) -> Self {
        let props: Map<String, Value> = properties
            .iter()
            .map(|(name, ty)| {
                let decl = match ty {
                    FieldType::Any => json!({}),
                    other => json!({ "type": other.as_str() }),
                };
                (name.clone(), decl)
            })
            .collect();
        let raw = json!({
            "type": "object",
            "required": required.clone(),
            "properties": props,
        });
        Self {
            required,
            properties,
            raw,
        }
    }

    /// Parses a JSON Schema object document.
    pub fn from_json(value: &Value) -> Result<Self, SchemaError> {
        let obj = value
            .as_object()
            .ok_or_else(|| SchemaError::NotAnObject(FieldType::of(value).to_string()))?;

        let mut properties = BTreeMap::new();
        if let Some(props) = obj.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| SchemaError::Invalid("'properties' must be an object".into()))?;
            for (name, decl) in props {
                properties.insert(name.clone(), declared_type(name, decl)?);
            }
        }

        let mut required = Vec::new();
        if let Some(req) = obj.get("required") {
            let req = req
                .as_array()
                .ok_or_else(|| SchemaError::Invalid("'required' must be an array".into()))?;
            for field in req {
                let field = field.as_str().ok_or_else(|| {
                    SchemaError::Invalid("'required' entries must be strings".into())
                })?;
                if !required.iter().any(|r: &String| r == field) {
                    required.push(field.to_string());
                }
            }
        }

        let mut raw = value.clone();
        if let Some(raw_obj) = raw.as_object_mut() {
            raw_obj
                .entry("type")
                .or_insert_with(|| Value::String("object".into()));
        }

        Ok(Self {
            required,
            properties,
            raw,
        })
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn properties(&self) -> &BTreeMap<String, FieldType> {
        &self.properties
    }

    /// Declared type of a field; undeclared required fields accept anything.
    pub fn field_type(&self, field: &str) -> FieldType {
        self.properties.get(field).copied().unwrap_or(FieldType::Any)
    }

    /// JSON Schema document used for full validation.
    pub fn to_json(&self) -> &Value {
        &self.raw
    }

    /// Required fields first (declaration order), then the remaining
    /// declared properties (sorted).
    pub fn fields(&self) -> Vec<(String, FieldType, bool)> {
        let mut out: Vec<(String, FieldType, bool)> = self
            .required
            .iter()
            .map(|f| (f.clone(), self.field_type(f), true))
            .collect();
        for (name, ty) in &self.properties {
            if !self.required.contains(name) {
                out.push((name.clone(), *ty, false));
            }
        }
        out
    }
}

impl Default for DataSchema {
    fn default() -> Self {
        Self::new()
    }
}

fn declared_type(property: &str, decl: &Value) -> Result<FieldType, SchemaError> {
    let ty = match decl.get("type") {
        None => return Ok(FieldType::Any),
        Some(ty) => ty,
    };
    let name = match ty {
        Value::String(s) => s.as_str(),
        // ["string", "null"] style unions: first non-null member decides
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .find(|s| *s != "null")
            .unwrap_or("null"),
        other => {
            return Err(SchemaError::Invalid(format!(
                "type of '{}' must be a string, got {}",
                property, other
            )))
        }
    };
    FieldType::parse(name).ok_or_else(|| SchemaError::UnknownType {
        property: property.to_string(),
        ty: name.to_string(),
    })
}

impl Serialize for DataSchema {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for DataSchema {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        DataSchema::from_json(&value).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_inference() {
        assert_eq!(FieldType::of(&json!(3)), FieldType::Integer);
        assert_eq!(FieldType::of(&json!(3.5)), FieldType::Number);
        assert_eq!(FieldType::of(&json!("x")), FieldType::String);
        assert!(FieldType::Number.is_compatible(&json!(3)));
        assert!(!FieldType::Number.matches_exactly(&json!(3)));
        assert!(!FieldType::Integer.is_compatible(&json!(3.5)));
    }

    #[test]
    fn test_parse_json_schema() {
        let schema = DataSchema::from_json(&json!({
            "type": "object",
            "required": ["text"],
            "properties": {
                "text": { "type": "string" },
                "lang": { "type": ["string", "null"] },
                "extra": {}
            }
        }))
        .unwrap();
        assert_eq!(schema.required().to_vec(), vec!["text".to_string()]);
        assert_eq!(schema.field_type("lang"), FieldType::String);
        assert_eq!(schema.field_type("extra"), FieldType::Any);
        assert_eq!(schema.fields().len(), 3);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = DataSchema::from_json(&json!({
            "properties": { "when": { "type": "date" } }
        }))
        .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownType { .. }));
    }

    #[test]
    fn test_builder_round_trips_through_serde() {
        let schema = DataSchema::new()
            .require("text", FieldType::String)
            .optional("score", FieldType::Number);
        let encoded = serde_json::to_value(&schema).unwrap();
        assert_eq!(encoded["properties"]["score"]["type"], "number");
        let decoded: DataSchema = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded.required(), schema.required());
        assert_eq!(decoded.properties(), schema.properties());
    }
}
