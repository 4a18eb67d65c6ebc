//! Shape fingerprints
//!
//! A fingerprint hashes the sorted set of `(key, type)` pairs of a shape.
//! Values never contribute, so `{"summary": "a"}` and `{"summary": "b"}`
//! share a fingerprint while `{"summary": 1}` does not.
//!
//! Payload keys are always present and hash like required schema fields.
//! Optional schema fields hash with a `?` marker.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

use super::{DataSchema, FieldType};

const FINGERPRINT_LEN: usize = 16;

/// `(key, type, optional)`
type FieldKey = (String, FieldType, bool);

fn digest(fields: &BTreeSet<FieldKey>) -> String {
    let mut hasher = Sha256::new();
    for (key, ty, optional) in fields {
        hasher.update(key.as_bytes());
        if *optional {
            hasher.update(b"?");
        }
        hasher.update(b":");
        hasher.update(ty.as_str().as_bytes());
        hasher.update(b"\n");
    }
    let hex = format!("{:x}", hasher.finalize());
    hex[..FINGERPRINT_LEN].to_string()
}

/// Fingerprint of a runtime payload, using inferred top-level types.
///
/// Non-object payloads hash as a single `$` entry of their own type.
pub fn shape_fingerprint(payload: &Value) -> String {
    let fields: BTreeSet<FieldKey> = match payload {
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), FieldType::of(v), false))
            .collect(),
        other => std::iter::once(("$".to_string(), FieldType::of(other), false)).collect(),
    };
    digest(&fields)
}

/// Fingerprint of a declared schema. Required fields without a declared
/// property hash as `any`.
pub fn schema_fingerprint(schema: &DataSchema) -> String {
    let fields: BTreeSet<FieldKey> = schema
        .fields()
        .into_iter()
        .map(|(name, ty, required)| (name, ty, !required))
        .collect();
    digest(&fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_values_do_not_affect_fingerprint() {
        assert_eq!(
            shape_fingerprint(&json!({"summary": "a", "n": 1})),
            shape_fingerprint(&json!({"n": 99, "summary": "completely different"}))
        );
    }

    #[test]
    fn test_types_affect_fingerprint() {
        assert_ne!(
            shape_fingerprint(&json!({"summary": "a"})),
            shape_fingerprint(&json!({"summary": 1}))
        );
        assert_eq!(shape_fingerprint(&json!({})).len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_payload_and_schema_agree_on_matching_shapes() {
        let schema = DataSchema::new().require("text", FieldType::String);
        assert_eq!(
            schema_fingerprint(&schema),
            shape_fingerprint(&json!({"text": "hello"}))
        );
    }

    #[test]
    fn test_required_flag_affects_schema_fingerprint() {
        let required = DataSchema::new().require("text", FieldType::String);
        let optional = DataSchema::new().optional("text", FieldType::String);
        assert_ne!(schema_fingerprint(&required), schema_fingerprint(&optional));
    }
}
