use serde_json::Value;
use std::collections::BTreeMap;

use super::parser::scan;
use super::{PathSegment, Resolution, TokenPath, UnresolvedToken};

/// Substitutes every `@token` in `template` with values from `outputs`,
/// keyed by alias.
///
/// String leaves get textual substitution: string values are inserted raw,
/// anything else as compact JSON. Object keys and non-string leaves are left
/// untouched. A token that cannot be resolved stays verbatim and is reported.
pub fn resolve(template: &Value, outputs: &BTreeMap<String, Value>) -> Resolution {
    let mut unresolved = Vec::new();
    let value = resolve_value(template, outputs, &mut unresolved);
    Resolution { value, unresolved }
}

fn resolve_value(
    template: &Value,
    outputs: &BTreeMap<String, Value>,
    unresolved: &mut Vec<UnresolvedToken>,
) -> Value {
    match template {
        Value::String(text) => Value::String(resolve_str(text, outputs, unresolved)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, outputs, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn resolve_str(
    text: &str,
    outputs: &BTreeMap<String, Value>,
    unresolved: &mut Vec<UnresolvedToken>,
) -> String {
    let spans = scan(text);
    if spans.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for span in spans {
        out.push_str(&text[cursor..span.start]);
        let raw = &text[span.start..span.end];
        match lookup(&span.path, outputs) {
            Ok(Value::String(s)) => out.push_str(s),
            Ok(other) => out.push_str(&other.to_string()),
            Err(reason) => {
                out.push_str(raw);
                unresolved.push(UnresolvedToken {
                    token: raw.to_string(),
                    reason,
                });
            }
        }
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Walks a token path. The error is a human-readable reason.
pub fn lookup<'a>(path: &TokenPath, outputs: &'a BTreeMap<String, Value>) -> Result<&'a Value, String> {
    let mut current = outputs
        .get(&path.alias)
        .ok_or_else(|| format!("unknown alias '{}'", path.alias))?;
    let mut walked = format!("@{}", path.alias);
    for segment in &path.segments {
        current = match (segment, current) {
            (PathSegment::Field(name), Value::Object(map)) => map
                .get(name)
                .ok_or_else(|| format!("missing key '{}' in {}", name, walked))?,
            (PathSegment::Index(i), Value::Array(items)) => items.get(*i).ok_or_else(|| {
                format!(
                    "index {} out of range in {} (len {})",
                    i,
                    walked,
                    items.len()
                )
            })?,
            (segment, value) => {
                return Err(format!(
                    "cannot apply {} to {} of {} type",
                    segment,
                    walked,
                    json_kind(value)
                ))
            }
        };
        walked.push_str(&segment.to_string());
    }
    Ok(current)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
