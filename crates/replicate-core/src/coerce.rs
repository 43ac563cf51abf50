//! Type coercion of raw CLI strings into the JSON request payload.
//!
//! With an input schema every key must be a declared property and its value
//! must convert to the declared type. Without one (trainings, or a version
//! that could not be resolved) values are inferred: JSON first, literal
//! string otherwise.

use serde_json::{Map, Number, Value};

use crate::error::{ReplicateError, Result};
use crate::input::RawInput;
use crate::schema::{Schema, SchemaType};

/// The typed request payload, keyed by input name.
pub type CoercedInput = Map<String, Value>;

/// Why a single value failed to coerce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoerceFailure {
    /// The user's value does not fit the declared type.
    Invalid(String),
    /// The schema itself is unusable.
    Schema(String),
}

/// Coerce every raw input, against `schema` when one is available.
pub fn coerce_inputs(inputs: &RawInput, schema: Option<&Schema>) -> Result<CoercedInput> {
    let mut coerced = CoercedInput::new();

    for (key, value) in inputs {
        let typed = match schema {
            Some(schema) => {
                let prop = schema
                    .property(key)
                    .ok_or_else(|| ReplicateError::UnknownProperty(key.clone()))?;
                coerce_value(value, prop).map_err(|failure| match failure {
                    CoerceFailure::Invalid(reason) => ReplicateError::TypeCoercion {
                        key: key.clone(),
                        value: value.clone(),
                        kind: prop.type_label(),
                        reason,
                    },
                    CoerceFailure::Schema(reason) => {
                        ReplicateError::Schema(format!("property {key}: {reason}"))
                    }
                })?
            }
            None => infer_value(value),
        };
        coerced.insert(key.clone(), typed);
    }

    Ok(coerced)
}

/// Convert one string to the type `schema` declares.
pub fn coerce_value(value: &str, schema: &Schema) -> std::result::Result<Value, CoerceFailure> {
    let kind = schema
        .kind
        .as_ref()
        .ok_or_else(|| CoerceFailure::Schema("no type declared".to_string()))?;

    match kind {
        SchemaType::Integer => parse_integer(value).map(Value::from),
        SchemaType::Number => parse_number(value).map(Value::Number),
        SchemaType::Boolean => parse_boolean(value).map(Value::Bool),
        SchemaType::String => Ok(Value::String(value.to_string())),
        SchemaType::Array => {
            let items = schema
                .items
                .as_deref()
                .ok_or_else(|| CoerceFailure::Schema("array declares no item schema".to_string()))?;
            coerce_array(value, items)
        }
        other => Err(CoerceFailure::Schema(format!("unsupported type {other}"))),
    }
}

/// Heuristic conversion used when no schema is available. Never fails.
///
/// Numbers always come back as floats, matching how the value would be read
/// by a JSON decoder without type hints.
pub fn infer_value(value: &str) -> Value {
    match serde_json::from_str::<Value>(value) {
        Ok(parsed) => floats_only(parsed),
        Err(_) => Value::String(value.to_string()),
    }
}

fn parse_integer(value: &str) -> std::result::Result<i64, CoerceFailure> {
    let digits = value.strip_prefix('-').unwrap_or(value);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoerceFailure::Invalid("not a base-10 integer".to_string()));
    }
    value
        .parse::<i64>()
        .map_err(|e| CoerceFailure::Invalid(e.to_string()))
}

fn parse_number(value: &str) -> std::result::Result<Number, CoerceFailure> {
    let parsed = value
        .parse::<f64>()
        .map_err(|e| CoerceFailure::Invalid(e.to_string()))?;
    Number::from_f64(parsed)
        .ok_or_else(|| CoerceFailure::Invalid("not a finite number".to_string()))
}

fn parse_boolean(value: &str) -> std::result::Result<bool, CoerceFailure> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(CoerceFailure::Invalid(
            "expected true, false, 1 or 0".to_string(),
        )),
    }
}

fn coerce_array(value: &str, items: &Schema) -> std::result::Result<Value, CoerceFailure> {
    let elements: Vec<Value> = serde_json::from_str(value)
        .map_err(|e| CoerceFailure::Invalid(format!("not a JSON array: {e}")))?;

    elements
        .iter()
        .enumerate()
        .map(|(i, element)| {
            coerce_element(element, items).map_err(|failure| match failure {
                CoerceFailure::Invalid(reason) => {
                    CoerceFailure::Invalid(format!("item {i} ({element}): {reason}"))
                }
                schema_failure => schema_failure,
            })
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(Value::Array)
}

/// Coerce one already-parsed array element against the item schema.
///
/// String items must be JSON strings. Scalar items reject `null`, objects and
/// nested arrays; nested arrays are accepted only for array items.
fn coerce_element(element: &Value, items: &Schema) -> std::result::Result<Value, CoerceFailure> {
    match (items.kind.as_ref(), element) {
        (Some(SchemaType::String), Value::String(s)) => Ok(Value::String(s.clone())),
        (Some(SchemaType::String), other) => Err(CoerceFailure::Invalid(format!(
            "expected a string, got {}",
            json_kind(other)
        ))),
        (Some(SchemaType::Array), Value::Array(_)) => coerce_value(&element.to_string(), items),
        (
            Some(SchemaType::Integer | SchemaType::Number | SchemaType::Boolean | SchemaType::Array),
            Value::Null | Value::Object(_) | Value::Array(_),
        ) => Err(CoerceFailure::Invalid(format!(
            "expected {}, got {}",
            items.type_label(),
            json_kind(element)
        ))),
        (_, Value::String(s)) => coerce_value(s, items),
        (_, other) => coerce_value(&other.to_string(), items),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn floats_only(value: Value) -> Value {
    match value {
        Value::Number(n) => n
            .as_f64()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Number(n)),
        Value::Array(items) => Value::Array(items.into_iter().map(floats_only).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, floats_only(v)))
                .collect(),
        ),
        other => other,
    }
}
