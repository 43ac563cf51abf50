//! Input/Output schema access for a model version.
//!
//! A version carries an embedded OpenAPI document. The conventional
//! `components.schemas.Input` and `components.schemas.Output` entries describe
//! what a prediction accepts and returns. Either may be absent.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{ReplicateError, Result};

const REF_PREFIX: &str = "#/components/schemas/";
const MAX_REF_DEPTH: usize = 16;

/// Declared type of a schema node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaType {
    Integer,
    Number,
    Boolean,
    String,
    Array,
    Object,
    /// Anything else the remote schema declares; rejected at coercion time.
    Other(String),
}

impl SchemaType {
    fn from_name(name: &str) -> Self {
        match name {
            "integer" => Self::Integer,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "string" => Self::String,
            "array" => Self::Array,
            "object" => Self::Object,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Integer => "integer",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved schema node (references already followed).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Schema {
    pub kind: Option<SchemaType>,
    pub format: Option<String>,
    /// Item schema; always present when `kind` is `Array`.
    pub items: Option<Box<Schema>>,
    pub properties: BTreeMap<String, Schema>,
    pub required: Vec<String>,
    pub default: Option<Value>,
    /// The `x-order` display annotation.
    pub order: Option<f64>,
    pub title: Option<String>,
    pub description: Option<String>,
    /// `enum` choices.
    pub choices: Vec<Value>,
    /// Remaining `x-*` extensions.
    pub extensions: BTreeMap<String, Value>,
}

impl Schema {
    /// Parse a standalone schema node with no `components` to resolve against.
    pub fn from_value(node: &Value) -> Result<Self> {
        parse_node(node, &Map::new(), "schema", 0)
    }

    /// Look up a declared property.
    pub fn property(&self, name: &str) -> Option<&Schema> {
        self.properties.get(name)
    }

    /// Properties in display order.
    ///
    /// Ascending by `x-order`; unannotated properties sort after all annotated
    /// ones, by name. Display only; coercion never depends on this order.
    pub fn ordered_properties(&self) -> Vec<(&str, &Schema)> {
        let mut props: Vec<(&str, &Schema)> = self
            .properties
            .iter()
            .map(|(name, schema)| (name.as_str(), schema))
            .collect();
        props.sort_by(|(_, a), (_, b)| {
            let a = a.order.unwrap_or(f64::INFINITY);
            let b = b.order.unwrap_or(f64::INFINITY);
            a.total_cmp(&b)
        });
        props
    }

    pub fn is_array(&self) -> bool {
        self.kind == Some(SchemaType::Array)
    }

    fn is_uri_string(&self) -> bool {
        self.kind == Some(SchemaType::String) && self.format.as_deref() == Some("uri")
    }

    /// Whether this output schema describes a token iterator that the service
    /// can stream (cog's concatenated string iterator).
    pub fn is_token_stream(&self) -> bool {
        self.is_array()
            && self
                .items
                .as_deref()
                .is_some_and(|items| items.kind == Some(SchemaType::String))
            && self.extension_str("x-cog-array-type") == Some("iterator")
            && self.extension_str("x-cog-array-display") == Some("concatenate")
    }

    fn extension_str(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).and_then(Value::as_str)
    }

    /// Short type label such as `array<integer>`.
    pub fn type_label(&self) -> String {
        match (&self.kind, &self.items) {
            (Some(SchemaType::Array), Some(items)) => format!("array<{}>", items.type_label()),
            (Some(kind), _) => match &self.format {
                Some(format) => format!("{kind} ({format})"),
                None => kind.to_string(),
            },
            (None, _) => "any".to_string(),
        }
    }
}

/// How a successful job's output should be persisted, decided once from the
/// output schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Array of URI strings: one download per element.
    UriList,
    /// A single URI string.
    Uri,
    /// Anything else: serialised to `output.json`.
    Value,
}

impl OutputShape {
    pub fn of(output: Option<&Schema>) -> Self {
        match output {
            Some(schema) if schema.is_array() => match schema.items.as_deref() {
                Some(items) if items.is_uri_string() => Self::UriList,
                _ => Self::Value,
            },
            Some(schema) if schema.is_uri_string() => Self::Uri,
            _ => Self::Value,
        }
    }
}

/// The Input and Output schemas of one model version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VersionSchemas {
    pub input: Option<Schema>,
    pub output: Option<Schema>,
}

impl VersionSchemas {
    /// Extract `Input` and `Output` from a version's OpenAPI document.
    ///
    /// A missing document, missing components or missing entries yield `None`
    /// for that side. Malformed entries are a [`ReplicateError::Schema`].
    pub fn from_document(document: &Value) -> Result<Self> {
        let Some(components) = document
            .pointer("/components/schemas")
            .and_then(Value::as_object)
        else {
            return Ok(Self::default());
        };

        let input = components
            .get("Input")
            .map(|node| parse_node(node, components, "Input", 0))
            .transpose()?;
        let output = components
            .get("Output")
            .map(|node| parse_node(node, components, "Output", 0))
            .transpose()?;

        Ok(Self { input, output })
    }

    pub fn output_shape(&self) -> OutputShape {
        OutputShape::of(self.output.as_ref())
    }

    pub fn can_stream(&self) -> bool {
        self.output.as_ref().is_some_and(Schema::is_token_stream)
    }
}

fn parse_node(
    node: &Value,
    components: &Map<String, Value>,
    path: &str,
    depth: usize,
) -> Result<Schema> {
    if depth > MAX_REF_DEPTH {
        return Err(ReplicateError::Schema(format!(
            "{path}: reference depth exceeds {MAX_REF_DEPTH}"
        )));
    }

    let obj = node
        .as_object()
        .ok_or_else(|| ReplicateError::Schema(format!("{path}: expected an object")))?;

    // `$ref` and `allOf` wrappers resolve to their target, keeping the
    // wrapper's own annotations on top.
    let mut schema = if let Some(reference) = obj.get("$ref") {
        let target = resolve_ref(reference, components, path)?;
        parse_node(target, components, path, depth + 1)?
    } else if let Some(all_of) = obj.get("allOf") {
        let parts = all_of
            .as_array()
            .ok_or_else(|| ReplicateError::Schema(format!("{path}: allOf must be an array")))?;
        let mut merged = Schema::default();
        for part in parts {
            merge_missing(&mut merged, parse_node(part, components, path, depth + 1)?);
        }
        merged
    } else {
        Schema::default()
    };

    if let Some(kind) = type_name(obj.get("type")) {
        schema.kind = Some(SchemaType::from_name(kind));
    }
    if let Some(format) = obj.get("format").and_then(Value::as_str) {
        schema.format = Some(format.to_string());
    }
    if let Some(items) = obj.get("items") {
        let item_path = format!("{path}[]");
        schema.items = Some(Box::new(parse_node(items, components, &item_path, depth + 1)?));
    }
    if let Some(props) = obj.get("properties").and_then(Value::as_object) {
        for (name, prop) in props {
            let prop_path = format!("{path}.{name}");
            let parsed = parse_node(prop, components, &prop_path, depth + 1)?;
            schema.properties.insert(name.clone(), parsed);
        }
    }
    if let Some(required) = obj.get("required").and_then(Value::as_array) {
        schema.required = required
            .iter()
            .filter_map(|r| r.as_str().map(str::to_string))
            .collect();
    }
    if let Some(default) = obj.get("default") {
        schema.default = Some(default.clone());
    }
    if let Some(order) = obj.get("x-order").and_then(Value::as_f64) {
        schema.order = Some(order);
    }
    if let Some(title) = obj.get("title").and_then(Value::as_str) {
        schema.title = Some(title.to_string());
    }
    if let Some(description) = obj.get("description").and_then(Value::as_str) {
        schema.description = Some(description.to_string());
    }
    if let Some(choices) = obj.get("enum").and_then(Value::as_array) {
        schema.choices = choices.clone();
    }
    for (key, value) in obj {
        if key.starts_with("x-") && key != "x-order" {
            schema.extensions.insert(key.clone(), value.clone());
        }
    }

    if schema.is_array() && schema.items.is_none() {
        return Err(ReplicateError::Schema(format!(
            "{path}: array declares no item schema"
        )));
    }

    Ok(schema)
}

fn resolve_ref<'a>(
    reference: &Value,
    components: &'a Map<String, Value>,
    path: &str,
) -> Result<&'a Value> {
    let reference = reference
        .as_str()
        .ok_or_else(|| ReplicateError::Schema(format!("{path}: $ref must be a string")))?;
    let name = reference.strip_prefix(REF_PREFIX).ok_or_else(|| {
        ReplicateError::Schema(format!("{path}: unsupported reference {reference}"))
    })?;
    components.get(name).ok_or_else(|| {
        ReplicateError::Schema(format!("{path}: unresolved reference {reference}"))
    })
}

/// OpenAPI 3.1 allows `type: ["string", "null"]`; take the first non-null.
fn type_name(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(name) => Some(name),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .find(|name| *name != "null"),
        _ => None,
    }
}

fn merge_missing(into: &mut Schema, from: Schema) {
    into.kind = into.kind.take().or(from.kind);
    into.format = into.format.take().or(from.format);
    into.items = into.items.take().or(from.items);
    into.default = into.default.take().or(from.default);
    into.order = into.order.or(from.order);
    into.title = into.title.take().or(from.title);
    into.description = into.description.take().or(from.description);
    if into.choices.is_empty() {
        into.choices = from.choices;
    }
    for (name, prop) in from.properties {
        into.properties.entry(name).or_insert(prop);
    }
    for (key, value) in from.extensions {
        into.extensions.entry(key).or_insert(value);
    }
    into.required.extend(from.required);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "openapi": "3.0.2",
            "components": {
                "schemas": {
                    "Input": {
                        "type": "object",
                        "title": "Input",
                        "required": ["prompt"],
                        "properties": {
                            "prompt": {"type": "string", "x-order": 0, "description": "Prompt"},
                            "steps": {"type": "integer", "x-order": 2, "default": 50},
                            "seed": {"type": "integer"},
                            "scheduler": {
                                "allOf": [{"$ref": "#/components/schemas/scheduler"}],
                                "default": "DDIM",
                                "x-order": 1
                            }
                        }
                    },
                    "scheduler": {
                        "type": "string",
                        "title": "scheduler",
                        "enum": ["DDIM", "K_EULER"]
                    },
                    "Output": {
                        "type": "array",
                        "items": {"type": "string", "format": "uri"}
                    }
                }
            }
        })
    }

    #[test]
    fn test_extracts_input_and_output() {
        let schemas = VersionSchemas::from_document(&document()).unwrap();
        let input = schemas.input.as_ref().expect("input schema");
        assert_eq!(input.kind, Some(SchemaType::Object));
        assert_eq!(input.properties.len(), 4);
        assert_eq!(input.required, vec!["prompt".to_string()]);
        assert_eq!(schemas.output_shape(), OutputShape::UriList);
    }

    #[test]
    fn test_all_of_reference_keeps_wrapper_annotations() {
        let schemas = VersionSchemas::from_document(&document()).unwrap();
        let input = schemas.input.unwrap();
        let scheduler = input.property("scheduler").unwrap();
        assert_eq!(scheduler.kind, Some(SchemaType::String));
        assert_eq!(scheduler.choices, vec![json!("DDIM"), json!("K_EULER")]);
        assert_eq!(scheduler.default, Some(json!("DDIM")));
        assert_eq!(scheduler.order, Some(1.0));
    }

    #[test]
    fn test_ordered_properties_puts_unannotated_last() {
        let schemas = VersionSchemas::from_document(&document()).unwrap();
        let input = schemas.input.unwrap();
        let names: Vec<&str> = input
            .ordered_properties()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["prompt", "scheduler", "steps", "seed"]);
    }

    #[test]
    fn test_missing_components_is_not_an_error() {
        let schemas = VersionSchemas::from_document(&json!({"openapi": "3.0.2"})).unwrap();
        assert!(schemas.input.is_none());
        assert!(schemas.output.is_none());

        let schemas = VersionSchemas::from_document(&Value::Null).unwrap();
        assert_eq!(schemas, VersionSchemas::default());
    }

    #[test]
    fn test_missing_output_only() {
        let doc = json!({"components": {"schemas": {"Input": {"type": "object"}}}});
        let schemas = VersionSchemas::from_document(&doc).unwrap();
        assert!(schemas.input.is_some());
        assert!(schemas.output.is_none());
        assert_eq!(schemas.output_shape(), OutputShape::Value);
    }

    #[test]
    fn test_array_without_items_is_schema_error() {
        let doc = json!({"components": {"schemas": {
            "Input": {"type": "object", "properties": {"xs": {"type": "array"}}}
        }}});
        let err = VersionSchemas::from_document(&doc).unwrap_err();
        assert!(matches!(err, ReplicateError::Schema(ref msg) if msg.contains("Input.xs")));
    }

    #[test]
    fn test_reference_cycle_is_cut() {
        let doc = json!({"components": {"schemas": {
            "Input": {"$ref": "#/components/schemas/Loop"},
            "Loop": {"$ref": "#/components/schemas/Loop"}
        }}});
        assert!(matches!(
            VersionSchemas::from_document(&doc),
            Err(ReplicateError::Schema(_))
        ));
    }

    #[test]
    fn test_token_stream_detection() {
        let output = Schema::from_value(&json!({
            "type": "array",
            "items": {"type": "string"},
            "x-cog-array-type": "iterator",
            "x-cog-array-display": "concatenate"
        }))
        .unwrap();
        assert!(output.is_token_stream());
        assert_eq!(OutputShape::of(Some(&output)), OutputShape::Value);

        let plain = Schema::from_value(&json!({"type": "array", "items": {"type": "string"}}))
            .unwrap();
        assert!(!plain.is_token_stream());
    }

    #[test]
    fn test_single_uri_output_shape() {
        let output = Schema::from_value(&json!({"type": "string", "format": "uri"})).unwrap();
        assert_eq!(OutputShape::of(Some(&output)), OutputShape::Uri);
        assert_eq!(OutputShape::of(None), OutputShape::Value);
    }

    #[test]
    fn test_nullable_type_list() {
        let schema = Schema::from_value(&json!({"type": ["null", "integer"]})).unwrap();
        assert_eq!(schema.kind, Some(SchemaType::Integer));
        assert_eq!(schema.type_label(), "integer");
    }
}
