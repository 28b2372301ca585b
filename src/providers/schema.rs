//! Tool schema compatibility filtering.
//!
//! Capability servers publish full JSON Schema documents; the backends accept
//! only a subset of keywords. Anything outside the supported set is stripped
//! recursively, including inside nested object/array schemas and composition
//! branches, before a tool is declared to a backend.

use serde_json::{Map, Value};

/// Keywords whose values pass through unchanged.
const VERBATIM_KEYWORDS: &[&str] = &[
    "type",
    "description",
    "required",
    "enum",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minLength",
    "maxLength",
    "pattern",
    "minItems",
    "maxItems",
    "uniqueItems",
    "default",
];

/// Composition keywords whose branches are filtered recursively.
const COMPOSITION_KEYWORDS: &[&str] = &["anyOf", "oneOf", "allOf"];

/// Filters a tool input schema down to the supported keyword subset.
///
/// additionalProperties-style flags, meta-schema markers (`$schema`, `$id`,
/// `$defs`), and `format` hints are dropped at every nesting level.
/// Non-object schemas (e.g. boolean schemas) are returned unchanged.
pub fn filter_tool_schema(schema: &Value) -> Value {
    let Some(object) = schema.as_object() else {
        return schema.clone();
    };

    let mut filtered = Map::new();
    for (key, value) in object {
        match key.as_str() {
            key_name if VERBATIM_KEYWORDS.contains(&key_name) => {
                filtered.insert(key.clone(), value.clone());
            }
            "properties" => {
                let properties = value
                    .as_object()
                    .map(|map| {
                        map.iter()
                            .map(|(name, prop)| (name.clone(), filter_tool_schema(prop)))
                            .collect::<Map<_, _>>()
                    })
                    .unwrap_or_default();
                filtered.insert(key.clone(), Value::Object(properties));
            }
            "items" => {
                filtered.insert(key.clone(), filter_schema_or_list(value));
            }
            "not" => {
                filtered.insert(key.clone(), filter_tool_schema(value));
            }
            key_name if COMPOSITION_KEYWORDS.contains(&key_name) => {
                filtered.insert(key.clone(), filter_schema_or_list(value));
            }
            _ => {}
        }
    }
    Value::Object(filtered)
}

fn filter_schema_or_list(value: &Value) -> Value {
    match value {
        Value::Array(branches) => {
            Value::Array(branches.iter().map(filter_tool_schema).collect())
        }
        other => filter_tool_schema(other),
    }
}
