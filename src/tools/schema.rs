//! JSON-schema checks for tool declarations and call arguments, plus the
//! cleanup applied before schemas are declared to the backend.

use serde_json::{Map, Value, json};

use crate::error::{SchemaError, ToolError};

pub(crate) fn validate_schema(schema: &Value) -> Result<(), SchemaError> {
    let schema_obj = schema.as_object().ok_or(SchemaError::SchemaNotObject)?;

    match schema_obj.get("type").and_then(Value::as_str) {
        Some("object") => {}
        _ => return Err(SchemaError::RootTypeMustBeObject),
    }

    if let Some(required) = schema_obj.get("required") {
        let all_strings = required
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !all_strings {
            return Err(SchemaError::InvalidRequired);
        }
    }

    Ok(())
}

/// Checks required fields, unknown fields (when `additionalProperties` is
/// false) and the primitive type of each declared property.
pub(crate) fn validate_arguments(
    tool_name: &str,
    schema: &Value,
    args: &Map<String, Value>,
) -> Result<(), ToolError> {
    let invalid = |message: String| ToolError::InvalidArguments {
        tool: tool_name.to_string(),
        message,
    };

    let Some(schema_obj) = schema.as_object() else {
        return Err(invalid("tool schema must be a JSON object".to_string()));
    };

    let required = schema_obj
        .get("required")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str);
    for field in required {
        if !args.contains_key(field) {
            return Err(invalid(format!("missing required field: {field}")));
        }
    }

    let empty = Map::new();
    let properties = schema_obj
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    let closed = schema_obj
        .get("additionalProperties")
        .and_then(Value::as_bool)
        == Some(false);

    for (key, value) in args {
        let Some(field_schema) = properties.get(key) else {
            if closed {
                return Err(invalid(format!("unknown field: {key}")));
            }
            continue;
        };

        let type_name = field_schema.get("type").and_then(Value::as_str);
        if let Some(type_name) = type_name {
            if !value_matches_type(value, type_name) {
                return Err(invalid(format!("field '{key}' must be of type {type_name}")));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// Rewrites a parameter schema into the subset the backend accepts.
///
/// Local `$defs` references are inlined; `additionalProperties`, `default`,
/// `$schema` and metadata `title` keys are dropped; an object with no
/// properties gets a single placeholder string property.
pub(crate) fn clean_declaration_schema(schema: &Value) -> Value {
    let mut root = schema.clone();
    let defs = match &mut root {
        Value::Object(map) => match map.remove("$defs") {
            Some(Value::Object(defs)) => defs,
            _ => Map::new(),
        },
        _ => Map::new(),
    };

    strip_keys(inline_refs(root, &defs, 0), None)
}

const MAX_REF_DEPTH: usize = 16;

fn inline_refs(value: Value, defs: &Map<String, Value>, depth: usize) -> Value {
    match value {
        Value::Object(mut map) => {
            let target = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|reference| reference.rsplit('/').next())
                .and_then(|name| defs.get(name))
                .cloned();

            if depth < MAX_REF_DEPTH {
                if let Some(Value::Object(mut resolved)) = target {
                    map.remove("$ref");
                    resolved.extend(map);
                    return inline_refs(Value::Object(resolved), defs, depth + 1);
                }
            }

            Value::Object(
                map.into_iter()
                    .map(|(key, value)| (key, inline_refs(value, defs, depth)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| inline_refs(item, defs, depth))
                .collect(),
        ),
        other => other,
    }
}

fn strip_keys(value: Value, parent_key: Option<&str>) -> Value {
    match value {
        Value::Object(map) => {
            let in_properties = parent_key == Some("properties");
            let mut cleaned = Map::new();

            for (key, value) in map {
                let dropped = !in_properties
                    && matches!(
                        key.as_str(),
                        "additionalProperties" | "default" | "$schema" | "title"
                    );
                if dropped {
                    continue;
                }
                let cleaned_value = strip_keys(value, Some(&key));
                cleaned.insert(key, cleaned_value);
            }

            let is_object = cleaned
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t.eq_ignore_ascii_case("object"));
            let has_no_properties = cleaned
                .get("properties")
                .and_then(Value::as_object)
                .is_some_and(Map::is_empty);
            if is_object && has_no_properties {
                cleaned.insert(
                    "properties".to_string(),
                    json!({"_placeholder": {"type": "string"}}),
                );
            }

            Value::Object(cleaned)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| strip_keys(item, parent_key))
                .collect(),
        ),
        other => other,
    }
}
