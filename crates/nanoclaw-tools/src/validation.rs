//! Validate tool call arguments against JSON Schema before execution.

use serde_json::Value;

/// The first schema violation found in a set of arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    /// Offending field, or None when the arguments as a whole are wrong.
    pub field: Option<String>,
    pub reason: String,
}

impl Violation {
    fn field(name: &str, reason: String) -> Self {
        Self {
            field: Some(name.to_string()),
            reason,
        }
    }
}

/// Validate tool arguments against a JSON Schema.
///
/// Covers what tool schemas here actually use: top-level object type,
/// required fields, property types, `enum` values, and the item type of
/// arrays. A `null` on an optional property counts as absent.
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), Violation> {
    if let Some(schema_type) = schema.get("type").and_then(|v| v.as_str()) {
        if schema_type == "object" && !args.is_object() {
            return Err(Violation {
                field: None,
                reason: format!("expected object arguments, got {}", json_type_name(args)),
            });
        }
    }

    let obj = match args.as_object() {
        Some(obj) => obj,
        None => return Ok(()),
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|f| f.as_str()) {
            match obj.get(name) {
                None | Some(Value::Null) => {
                    return Err(Violation::field(
                        name,
                        format!("missing required field '{}'", name),
                    ))
                }
                Some(_) => {}
            }
        }
    }

    let properties = match schema.get("properties").and_then(|v| v.as_object()) {
        Some(p) => p,
        None => return Ok(()),
    };

    for (key, value) in obj {
        if value.is_null() {
            continue;
        }
        let prop_schema = match properties.get(key) {
            Some(s) => s,
            None => continue,
        };

        if let Some(expected) = prop_schema.get("type").and_then(|v| v.as_str()) {
            if !value_matches_type(value, expected) {
                return Err(Violation::field(
                    key,
                    format!(
                        "field '{}' expected type '{}', got {}",
                        key,
                        expected,
                        json_type_name(value)
                    ),
                ));
            }
        }

        if let Some(allowed) = prop_schema.get("enum").and_then(|v| v.as_array()) {
            if !allowed.contains(value) {
                let options: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
                return Err(Violation::field(
                    key,
                    format!(
                        "field '{}' must be one of [{}], got {}",
                        key,
                        options.join(", "),
                        value
                    ),
                ));
            }
        }

        if let (Some(items), Some(item_type)) = (
            value.as_array(),
            prop_schema
                .get("items")
                .and_then(|i| i.get("type"))
                .and_then(|t| t.as_str()),
        ) {
            if let Some(bad) = items.iter().find(|v| !value_matches_type(v, item_type)) {
                return Err(Violation::field(
                    key,
                    format!(
                        "field '{}' expected items of type '{}', got {}",
                        key,
                        item_type,
                        json_type_name(bad)
                    ),
                ));
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
