//! Small JSON helpers shared across the engine.

use serde_json::{Map, Value};

/// Shallow-merge two JSON objects; keys in `overlay` win. Non-object
/// inputs are treated as empty.
pub fn merge_configs(base: &Value, overlay: &Value) -> Value {
    let mut merged: Map<String, Value> = match base {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(over) = overlay {
        for (key, value) in over {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(merged)
}

/// Read an integer field with a default.
pub fn json_i64(value: &Value, key: &str, default: i64) -> i64 {
    value.get(key).and_then(Value::as_i64).unwrap_or(default)
}

/// Read a string field.
pub fn json_str<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Read a bool field with a default.
pub fn json_bool(value: &Value, key: &str, default: bool) -> bool {
    value.get(key).and_then(Value::as_bool).unwrap_or(default)
}
