//! Secret masking for channel configs returned through the API.
//!
//! Keys containing any of the sensitive markers are replaced with the
//! first four characters plus `"****"`; short values collapse to
//! `"****"`. Masking recurses through nested maps and lists with a
//! depth cap.

use serde_json::Value;

const SENSITIVE_MARKERS: [&str; 7] = [
    "token",
    "secret",
    "password",
    "api_key",
    "access_token",
    "key",
    "credential",
];

const MAX_DEPTH: usize = 5;

/// Mask sensitive fields of an opaque channel config.
pub fn mask_sensitive_config(config: &Value) -> Value {
    mask_at_depth(config, 0)
}

fn mask_at_depth(value: &Value, depth: usize) -> Value {
    if depth > MAX_DEPTH {
        return value.clone();
    }
    let Value::Object(map) = value else {
        return value.clone();
    };

    let mut masked = serde_json::Map::new();
    for (key, entry) in map {
        let lowered = key.to_ascii_lowercase();
        let is_sensitive = SENSITIVE_MARKERS.iter().any(|m| lowered.contains(m));
        let replacement = match entry {
            Value::Object(_) => mask_at_depth(entry, depth + 1),
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Object(_) => mask_at_depth(item, depth + 1),
                        other => other.clone(),
                    })
                    .collect(),
            ),
            Value::String(s) if is_sensitive => Value::String(mask_string(s)),
            _ if is_sensitive => Value::String("****".to_string()),
            other => other.clone(),
        };
        masked.insert(key.clone(), replacement);
    }
    Value::Object(masked)
}

fn mask_string(value: &str) -> String {
    if value.chars().count() > 4 {
        let prefix: String = value.chars().take(4).collect();
        format!("{prefix}****")
    } else {
        "****".to_string()
    }
}
