//! Canonical JSON form.
//!
//! Documents are hashed and compared in a canonical rendering: every string
//! leaf has its whitespace runs collapsed, tokens carry no separators, key
//! order is preserved from the parsed form, and non-ASCII text is emitted as
//! raw UTF-8. Text that does not parse as JSON is passed through unchanged so
//! that already-canonical engine output tolerates a second pass.

use serde_json::Value;

/// Collapse whitespace runs to a single space and trim the ends.
pub fn normalize_spaces(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for part in input.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(part);
    }
    out
}

/// Canonicalize a JSON text. Unparseable input is returned unchanged.
pub fn canonicalize(json_content: &str) -> String {
    match serde_json::from_str::<Value>(json_content) {
        Ok(mut value) => {
            clean_value(&mut value);
            // Compact serialization of a just-parsed value cannot fail.
            serde_json::to_string(&value).unwrap_or_else(|_| json_content.to_string())
        }
        Err(_) => json_content.to_string(),
    }
}

/// Recursively normalize string leaves in place. Numbers, booleans and nulls
/// are untouched.
pub fn clean_value(value: &mut Value) {
    match value {
        Value::String(s) => *s = normalize_spaces(s),
        Value::Array(items) => {
            for item in items {
                clean_value(item);
            }
        }
        Value::Object(map) => {
            for (_, v) in map.iter_mut() {
                clean_value(v);
            }
        }
        _ => {}
    }
}
