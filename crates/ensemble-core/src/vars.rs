//! `{{var}}` template expansion and nested-attribute merging.
//!
//! Substitution touches string leaves only; unknown placeholders are left
//! intact so a half-populated context never corrupts a payload.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde_json::Value;

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.-]+)\s*\}\}").expect("invalid placeholder regex"));

/// Substitution context handed to operations: node name, pattern, event
/// id/name and any filter-matched service/tag values.
pub type Vars = HashMap<String, String>;

/// Expand `{{name}}` markers in a single string.
pub fn subst(input: &str, vars: &Vars) -> String {
    PLACEHOLDER
        .replace_all(input, |caps: &Captures| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

/// Expand every element of a string array.
pub fn subst_array(items: &[String], vars: &Vars) -> Vec<String> {
    items.iter().map(|item| subst(item, vars)).collect()
}

/// Expand string leaves of a nested mapping, recursing into maps and arrays.
pub fn subst_map(map: &serde_json::Map<String, Value>, vars: &Vars) -> serde_json::Map<String, Value> {
    map.iter()
        .map(|(key, value)| (key.clone(), subst_value(value, vars)))
        .collect()
}

fn subst_value(value: &Value, vars: &Vars) -> Value {
    match value {
        Value::String(text) => Value::String(subst(text, vars)),
        Value::Array(items) => Value::Array(items.iter().map(|item| subst_value(item, vars)).collect()),
        Value::Object(map) => Value::Object(subst_map(map, vars)),
        other => other.clone(),
    }
}

/// Merge `overlay` into `base`.
///
/// Maps merge key-wise recursively; any non-map right side overwrites the
/// left, and arrays overwrite arrays (no concatenation).
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, overlay) => *slot = overlay,
    }
}

/// Follow `path` through nested objects, creating empty maps along the way.
pub fn ensure_path<'doc>(doc: &'doc mut Value, path: &[&str]) -> &'doc mut Value {
    let mut cursor = doc;
    for segment in path {
        if !cursor.is_object() {
            *cursor = Value::Object(serde_json::Map::new());
        }
        cursor = cursor
            .as_object_mut()
            .expect("cursor was just coerced to an object")
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
    }
    cursor
}
