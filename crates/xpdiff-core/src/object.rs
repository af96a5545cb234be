//! Unstructured object manipulation
//!
//! The universal payload is a `serde_json::Value` tree. Helpers here cover
//! path-addressed access, the override deep merge, and normalization for
//! comparison. Callers own their copies; nothing here mutates shared state.

use serde_json::Value as JsonValue;

/// Fields to strip when normalizing resources for comparison
///
/// These are server-managed and not part of the desired state.
pub const SERVER_MANAGED_FIELDS: &[&[&str]] = &[
    &["metadata", "managedFields"],
    &["metadata", "resourceVersion"],
    &["metadata", "uid"],
    &["metadata", "generation"],
    &["metadata", "creationTimestamp"],
    &["metadata", "selfLink"],
    &["metadata", "ownerReferences"],
];

/// Get a nested value by path
pub fn get_path<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut current = value;
    for key in path {
        current = current.as_object()?.get(*key)?;
    }
    Some(current)
}

/// Get a nested string by path
pub fn get_string<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    get_path(value, path).and_then(|v| v.as_str())
}

/// Set a nested value by path, creating intermediate objects as needed
pub fn set_path(value: &mut JsonValue, path: &[&str], new_value: JsonValue) {
    if path.is_empty() {
        *value = new_value;
        return;
    }

    if !value.is_object() {
        *value = JsonValue::Object(serde_json::Map::new());
    }
    let map = value
        .as_object_mut()
        .expect("value is an object after initialization");

    if path.len() == 1 {
        map.insert(path[0].to_string(), new_value);
    } else {
        let entry = map
            .entry(path[0].to_string())
            .or_insert_with(|| JsonValue::Object(serde_json::Map::new()));
        set_path(entry, &path[1..], new_value);
    }
}

/// Remove a nested value by path
///
/// Missing intermediate keys are a no-op.
pub fn remove_path(value: &mut JsonValue, path: &[&str]) {
    if path.is_empty() {
        return;
    }
    if path.len() == 1 {
        if let Some(map) = value.as_object_mut() {
            map.remove(path[0]);
        }
        return;
    }
    if let Some(map) = value.as_object_mut()
        && let Some(child) = map.get_mut(path[0])
    {
        remove_path(child, &path[1..]);
    }
}

/// Deep merge with override semantics
///
/// Rules:
/// - Objects: recursive key-wise merge
/// - Scalars and sequences: source replaces destination wholesale
/// - `null` in source is an ordinary replacement value; deletion is
///   schema-gated, see `merge_override_with_schema`
pub fn merge_override(dest: &mut JsonValue, src: &JsonValue) {
    merge_override_with_schema(dest, src, None);
}

/// Deep merge with override semantics and schema-gated null deletion
///
/// `schema` is the destination's openAPIV3Schema subtree for the value
/// being merged. A `null` in the source deletes the destination key only
/// when that field's schema marks it nullable; a non-nullable (or
/// unknown) field keeps the literal null as a replacement value.
pub fn merge_override_with_schema(
    dest: &mut JsonValue,
    src: &JsonValue,
    schema: Option<&JsonValue>,
) {
    match (dest, src) {
        (JsonValue::Object(dest_map), JsonValue::Object(src_map)) => {
            for (key, src_value) in src_map {
                let field_schema = property_schema(schema, key);
                if src_value.is_null() {
                    if is_nullable(field_schema) {
                        dest_map.remove(key);
                    } else {
                        dest_map.insert(key.clone(), JsonValue::Null);
                    }
                    continue;
                }
                match dest_map.get_mut(key) {
                    Some(dest_value) => {
                        merge_override_with_schema(dest_value, src_value, field_schema)
                    }
                    None => {
                        dest_map.insert(key.clone(), src_value.clone());
                    }
                }
            }
        }
        (dest, src) => {
            *dest = src.clone();
        }
    }
}

/// The schema of an object property, via properties or additionalProperties
fn property_schema<'a>(schema: Option<&'a JsonValue>, key: &str) -> Option<&'a JsonValue> {
    let schema = schema?;
    schema
        .get("properties")
        .and_then(|p| p.get(key))
        .or_else(|| schema.get("additionalProperties").filter(|a| a.is_object()))
}

fn is_nullable(schema: Option<&JsonValue>) -> bool {
    schema
        .and_then(|s| s.get("nullable"))
        .and_then(|n| n.as_bool())
        .unwrap_or(false)
}

/// Strip server-managed metadata fields in place
pub fn strip_server_managed(value: &mut JsonValue) {
    for path in SERVER_MANAGED_FIELDS {
        remove_path(value, path);
    }
}

/// Normalize a resource for comparison
///
/// Removes server-managed metadata and status, and drops empty metadata
/// maps left behind so that `{}` versus absent compares equal.
pub fn normalize_for_compare(value: &JsonValue) -> JsonValue {
    let mut normalized = value.clone();
    strip_server_managed(&mut normalized);
    remove_path(&mut normalized, &["status"]);

    if let Some(metadata) = normalized
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
    {
        for key in ["labels", "annotations", "ownerReferences", "finalizers"] {
            let empty = metadata
                .get(key)
                .map(|v| {
                    v.as_object().map(|m| m.is_empty()).unwrap_or(false)
                        || v.as_array().map(|a| a.is_empty()).unwrap_or(false)
                })
                .unwrap_or(false);
            if empty {
                metadata.remove(key);
            }
        }
    }

    normalized
}
