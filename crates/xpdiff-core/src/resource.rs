//! Metadata accessors for unstructured resources

use serde_json::Value as JsonValue;
use serde_json::json;

use crate::gvk::Gvk;
use crate::object::{get_path, get_string, set_path};

/// Read the apiVersion field
pub fn api_version(obj: &JsonValue) -> &str {
    get_string(obj, &["apiVersion"]).unwrap_or_default()
}

/// Read the kind field
pub fn kind(obj: &JsonValue) -> &str {
    get_string(obj, &["kind"]).unwrap_or_default()
}

/// Parse the object's Gvk from apiVersion and kind
pub fn gvk(obj: &JsonValue) -> Gvk {
    Gvk::from_api_version(api_version(obj), kind(obj))
}

/// Read metadata.name
pub fn name(obj: &JsonValue) -> &str {
    get_string(obj, &["metadata", "name"]).unwrap_or_default()
}

/// Read metadata.generateName
pub fn generate_name(obj: &JsonValue) -> &str {
    get_string(obj, &["metadata", "generateName"]).unwrap_or_default()
}

/// Read metadata.namespace
pub fn namespace(obj: &JsonValue) -> &str {
    get_string(obj, &["metadata", "namespace"]).unwrap_or_default()
}

/// Read metadata.uid
pub fn uid(obj: &JsonValue) -> &str {
    get_string(obj, &["metadata", "uid"]).unwrap_or_default()
}

/// Read metadata.resourceVersion
pub fn resource_version(obj: &JsonValue) -> &str {
    get_string(obj, &["metadata", "resourceVersion"]).unwrap_or_default()
}

/// Set metadata.name
pub fn set_name(obj: &mut JsonValue, value: &str) {
    set_path(obj, &["metadata", "name"], json!(value));
}

/// Set metadata.generateName
pub fn set_generate_name(obj: &mut JsonValue, value: &str) {
    set_path(obj, &["metadata", "generateName"], json!(value));
}

/// Set metadata.namespace
pub fn set_namespace(obj: &mut JsonValue, value: &str) {
    set_path(obj, &["metadata", "namespace"], json!(value));
}

/// Read a label value
pub fn label<'a>(obj: &'a JsonValue, key: &str) -> Option<&'a str> {
    get_path(obj, &["metadata", "labels"])?
        .as_object()?
        .get(key)?
        .as_str()
}

/// Set a label value
pub fn set_label(obj: &mut JsonValue, key: &str, value: &str) {
    set_path(obj, &["metadata", "labels", key], json!(value));
}

/// Read an annotation value
pub fn annotation<'a>(obj: &'a JsonValue, key: &str) -> Option<&'a str> {
    get_path(obj, &["metadata", "annotations"])?
        .as_object()?
        .get(key)?
        .as_str()
}

/// Set an annotation value
pub fn set_annotation(obj: &mut JsonValue, key: &str, value: &str) {
    set_path(obj, &["metadata", "annotations", key], json!(value));
}

/// The effective name for diff identity
///
/// A resource with only a generateName has no cluster name yet; its diff
/// identity is "<generateName>(generated)".
pub fn effective_name(obj: &JsonValue) -> String {
    let n = name(obj);
    if !n.is_empty() {
        return n.to_string();
    }
    let gn = generate_name(obj);
    if gn.is_empty() {
        String::new()
    } else {
        format!("{}(generated)", gn)
    }
}

/// Canonical diff key: "<apiVersion>/<kind>/<name>"
pub fn diff_key(obj: &JsonValue) -> String {
    diff_key_for(api_version(obj), kind(obj), &effective_name(obj))
}

/// Build a diff key from parts
pub fn diff_key_for(api_version: &str, kind: &str, name: &str) -> String {
    format!("{}/{}/{}", api_version, kind, name)
}

/// Human-readable id for logs: "Kind/name" or "Kind/generateName*"
pub fn display_id(obj: &JsonValue) -> String {
    let n = name(obj);
    if !n.is_empty() {
        return format!("{}/{}", kind(obj), n);
    }
    let gn = generate_name(obj);
    if gn.is_empty() {
        format!("{}/<unnamed>", kind(obj))
    } else {
        format!("{}/{}*", kind(obj), gn)
    }
}

/// Ensure the desired object's controller owner reference points at owner
///
/// Any existing controller reference is replaced; non-controller
/// references are preserved.
pub fn set_controller_owner(desired: &mut JsonValue, owner: &JsonValue) {
    let owner_ref = json!({
        "apiVersion": api_version(owner),
        "kind": kind(owner),
        "name": name(owner),
        "uid": uid(owner),
        "controller": true,
        "blockOwnerDeletion": true,
    });

    let mut refs: Vec<JsonValue> = get_path(desired, &["metadata", "ownerReferences"])
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    refs.retain(|r| {
        !r.get("controller")
            .and_then(|c| c.as_bool())
            .unwrap_or(false)
    });
    refs.push(owner_ref);

    set_path(desired, &["metadata", "ownerReferences"], json!(refs));
}
