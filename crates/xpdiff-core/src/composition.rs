//! Typed view over Composition objects
//!
//! Focused on the fields the diff engine needs: the composite type the
//! template binds to and the function pipeline. Everything else stays in
//! unstructured form.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DiffError, Result};

/// Reference to a composite type by apiVersion and kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeRef {
    pub api_version: String,
    pub kind: String,
}

/// Reference to a composition function by name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRef {
    pub name: String,
}

/// One named step of a composition pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStep {
    pub step: String,
    pub function_ref: FunctionRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<JsonValue>,
}

/// Composition spec fields relevant to rendering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSpec {
    pub composite_type_ref: TypeRef,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub pipeline: Vec<PipelineStep>,
}

/// A composition template, immutable during one diff run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Composition {
    pub name: String,
    pub spec: CompositionSpec,
    /// The full unstructured object, kept for self-diffing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<JsonValue>,
}

impl Composition {
    /// Marshal a Composition from its unstructured form
    pub fn from_value(obj: &JsonValue) -> Result<Self> {
        let kind = crate::resource::kind(obj);
        if kind != "Composition" {
            return Err(DiffError::Internal(format!(
                "expected a Composition, got {}",
                kind
            )));
        }

        let name = crate::resource::name(obj).to_string();
        let spec_value = obj
            .get("spec")
            .ok_or_else(|| DiffError::Internal(format!("Composition {} has no spec", name)))?;
        let spec: CompositionSpec = serde_json::from_value(spec_value.clone())
            .map_err(|e| DiffError::Internal(format!("invalid Composition {}: {}", name, e)))?;

        Ok(Self {
            name,
            spec,
            raw: Some(obj.clone()),
        })
    }

    /// Check whether this composition templates the given composite type
    pub fn matches_type(&self, api_version: &str, kind: &str) -> bool {
        self.spec.composite_type_ref.api_version == api_version
            && self.spec.composite_type_ref.kind == kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn composition_value() -> JsonValue {
        json!({
            "apiVersion": "apiextensions.crossplane.io/v1",
            "kind": "Composition",
            "metadata": {"name": "xbuckets.example.org"},
            "spec": {
                "compositeTypeRef": {"apiVersion": "example.org/v1", "kind": "XBucket"},
                "mode": "Pipeline",
                "pipeline": [
                    {
                        "step": "compose",
                        "functionRef": {"name": "function-patch-and-transform"},
                        "input": {"apiVersion": "pt.fn.crossplane.io/v1beta1", "kind": "Resources"}
                    }
                ]
            }
        })
    }

    #[test]
    fn test_from_value() {
        let comp = Composition::from_value(&composition_value()).unwrap();
        assert_eq!(comp.name, "xbuckets.example.org");
        assert_eq!(comp.spec.pipeline.len(), 1);
        assert_eq!(
            comp.spec.pipeline[0].function_ref.name,
            "function-patch-and-transform"
        );
        assert!(comp.matches_type("example.org/v1", "XBucket"));
        assert!(!comp.matches_type("example.org/v1", "XCluster"));
    }

    #[test]
    fn test_from_value_wrong_kind() {
        let obj = json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "x"}});
        assert!(Composition::from_value(&obj).is_err());
    }

    #[test]
    fn test_from_value_missing_spec() {
        let obj = json!({
            "apiVersion": "apiextensions.crossplane.io/v1",
            "kind": "Composition",
            "metadata": {"name": "x"}
        });
        assert!(Composition::from_value(&obj).is_err());
    }
}
