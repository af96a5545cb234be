//! Typed view over composite resource definitions
//!
//! An XRD declares a composite kind (and optionally a claim kind that
//! shadows it), its OpenAPI schema, and default values applied before
//! rendering.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use serde_json::json;

use crate::error::{DiffError, Result};
use crate::gvk::Gvk;

/// Kind naming block of an XRD
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrdNames {
    pub kind: String,
    pub plural: String,
    #[serde(default)]
    pub singular: Option<String>,
}

/// One served version of an XRD
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrdVersion {
    pub name: String,
    #[serde(default)]
    pub served: bool,
    #[serde(default)]
    pub referenceable: bool,
    /// {"openAPIV3Schema": {...}}
    #[serde(default)]
    pub schema: Option<JsonValue>,
}

/// XRD spec fields the diff engine needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XrdSpec {
    pub group: String,
    pub names: XrdNames,
    #[serde(default)]
    pub claim_names: Option<XrdNames>,
    /// v2 XRDs carry an explicit scope; v1 composite kinds are cluster-scoped
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub versions: Vec<XrdVersion>,
}

/// A composite resource definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Xrd {
    pub name: String,
    pub spec: XrdSpec,
}

impl Xrd {
    /// Marshal an Xrd from its unstructured form
    pub fn from_value(obj: &JsonValue) -> Result<Self> {
        let name = crate::resource::name(obj).to_string();
        let spec_value = obj
            .get("spec")
            .ok_or_else(|| DiffError::Internal(format!("XRD {} has no spec", name)))?;
        let spec: XrdSpec = serde_json::from_value(spec_value.clone())
            .map_err(|e| DiffError::Internal(format!("invalid XRD {}: {}", name, e)))?;
        Ok(Self { name, spec })
    }

    /// Check whether this XRD defines the given composite kind
    pub fn defines_xr(&self, gvk: &Gvk) -> bool {
        self.spec.group == gvk.group && self.spec.names.kind == gvk.kind
    }

    /// Check whether this XRD defines the given claim kind
    pub fn defines_claim(&self, gvk: &Gvk) -> bool {
        self.spec.group == gvk.group
            && self
                .spec
                .claim_names
                .as_ref()
                .map(|n| n.kind == gvk.kind)
                .unwrap_or(false)
    }

    /// The name of the CRD generated for the composite kind
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.spec.names.plural, self.spec.group)
    }

    /// The name of the CRD generated for the claim kind, if any
    pub fn claim_crd_name(&self) -> Option<String> {
        self.spec
            .claim_names
            .as_ref()
            .map(|n| format!("{}.{}", n.plural, self.spec.group))
    }

    /// Whether the composite kind is namespaced
    pub fn is_namespaced(&self) -> bool {
        self.spec.scope.as_deref() == Some("Namespaced")
    }

    /// Find the version entry for a version name
    pub fn version(&self, name: &str) -> Option<&XrdVersion> {
        self.spec.versions.iter().find(|v| v.name == name)
    }

    /// The openAPIV3Schema body for a version, if declared
    pub fn schema_for(&self, version: &str) -> Option<&JsonValue> {
        self.version(version)
            .and_then(|v| v.schema.as_ref())
            .and_then(|s| s.get("openAPIV3Schema"))
    }

    /// Synthesize the CRD the cluster would generate for this XRD
    ///
    /// Used to validate composed resources offline when the CRD itself is
    /// not fetchable. `claim` selects the claim kind's CRD.
    pub fn to_crd(&self, claim: bool) -> Option<JsonValue> {
        let names = if claim {
            self.spec.claim_names.as_ref()?
        } else {
            &self.spec.names
        };
        let scope = if claim || self.is_namespaced() {
            "Namespaced"
        } else {
            "Cluster"
        };
        let versions: Vec<JsonValue> = self
            .spec
            .versions
            .iter()
            .map(|v| {
                json!({
                    "name": v.name,
                    "served": v.served,
                    "storage": v.referenceable,
                    "schema": v.schema.clone().unwrap_or_else(|| json!({})),
                })
            })
            .collect();

        Some(json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": format!("{}.{}", names.plural, self.spec.group)},
            "spec": {
                "group": self.spec.group,
                "names": {"kind": names.kind, "plural": names.plural},
                "scope": scope,
                "versions": versions,
            }
        }))
    }
}

/// The openAPIV3Schema a CRD declares for one version
pub fn crd_version_schema<'a>(crd: &'a JsonValue, version: &str) -> Option<&'a JsonValue> {
    crate::object::get_path(crd, &["spec", "versions"])?
        .as_array()?
        .iter()
        .find(|v| v.get("name").and_then(|n| n.as_str()) == Some(version))?
        .get("schema")?
        .get("openAPIV3Schema")
}

/// Apply schema default values into an instance
///
/// Walks an openAPIV3Schema object schema; each property carrying a
/// `default` fills in missing instance keys, and present object values
/// recurse. Instance values always win over defaults.
pub fn apply_schema_defaults(instance: &mut JsonValue, schema: &JsonValue) {
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return;
    };
    if !instance.is_object() {
        return;
    }

    for (key, prop_schema) in properties {
        let missing = instance.get(key).is_none();
        if missing {
            if let Some(default) = prop_schema.get("default") {
                instance
                    .as_object_mut()
                    .expect("instance is an object")
                    .insert(key.clone(), default.clone());
            }
        }
        if let Some(child) = instance.get_mut(key)
            && child.is_object()
        {
            apply_schema_defaults(child, prop_schema);
        }
    }
}
