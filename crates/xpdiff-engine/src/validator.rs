//! Schema and scope validation of desired resources

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use xpdiff_core::{DiffError, Result, crd_version_schema, resource};
use xpdiff_kube::{Clients, ResourceClient, SchemaClient};

/// Validates desired resources against CRD schemas and scope rules
pub struct SchemaValidator {
    schema: Arc<dyn SchemaClient>,
    resource: Arc<dyn ResourceClient>,
}

impl SchemaValidator {
    pub fn new(clients: &Clients) -> Self {
        Self {
            schema: clients.schema.clone(),
            resource: clients.resource.clone(),
        }
    }

    /// Fail unless every CRD-backed kind in the set has a loadable CRD
    ///
    /// Built-in core types are exempt.
    pub async fn ensure_composed_resource_crds(&self, resources: &[JsonValue]) -> Result<()> {
        let mut gvks = BTreeSet::new();
        for obj in resources {
            gvks.insert(resource::gvk(obj));
        }

        let mut missing = Vec::new();
        for gvk in gvks {
            if !self.schema.is_crd_required(&gvk).await? {
                continue;
            }
            match self.schema.crd_for(&gvk).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => missing.push(gvk.to_string()),
                Err(e) => return Err(e),
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(DiffError::Schema(format!(
                "no CRD found for: {}",
                missing.join(", ")
            )))
        }
    }

    /// Validate the XR and its composed resources
    ///
    /// Runs CRD-schema validation against every resource, then scope
    /// checks: a namespaced kind stays in the root XR's namespace, a
    /// cluster-scoped kind carries no namespace (Claims are allowed to
    /// produce cluster-scoped managed resources).
    pub async fn validate_resources(
        &self,
        xr: &JsonValue,
        composed: &[JsonValue],
        root_is_claim: bool,
    ) -> Result<()> {
        let root_namespace = resource::namespace(xr);
        let mut errors = Vec::new();

        for obj in std::iter::once(xr).chain(composed.iter()) {
            if let Some(e) = self.validate_schema(obj).await? {
                errors.push(e);
            }
        }

        for obj in composed {
            let gvk = resource::gvk(obj);
            let namespaced = self.resource.is_namespaced(&gvk).await?;
            let namespace = resource::namespace(obj);
            let id = resource::display_id(obj);

            if namespaced {
                if namespace.is_empty() {
                    errors.push(DiffError::Schema(format!(
                        "{} is namespaced but has no namespace",
                        id
                    )));
                } else if !root_namespace.is_empty() && namespace != root_namespace {
                    errors.push(DiffError::Schema(format!(
                        "{} crosses namespaces: {} != {}",
                        id, namespace, root_namespace
                    )));
                }
            } else if !namespace.is_empty() && !root_is_claim {
                errors.push(DiffError::Schema(format!(
                    "{} is cluster-scoped but has namespace {}",
                    id, namespace
                )));
            }
        }

        match DiffError::aggregate(errors) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Validate one resource against its CRD's version schema, if any
    async fn validate_schema(&self, obj: &JsonValue) -> Result<Option<DiffError>> {
        let gvk = resource::gvk(obj);
        if !self.schema.is_crd_required(&gvk).await? {
            return Ok(None);
        }
        let crd = match self.schema.crd_for(&gvk).await {
            Ok(crd) => crd,
            // Presence is enforced separately; absence here is not a
            // validation failure.
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        let Some(schema) = crd_version_schema(&crd, &gvk.version) else {
            debug!(%gvk, "CRD declares no schema for this version");
            return Ok(None);
        };

        let validator = jsonschema::validator_for(schema)
            .map_err(|e| DiffError::Schema(format!("invalid schema for {}: {}", gvk, e)))?;
        let messages: Vec<String> = validator
            .iter_errors(obj)
            .map(|e| {
                let path = e.instance_path.to_string();
                let at = if path.is_empty() { "(root)".to_string() } else { path };
                format!("{}: {}", at, e)
            })
            .collect();

        if messages.is_empty() {
            Ok(None)
        } else {
            Ok(Some(DiffError::Schema(format!(
                "{} failed validation: {}",
                resource::display_id(obj),
                messages.join("; ")
            ))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use xpdiff_kube::MockClients;

    use serde_json::json;

    fn bucket_crd() -> JsonValue {
        json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": {"name": "buckets.s3.example.org"},
            "spec": {
                "group": "s3.example.org",
                "names": {"kind": "Bucket", "plural": "buckets"},
                "scope": "Cluster",
                "versions": [{
                    "name": "v1",
                    "served": true,
                    "storage": true,
                    "schema": {"openAPIV3Schema": {
                        "type": "object",
                        "properties": {
                            "spec": {
                                "type": "object",
                                "properties": {"size": {"type": "string"}},
                                "required": ["size"]
                            }
                        },
                        "required": ["spec"]
                    }}
                }]
            }
        })
    }

    fn xr() -> JsonValue {
        json!({
            "apiVersion": "example.org/v1",
            "kind": "XBucket",
            "metadata": {"name": "parent-xr"}
        })
    }

    fn valid_bucket() -> JsonValue {
        json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "b-1"},
            "spec": {"size": "small"}
        })
    }

    #[tokio::test]
    async fn test_ensure_crds_missing_fails() {
        let mock = MockClients::new();
        let validator = SchemaValidator::new(&mock.clients());
        let err = validator
            .ensure_composed_resource_crds(&[valid_bucket()])
            .await
            .unwrap_err();
        assert!(err.is_schema());
        assert!(err.to_string().contains("s3.example.org"));
    }

    #[tokio::test]
    async fn test_ensure_crds_builtin_exempt() {
        let mock = MockClients::new();
        let validator = SchemaValidator::new(&mock.clients());
        let config_map = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c"}
        });
        validator
            .ensure_composed_resource_crds(&[config_map])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_schema_validation_failure() {
        let mock = MockClients::new().with_crd(bucket_crd());
        let validator = SchemaValidator::new(&mock.clients());

        let invalid = json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "b-1"},
            "spec": {}
        });
        let err = validator
            .validate_resources(&xr(), &[invalid], false)
            .await
            .unwrap_err();
        assert!(err.is_only_schema());
        assert!(err.to_string().contains("size"));
    }

    #[tokio::test]
    async fn test_schema_validation_success() {
        let mock = MockClients::new().with_crd(bucket_crd());
        let validator = SchemaValidator::new(&mock.clients());
        validator
            .validate_resources(&xr(), &[valid_bucket()], false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scope_cluster_scoped_with_namespace_fails() {
        let mock = MockClients::new().with_crd(bucket_crd());
        let validator = SchemaValidator::new(&mock.clients());

        let mut namespaced_bucket = valid_bucket();
        resource::set_namespace(&mut namespaced_bucket, "prod");

        let err = validator
            .validate_resources(&xr(), &[namespaced_bucket.clone()], false)
            .await
            .unwrap_err();
        assert!(err.is_schema());
        assert!(err.to_string().contains("cluster-scoped"));

        // A Claim root is allowed to own cluster-scoped managed resources.
        validator
            .validate_resources(&xr(), &[namespaced_bucket], true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scope_cross_namespace_fails() {
        let mock = MockClients::new()
            .with_crd(bucket_crd())
            .with_namespaced_kind("s3.example.org", "Bucket");
        let validator = SchemaValidator::new(&mock.clients());

        let mut root = xr();
        resource::set_namespace(&mut root, "prod");

        let mut stray = valid_bucket();
        resource::set_namespace(&mut stray, "other");

        let err = validator
            .validate_resources(&root, &[stray], false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("crosses namespaces"));
    }

    #[tokio::test]
    async fn test_scope_namespaced_without_namespace_fails() {
        let mock = MockClients::new()
            .with_crd(bucket_crd())
            .with_namespaced_kind("s3.example.org", "Bucket");
        let validator = SchemaValidator::new(&mock.clients());

        let err = validator
            .validate_resources(&xr(), &[valid_bucket()], false)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has no namespace"));
    }
}
