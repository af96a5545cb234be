//! In-memory mock clients for testing
//!
//! Stores cluster state in memory, useful for unit tests without requiring
//! a Kubernetes cluster. Operation counts are tracked for assertions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use xpdiff_core::{Composition, DiffError, Gvk, Result, Xrd, crd_version_schema, object, resource};

use crate::clients::{
    ApplyClient, Clients, CompositionClient, DefinitionClient, EnvironmentClient, FunctionClient,
    ResourceClient, ResourceTreeClient, SchemaClient, is_builtin_group,
};
use crate::cluster::{composition_ref_name, resource_refs};
use crate::tree::ResourceNode;

type ResourceKey = (String, String, String, String);

/// In-memory cluster state implementing every client capability
#[derive(Clone, Default)]
pub struct MockClients {
    /// (apiVersion, kind, namespace, name) -> object
    resources: Arc<RwLock<HashMap<ResourceKey, JsonValue>>>,
    /// CRD name -> CRD
    crds: Arc<RwLock<HashMap<String, JsonValue>>>,
    xrds: Arc<RwLock<Vec<Xrd>>>,
    /// Composition name -> composition
    compositions: Arc<RwLock<HashMap<String, Composition>>>,
    /// Function name -> function object
    functions: Arc<RwLock<HashMap<String, JsonValue>>>,
    env_configs: Arc<RwLock<Vec<JsonValue>>>,
    /// (group, kind) pairs that are namespaced
    namespaced: Arc<RwLock<HashSet<(String, String)>>>,
    /// Per-object get counters keyed by "<apiVersion>/<kind>/<name>"
    gets: Arc<RwLock<HashMap<String, usize>>>,
    lists: Arc<RwLock<usize>>,
    dry_runs: Arc<RwLock<usize>>,
}

impl MockClients {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object
    pub fn with_resource(self, obj: JsonValue) -> Self {
        let key = (
            resource::api_version(&obj).to_string(),
            resource::kind(&obj).to_string(),
            resource::namespace(&obj).to_string(),
            resource::name(&obj).to_string(),
        );
        self.resources.write().unwrap().insert(key, obj);
        self
    }

    /// Register several objects
    pub fn with_resources(mut self, objs: Vec<JsonValue>) -> Self {
        for obj in objs {
            self = self.with_resource(obj);
        }
        self
    }

    /// Register a CRD keyed by its metadata name
    pub fn with_crd(self, crd: JsonValue) -> Self {
        self.crds
            .write()
            .unwrap()
            .insert(resource::name(&crd).to_string(), crd);
        self
    }

    /// Register an XRD (and seed the CRD cache from its schemas)
    pub fn with_xrd(self, xrd: Xrd) -> Self {
        {
            let mut crds = self.crds.write().unwrap();
            for claim in [false, true] {
                if let Some(crd) = xrd.to_crd(claim) {
                    crds.insert(resource::name(&crd).to_string(), crd);
                }
            }
        }
        self.xrds.write().unwrap().push(xrd);
        self
    }

    /// Register a composition
    pub fn with_composition(self, composition: Composition) -> Self {
        self.compositions
            .write()
            .unwrap()
            .insert(composition.name.clone(), composition);
        self
    }

    /// Register a composition function object
    pub fn with_function(self, function: JsonValue) -> Self {
        self.functions
            .write()
            .unwrap()
            .insert(resource::name(&function).to_string(), function);
        self
    }

    /// Register an environment config
    pub fn with_env_config(self, config: JsonValue) -> Self {
        self.env_configs.write().unwrap().push(config);
        self
    }

    /// Mark a (group, kind) as namespaced
    pub fn with_namespaced_kind(self, group: &str, kind: &str) -> Self {
        self.namespaced
            .write()
            .unwrap()
            .insert((group.to_string(), kind.to_string()));
        self
    }

    /// Bundle this mock into a capability record
    pub fn clients(&self) -> Clients {
        let shared = Arc::new(self.clone());
        Clients {
            resource: shared.clone(),
            schema: shared.clone(),
            apply: shared.clone(),
            composition: shared.clone(),
            definition: shared.clone(),
            environment: shared.clone(),
            tree: shared.clone(),
            function: shared,
        }
    }

    /// How many times an object was fetched by direct get
    pub fn get_count(&self, api_version: &str, kind: &str, name: &str) -> usize {
        self.gets
            .read()
            .unwrap()
            .get(&format!("{}/{}/{}", api_version, kind, name))
            .copied()
            .unwrap_or(0)
    }

    /// Total list calls issued
    pub fn list_count(&self) -> usize {
        *self.lists.read().unwrap()
    }

    /// Total dry-run applies issued
    pub fn dry_run_count(&self) -> usize {
        *self.dry_runs.read().unwrap()
    }

    fn lookup(&self, gvk: &Gvk, namespace: &str, name: &str) -> Option<JsonValue> {
        let store = self.resources.read().unwrap();
        let key = (
            gvk.api_version(),
            gvk.kind.clone(),
            namespace.to_string(),
            name.to_string(),
        );
        if let Some(found) = store.get(&key) {
            return Some(found.clone());
        }
        // Cluster-scoped lookups ignore the namespace component.
        if namespace.is_empty() {
            return store
                .iter()
                .find(|((av, k, _, n), _)| {
                    *av == gvk.api_version() && *k == gvk.kind && *n == name
                })
                .map(|(_, v)| v.clone());
        }
        None
    }

    fn build_tree(&self, obj: &JsonValue, depth: usize) -> ResourceNode {
        let mut node = ResourceNode::new(obj.clone());
        if depth >= 16 {
            return node;
        }
        for child_ref in resource_refs(obj) {
            let (Some(api_version), Some(kind), Some(name)) = (
                child_ref.get("apiVersion").and_then(|v| v.as_str()),
                child_ref.get("kind").and_then(|v| v.as_str()),
                child_ref.get("name").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let gvk = Gvk::from_api_version(api_version, kind);
            let namespace = child_ref
                .get("namespace")
                .and_then(|n| n.as_str())
                .unwrap_or_else(|| resource::namespace(obj));
            if let Some(child) = self
                .lookup(&gvk, namespace, name)
                .or_else(|| self.lookup(&gvk, "", name))
            {
                node.children.push(self.build_tree(&child, depth + 1));
            }
        }
        node
    }
}

#[async_trait]
impl ResourceClient for MockClients {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<JsonValue> {
        {
            let mut gets = self.gets.write().unwrap();
            *gets
                .entry(format!("{}/{}/{}", gvk.api_version(), gvk.kind, name))
                .or_insert(0) += 1;
        }
        self.lookup(gvk, namespace, name)
            .ok_or_else(|| DiffError::not_found(format!("{}/{}", gvk.kind, name)))
    }

    async fn list_by_label(
        &self,
        gvk: &Gvk,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JsonValue>> {
        *self.lists.write().unwrap() += 1;
        let store = self.resources.read().unwrap();
        Ok(store
            .iter()
            .filter(|((av, k, ns, _), _)| {
                *av == gvk.api_version()
                    && *k == gvk.kind
                    && (namespace.is_empty() || ns == namespace)
            })
            .map(|(_, v)| v)
            .filter(|obj| {
                selector
                    .iter()
                    .all(|(key, value)| resource::label(obj, key) == Some(value.as_str()))
            })
            .cloned()
            .collect())
    }

    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        Ok(self
            .namespaced
            .read()
            .unwrap()
            .contains(&(gvk.group.clone(), gvk.kind.clone())))
    }
}

#[async_trait]
impl SchemaClient for MockClients {
    async fn crd_for(&self, gvk: &Gvk) -> Result<JsonValue> {
        let crds = self.crds.read().unwrap();
        crds.values()
            .find(|crd| {
                object::get_string(crd, &["spec", "group"]) == Some(gvk.group.as_str())
                    && object::get_string(crd, &["spec", "names", "kind"])
                        == Some(gvk.kind.as_str())
            })
            .cloned()
            .ok_or_else(|| DiffError::not_found(format!("CRD for {}", gvk)))
    }

    async fn crd_by_name(&self, name: &str) -> Result<JsonValue> {
        self.crds
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DiffError::not_found(format!("CustomResourceDefinition/{}", name)))
    }

    async fn all_crds(&self) -> Result<Vec<JsonValue>> {
        Ok(self.crds.read().unwrap().values().cloned().collect())
    }

    async fn is_crd_required(&self, gvk: &Gvk) -> Result<bool> {
        Ok(!is_builtin_group(&gvk.group))
    }

    async fn load_crds_from_xrds(&self, xrds: &[Xrd]) -> Result<()> {
        let mut crds = self.crds.write().unwrap();
        for xrd in xrds {
            for claim in [false, true] {
                if let Some(crd) = xrd.to_crd(claim) {
                    crds.insert(resource::name(&crd).to_string(), crd);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ApplyClient for MockClients {
    async fn dry_run_apply(&self, obj: &JsonValue, _field_manager: &str) -> Result<JsonValue> {
        *self.dry_runs.write().unwrap() += 1;
        let gvk = resource::gvk(obj);
        match self.lookup(&gvk, resource::namespace(obj), resource::name(obj)) {
            Some(current) => {
                // Null handling during the merge follows the kind's CRD
                // schema, as the server would.
                let schema = {
                    let crds = self.crds.read().unwrap();
                    crds.values()
                        .find(|crd| {
                            object::get_string(crd, &["spec", "group"])
                                == Some(gvk.group.as_str())
                                && object::get_string(crd, &["spec", "names", "kind"])
                                    == Some(gvk.kind.as_str())
                        })
                        .and_then(|crd| crd_version_schema(crd, &gvk.version))
                        .cloned()
                };
                let mut merged = current;
                object::merge_override_with_schema(&mut merged, obj, schema.as_ref());
                Ok(merged)
            }
            None => Ok(obj.clone()),
        }
    }
}

#[async_trait]
impl CompositionClient for MockClients {
    async fn get_composition(&self, name: &str) -> Result<Composition> {
        self.compositions
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| DiffError::not_found(format!("Composition/{}", name)))
    }

    async fn find_composites_using_composition(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<JsonValue>> {
        let xrds = self.xrds.read().unwrap().clone();
        let store = self.resources.read().unwrap();
        Ok(store
            .values()
            .filter(|obj| {
                let gvk = resource::gvk(obj);
                xrds.iter().any(|x| x.defines_xr(&gvk))
            })
            .filter(|obj| composition_ref_name(obj) == Some(name))
            .filter(|obj| namespace.is_empty() || resource::namespace(obj) == namespace)
            .cloned()
            .collect())
    }

    async fn find_matching_composition(&self, xr: &JsonValue) -> Result<Composition> {
        if let Some(name) = composition_ref_name(xr) {
            return self.get_composition(name).await;
        }
        let api_version = resource::api_version(xr).to_string();
        let mut kind = resource::kind(xr).to_string();
        // A Claim matches through the composite kind its XRD declares.
        let input_gvk = resource::gvk(xr);
        if let Some(xrd) = self
            .xrds
            .read()
            .unwrap()
            .iter()
            .find(|x| x.defines_claim(&input_gvk))
        {
            kind = xrd.spec.names.kind.clone();
        }
        self.compositions
            .read()
            .unwrap()
            .values()
            .find(|c| c.matches_type(&api_version, &kind))
            .cloned()
            .ok_or_else(|| {
                DiffError::not_found(format!("composition for {}/{}", api_version, kind))
            })
    }
}

#[async_trait]
impl DefinitionClient for MockClients {
    async fn xrds(&self) -> Result<Vec<Xrd>> {
        Ok(self.xrds.read().unwrap().clone())
    }

    async fn xrd_for_xr(&self, gvk: &Gvk) -> Result<Xrd> {
        self.xrds
            .read()
            .unwrap()
            .iter()
            .find(|x| x.defines_xr(gvk))
            .cloned()
            .ok_or_else(|| DiffError::not_found(format!("XRD for {}", gvk)))
    }

    async fn xrd_for_claim(&self, gvk: &Gvk) -> Result<Xrd> {
        self.xrds
            .read()
            .unwrap()
            .iter()
            .find(|x| x.defines_claim(gvk))
            .cloned()
            .ok_or_else(|| DiffError::not_found(format!("XRD for claim {}", gvk)))
    }

    async fn is_claim_resource(&self, obj: &JsonValue) -> Result<bool> {
        let gvk = resource::gvk(obj);
        Ok(self.xrds.read().unwrap().iter().any(|x| x.defines_claim(&gvk)))
    }
}

#[async_trait]
impl EnvironmentClient for MockClients {
    async fn environment_configs(&self) -> Result<Vec<JsonValue>> {
        Ok(self.env_configs.read().unwrap().clone())
    }
}

#[async_trait]
impl ResourceTreeClient for MockClients {
    async fn resource_tree(&self, root: &JsonValue) -> Result<ResourceNode> {
        // Walk from the live object, as the cluster client does.
        let live = self
            .lookup(&resource::gvk(root), resource::namespace(root), resource::name(root))
            .unwrap_or_else(|| root.clone());
        Ok(self.build_tree(&live, 0))
    }
}

#[async_trait]
impl FunctionClient for MockClients {
    async fn functions_from_pipeline(&self, composition: &Composition) -> Result<Vec<JsonValue>> {
        let functions = self.functions.read().unwrap();
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for step in &composition.spec.pipeline {
            if !seen.insert(step.function_ref.name.clone()) {
                continue;
            }
            let function = functions.get(&step.function_ref.name).cloned().ok_or_else(|| {
                DiffError::not_found(format!("Function/{}", step.function_ref.name))
            })?;
            out.push(function);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bucket(name: &str) -> JsonValue {
        json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {
                "name": name,
                "labels": {"crossplane.io/composite": "parent-xr"}
            }
        })
    }

    #[tokio::test]
    async fn test_get_and_counts() {
        let mock = MockClients::new().with_resource(bucket("b-1"));
        let gvk = Gvk::from_api_version("s3.example.org/v1", "Bucket");

        let fetched = mock.get(&gvk, "", "b-1").await.unwrap();
        assert_eq!(resource::name(&fetched), "b-1");
        assert_eq!(mock.get_count("s3.example.org/v1", "Bucket", "b-1"), 1);

        let err = mock.get(&gvk, "", "absent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_list_by_label() {
        let mock = MockClients::new()
            .with_resource(bucket("b-1"))
            .with_resource(bucket("b-2"));
        let gvk = Gvk::from_api_version("s3.example.org/v1", "Bucket");

        let mut selector = BTreeMap::new();
        selector.insert("crossplane.io/composite".to_string(), "parent-xr".to_string());
        let found = mock.list_by_label(&gvk, "", &selector).await.unwrap();
        assert_eq!(found.len(), 2);

        selector.insert("crossplane.io/composite".to_string(), "other".to_string());
        let none = mock.list_by_label(&gvk, "", &selector).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_apply_merges_over_current() {
        let current = json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "b-1", "uid": "u-1"},
            "spec": {"size": "small", "region": "eu"}
        });
        let mock = MockClients::new().with_resource(current);

        let desired = json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "b-1"},
            "spec": {"size": "large"}
        });
        let merged = mock.dry_run_apply(&desired, "xpdiff").await.unwrap();
        assert_eq!(object::get_string(&merged, &["spec", "size"]), Some("large"));
        assert_eq!(object::get_string(&merged, &["spec", "region"]), Some("eu"));
        assert_eq!(object::get_string(&merged, &["metadata", "uid"]), Some("u-1"));
    }

    #[tokio::test]
    async fn test_dry_run_apply_null_respects_schema_nullability() {
        let crd = json!({
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
                                "properties": {
                                    "size": {"type": "string"},
                                    "region": {"type": "string", "nullable": true}
                                }
                            }
                        }
                    }}
                }]
            }
        });
        let current = json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "b-1"},
            "spec": {"size": "small", "region": "eu"}
        });
        let mock = MockClients::new().with_crd(crd).with_resource(current);

        let desired = json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "b-1"},
            "spec": {"size": null, "region": null}
        });
        let merged = mock.dry_run_apply(&desired, "xpdiff").await.unwrap();

        // Nullable field deleted; non-nullable field keeps the literal null.
        assert!(object::get_path(&merged, &["spec", "region"]).is_none());
        assert_eq!(
            object::get_path(&merged, &["spec", "size"]),
            Some(&json!(null))
        );
    }

    #[tokio::test]
    async fn test_resource_tree_follows_refs() {
        let xr = json!({
            "apiVersion": "example.org/v1",
            "kind": "XBucket",
            "metadata": {"name": "parent-xr"},
            "spec": {"resourceRefs": [
                {"apiVersion": "s3.example.org/v1", "kind": "Bucket", "name": "b-1"}
            ]}
        });
        let mock = MockClients::new()
            .with_resource(xr.clone())
            .with_resource(bucket("b-1"));

        let tree = mock.resource_tree(&xr).await.unwrap();
        assert_eq!(tree.len(), 2);
        assert_eq!(resource::name(tree.descendants()[0]), "b-1");
    }
}
