//! Kube-backed implementations of the client capabilities
//!
//! One `ClusterClients` struct implements every trait in `clients`.
//! Resolution goes through a discovery snapshot taken at construction,
//! with a oneshot `pinned_kind` fallback for kinds (typically CRD-defined)
//! that appeared after the snapshot.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use kube::api::{Api, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{ApiCapabilities, ApiResource, Scope};
use kube::{Client, Discovery};
use serde_json::Value as JsonValue;
use tracing::debug;

use xpdiff_core::{Composition, DiffError, Gvk, Result, Xrd, object, resource};

use crate::clients::{
    ApplyClient, Clients, CompositionClient, DefinitionClient, EnvironmentClient, FunctionClient,
    ResourceClient, ResourceTreeClient, SchemaClient, is_builtin_group,
};
use crate::tree::ResourceNode;

/// Resource-tree recursion bound; a deeper reference chain is cyclic
const MAX_TREE_DEPTH: usize = 16;

/// All cluster capabilities backed by one kube client
pub struct ClusterClients {
    client: Client,
    discovery: Discovery,
    crds: RwLock<HashMap<String, JsonValue>>,
    xrds: RwLock<Option<Vec<Xrd>>>,
}

impl ClusterClients {
    /// Connect using the ambient kubeconfig and run API discovery
    pub async fn connect() -> Result<Self> {
        let client = Client::try_default()
            .await
            .map_err(|e| DiffError::Api(e.to_string()))?;
        Self::new(client).await
    }

    /// Build from an existing client, running API discovery
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|e| DiffError::Api(format!("API discovery failed: {}", e)))?;

        Ok(Self {
            client,
            discovery,
            crds: RwLock::new(HashMap::new()),
            xrds: RwLock::new(None),
        })
    }

    /// Bundle this instance into a capability record
    pub fn into_clients(self) -> Clients {
        let shared = Arc::new(self);
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

    async fn resolve(&self, gvk: &Gvk) -> Result<(ApiResource, ApiCapabilities)> {
        let kgvk = GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind);
        if let Some((ar, caps)) = self.discovery.resolve_gvk(&kgvk) {
            return Ok((ar, caps));
        }
        kube::discovery::oneshot::pinned_kind(&self.client, &kgvk)
            .await
            .map_err(|e| DiffError::Api(format!("cannot resolve {}: {}", gvk, e)))
    }

    async fn api_for(&self, gvk: &Gvk, namespace: &str) -> Result<Api<DynamicObject>> {
        let (ar, caps) = self.resolve(gvk).await?;
        Ok(self.api_with(&ar, &caps, namespace))
    }

    fn api_with(&self, ar: &ApiResource, caps: &ApiCapabilities, namespace: &str) -> Api<DynamicObject> {
        if caps.scope == Scope::Cluster || namespace.is_empty() {
            Api::all_with(self.client.clone(), ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, ar)
        }
    }

    fn crd_api(&self) -> Api<DynamicObject> {
        let ar = ApiResource::erase::<
            k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
        >(&());
        Api::all_with(self.client.clone(), &ar)
    }

    async fn fetch_xrds(&self) -> Result<Vec<Xrd>> {
        if let Some(cached) = self.xrds.read().expect("xrd cache lock").clone() {
            return Ok(cached);
        }

        let gvk = Gvk::new(
            "apiextensions.crossplane.io",
            "v1",
            "CompositeResourceDefinition",
        );
        let ar = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind),
            "compositeresourcedefinitions",
        );
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DiffError::Api(format!("cannot list XRDs: {}", e)))?;

        let mut xrds = Vec::with_capacity(list.items.len());
        for item in list.items {
            let value = serde_json::to_value(&item)?;
            xrds.push(Xrd::from_value(&value)?);
        }

        *self.xrds.write().expect("xrd cache lock") = Some(xrds.clone());
        Ok(xrds)
    }

    /// List every instance of the composite kind an XRD declares
    async fn list_xrs_of(&self, xrd: &Xrd, namespace: &str) -> Result<Vec<JsonValue>> {
        let Some(version) = xrd
            .spec
            .versions
            .iter()
            .find(|v| v.referenceable)
            .or_else(|| xrd.spec.versions.iter().find(|v| v.served))
        else {
            return Ok(Vec::new());
        };
        let gvk = Gvk::new(&xrd.spec.group, &version.name, &xrd.spec.names.kind);

        let api = self.api_for(&gvk, namespace).await?;
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DiffError::Api(format!("cannot list {}: {}", gvk, e)))?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(&o).map_err(Into::into))
            .collect()
    }

    fn build_tree<'a>(
        &'a self,
        obj: &'a JsonValue,
        depth: usize,
    ) -> futures::future::BoxFuture<'a, ResourceNode> {
        Box::pin(async move {
            let mut node = ResourceNode::new(obj.clone());
            if depth >= MAX_TREE_DEPTH {
                debug!(depth, "resource tree depth bound hit, truncating");
                return node;
            }

            for child_ref in resource_refs(obj) {
                let Some((gvk, name)) = ref_target(&child_ref) else {
                    continue;
                };
                let namespace = child_ref
                    .get("namespace")
                    .and_then(|n| n.as_str())
                    .unwrap_or_else(|| resource::namespace(obj));
                match self.get(&gvk, namespace, &name).await {
                    Ok(child) => node.children.push(self.build_tree(&child, depth + 1).await),
                    Err(e) if e.is_not_found() => {
                        debug!(%gvk, %name, "referenced child not found, skipping")
                    }
                    Err(e) => debug!(%gvk, %name, error = %e, "cannot fetch referenced child"),
                }
            }
            node
        })
    }
}

/// The composed-resource references an XR carries
pub fn resource_refs(obj: &JsonValue) -> Vec<JsonValue> {
    object::get_path(obj, &["spec", "resourceRefs"])
        .or_else(|| object::get_path(obj, &["spec", "crossplane", "resourceRefs"]))
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default()
}

fn ref_target(child_ref: &JsonValue) -> Option<(Gvk, String)> {
    let api_version = child_ref.get("apiVersion")?.as_str()?;
    let kind = child_ref.get("kind")?.as_str()?;
    let name = child_ref.get("name")?.as_str()?;
    if name.is_empty() {
        return None;
    }
    Some((Gvk::from_api_version(api_version, kind), name.to_string()))
}

/// The compositionRef name on an XR, v1 or v2 shape
pub fn composition_ref_name(xr: &JsonValue) -> Option<&str> {
    object::get_string(xr, &["spec", "crossplane", "compositionRef", "name"])
        .or_else(|| object::get_string(xr, &["spec", "compositionRef", "name"]))
}

fn map_get_err(e: kube::Error, what: String) -> DiffError {
    match &e {
        kube::Error::Api(resp) if resp.code == 404 => DiffError::not_found(what),
        _ => DiffError::Api(format!("failed to fetch {}: {}", what, e)),
    }
}

#[async_trait]
impl ResourceClient for ClusterClients {
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<JsonValue> {
        let api = self.api_for(gvk, namespace).await?;
        let obj = api
            .get(name)
            .await
            .map_err(|e| map_get_err(e, format!("{}/{}", gvk.kind, name)))?;
        Ok(serde_json::to_value(&obj)?)
    }

    async fn list_by_label(
        &self,
        gvk: &Gvk,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JsonValue>> {
        let api = self.api_for(gvk, namespace).await?;
        let labels = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let list = api
            .list(&ListParams::default().labels(&labels))
            .await
            .map_err(|e| DiffError::Api(format!("failed to list {}: {}", gvk, e)))?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(&o).map_err(Into::into))
            .collect()
    }

    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool> {
        let (_, caps) = self.resolve(gvk).await?;
        Ok(caps.scope == Scope::Namespaced)
    }
}

#[async_trait]
impl SchemaClient for ClusterClients {
    async fn crd_for(&self, gvk: &Gvk) -> Result<JsonValue> {
        let (ar, _) = self
            .resolve(gvk)
            .await
            .map_err(|_| DiffError::not_found(format!("CRD for {}", gvk)))?;
        let name = format!("{}.{}", ar.plural, gvk.group);
        self.crd_by_name(&name).await
    }

    async fn crd_by_name(&self, name: &str) -> Result<JsonValue> {
        if let Some(cached) = self.crds.read().expect("crd cache lock").get(name) {
            return Ok(cached.clone());
        }

        let obj = self
            .crd_api()
            .get(name)
            .await
            .map_err(|e| map_get_err(e, format!("CustomResourceDefinition/{}", name)))?;
        let value = serde_json::to_value(&obj)?;
        self.crds
            .write()
            .expect("crd cache lock")
            .insert(name.to_string(), value.clone());
        Ok(value)
    }

    async fn all_crds(&self) -> Result<Vec<JsonValue>> {
        let list = self
            .crd_api()
            .list(&ListParams::default())
            .await
            .map_err(|e| DiffError::Api(format!("cannot list CRDs: {}", e)))?;
        list.items
            .into_iter()
            .map(|o| serde_json::to_value(&o).map_err(Into::into))
            .collect()
    }

    async fn is_crd_required(&self, gvk: &Gvk) -> Result<bool> {
        Ok(!is_builtin_group(&gvk.group))
    }

    async fn load_crds_from_xrds(&self, xrds: &[Xrd]) -> Result<()> {
        let mut cache = self.crds.write().expect("crd cache lock");
        for xrd in xrds {
            for claim in [false, true] {
                if let Some(crd) = xrd.to_crd(claim) {
                    cache.insert(resource::name(&crd).to_string(), crd);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ApplyClient for ClusterClients {
    async fn dry_run_apply(&self, obj: &JsonValue, field_manager: &str) -> Result<JsonValue> {
        let gvk = resource::gvk(obj);
        let name = resource::name(obj);
        if name.is_empty() {
            return Err(DiffError::Internal(format!(
                "cannot dry-run apply unnamed {}",
                gvk.kind
            )));
        }

        let api = self.api_for(&gvk, resource::namespace(obj)).await?;
        let dynamic: DynamicObject = serde_json::from_value(obj.clone())?;

        let mut params = PatchParams::apply(field_manager);
        params.force = true;
        params.dry_run = true;

        let merged = api
            .patch(name, &params, &Patch::Apply(&dynamic))
            .await
            .map_err(|e| {
                DiffError::Api(format!("dry-run apply of {}/{} failed: {}", gvk.kind, name, e))
            })?;
        Ok(serde_json::to_value(&merged)?)
    }
}

#[async_trait]
impl CompositionClient for ClusterClients {
    async fn get_composition(&self, name: &str) -> Result<Composition> {
        let gvk = Gvk::new("apiextensions.crossplane.io", "v1", "Composition");
        let value = self.get(&gvk, "", name).await?;
        Composition::from_value(&value)
    }

    async fn find_composites_using_composition(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<JsonValue>> {
        let mut bound = Vec::new();
        for xrd in self.fetch_xrds().await? {
            let xrs = match self.list_xrs_of(&xrd, namespace).await {
                Ok(xrs) => xrs,
                Err(e) => {
                    debug!(xrd = %xrd.name, error = %e, "cannot list composites, skipping kind");
                    continue;
                }
            };
            bound.extend(
                xrs.into_iter()
                    .filter(|xr| composition_ref_name(xr) == Some(name)),
            );
        }
        Ok(bound)
    }

    async fn find_matching_composition(&self, xr: &JsonValue) -> Result<Composition> {
        if let Some(ref_name) = composition_ref_name(xr) {
            return self.get_composition(ref_name).await;
        }

        let gvk = Gvk::new("apiextensions.crossplane.io", "v1", "Composition");
        let ar = ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk(&gvk.group, &gvk.version, &gvk.kind),
            "compositions",
        );
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| DiffError::Api(format!("cannot list compositions: {}", e)))?;

        let mut compositions = Vec::with_capacity(list.items.len());
        for item in list.items {
            let value = serde_json::to_value(&item)?;
            compositions.push(Composition::from_value(&value)?);
        }

        let api_version = resource::api_version(xr).to_string();
        let mut kind = resource::kind(xr).to_string();
        // A Claim matches through the composite kind its XRD declares.
        let input_gvk = resource::gvk(xr);
        if let Some(xrd) = self
            .fetch_xrds()
            .await?
            .into_iter()
            .find(|x| x.defines_claim(&input_gvk))
        {
            kind = xrd.spec.names.kind.clone();
        }

        compositions
            .into_iter()
            .find(|c| c.matches_type(&api_version, &kind))
            .ok_or_else(|| {
                DiffError::not_found(format!("composition for {}/{}", api_version, kind))
            })
    }
}

#[async_trait]
impl DefinitionClient for ClusterClients {
    async fn xrds(&self) -> Result<Vec<Xrd>> {
        self.fetch_xrds().await
    }

    async fn xrd_for_xr(&self, gvk: &Gvk) -> Result<Xrd> {
        self.fetch_xrds()
            .await?
            .into_iter()
            .find(|x| x.defines_xr(gvk))
            .ok_or_else(|| DiffError::not_found(format!("XRD for {}", gvk)))
    }

    async fn xrd_for_claim(&self, gvk: &Gvk) -> Result<Xrd> {
        self.fetch_xrds()
            .await?
            .into_iter()
            .find(|x| x.defines_claim(gvk))
            .ok_or_else(|| DiffError::not_found(format!("XRD for claim {}", gvk)))
    }

    async fn is_claim_resource(&self, obj: &JsonValue) -> Result<bool> {
        let gvk = resource::gvk(obj);
        Ok(self
            .fetch_xrds()
            .await?
            .iter()
            .any(|x| x.defines_claim(&gvk)))
    }
}

#[async_trait]
impl EnvironmentClient for ClusterClients {
    async fn environment_configs(&self) -> Result<Vec<JsonValue>> {
        for version in ["v1beta1", "v1alpha1"] {
            let gvk = Gvk::new("apiextensions.crossplane.io", version, "EnvironmentConfig");
            let Ok(api) = self.api_for(&gvk, "").await else {
                continue;
            };
            match api.list(&ListParams::default()).await {
                Ok(list) => {
                    return list
                        .items
                        .into_iter()
                        .map(|o| serde_json::to_value(&o).map_err(Into::into))
                        .collect();
                }
                Err(e) => debug!(version, error = %e, "cannot list environment configs"),
            }
        }
        Ok(Vec::new())
    }
}

#[async_trait]
impl ResourceTreeClient for ClusterClients {
    async fn resource_tree(&self, root: &JsonValue) -> Result<ResourceNode> {
        // The caller's copy may predate the cluster state (or lack the
        // resource references entirely); walk from the live object.
        let live = match self
            .get(&resource::gvk(root), resource::namespace(root), resource::name(root))
            .await
        {
            Ok(live) => live,
            Err(e) if e.is_not_found() => root.clone(),
            Err(e) => return Err(e),
        };
        Ok(self.build_tree(&live, 0).await)
    }
}

#[async_trait]
impl FunctionClient for ClusterClients {
    async fn functions_from_pipeline(&self, composition: &Composition) -> Result<Vec<JsonValue>> {
        let gvk = Gvk::new("pkg.crossplane.io", "v1", "Function");
        let mut functions = Vec::new();
        let mut seen = std::collections::BTreeSet::new();
        for step in &composition.spec.pipeline {
            if !seen.insert(step.function_ref.name.clone()) {
                continue;
            }
            let function = self.get(&gvk, "", &step.function_ref.name).await?;
            functions.push(function);
        }
        Ok(functions)
    }
}
