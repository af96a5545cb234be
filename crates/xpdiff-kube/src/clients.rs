//! Client capability traits the diff engine consumes
//!
//! The engine never talks to the cluster directly: it depends on these
//! abstract capabilities, which are implemented against a live cluster in
//! `cluster` and in memory in `mock`. The `Clients` record bundles one of
//! each so callers pass a single handle around.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use xpdiff_core::{Composition, Gvk, Result, Xrd};

use crate::tree::ResourceNode;

/// Reads arbitrary cluster objects
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Get one object; a 404 surfaces as a NotFound error
    async fn get(&self, gvk: &Gvk, namespace: &str, name: &str) -> Result<JsonValue>;

    /// List objects of one kind matching a label selector
    async fn list_by_label(
        &self,
        gvk: &Gvk,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<JsonValue>>;

    /// Whether the kind is namespaced (vs cluster-scoped)
    async fn is_namespaced(&self, gvk: &Gvk) -> Result<bool>;
}

/// Serves CRD schemas
#[async_trait]
pub trait SchemaClient: Send + Sync {
    /// The CRD defining a kind; NotFound when none exists
    async fn crd_for(&self, gvk: &Gvk) -> Result<JsonValue>;

    /// A CRD by its metadata name (e.g. "xbuckets.example.org")
    async fn crd_by_name(&self, name: &str) -> Result<JsonValue>;

    /// All currently known CRDs
    async fn all_crds(&self) -> Result<Vec<JsonValue>>;

    /// Whether the kind needs a CRD at all (built-in core types are exempt)
    async fn is_crd_required(&self, gvk: &Gvk) -> Result<bool>;

    /// Seed the CRD cache from XRD-declared schemas
    async fn load_crds_from_xrds(&self, xrds: &[Xrd]) -> Result<()>;
}

/// Server-side dry-run apply
#[async_trait]
pub trait ApplyClient: Send + Sync {
    /// Compute the authoritative post-merge shape without persisting it
    async fn dry_run_apply(&self, obj: &JsonValue, field_manager: &str) -> Result<JsonValue>;
}

/// Reads Composition templates and their bindings
#[async_trait]
pub trait CompositionClient: Send + Sync {
    async fn get_composition(&self, name: &str) -> Result<Composition>;

    /// All cluster XRs currently bound to a composition
    async fn find_composites_using_composition(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Vec<JsonValue>>;

    /// Composition selection for an XR: its compositionRef, or the single
    /// composition templating its type
    async fn find_matching_composition(&self, xr: &JsonValue) -> Result<Composition>;
}

/// Reads composite resource definitions
#[async_trait]
pub trait DefinitionClient: Send + Sync {
    async fn xrds(&self) -> Result<Vec<Xrd>>;

    /// The XRD declaring a composite kind; NotFound when unregistered
    async fn xrd_for_xr(&self, gvk: &Gvk) -> Result<Xrd>;

    /// The XRD declaring a claim kind; NotFound when unregistered
    async fn xrd_for_claim(&self, gvk: &Gvk) -> Result<Xrd>;

    async fn is_claim_resource(&self, obj: &JsonValue) -> Result<bool>;
}

/// Reads environment configs for requirement resolution
#[async_trait]
pub trait EnvironmentClient: Send + Sync {
    async fn environment_configs(&self) -> Result<Vec<JsonValue>>;
}

/// Reports the live child tree rooted at a composite
#[async_trait]
pub trait ResourceTreeClient: Send + Sync {
    async fn resource_tree(&self, root: &JsonValue) -> Result<ResourceNode>;
}

/// Resolves a composition's pipeline to its Function objects
#[async_trait]
pub trait FunctionClient: Send + Sync {
    async fn functions_from_pipeline(&self, composition: &Composition) -> Result<Vec<JsonValue>>;
}

/// Capability record bundling every client the engine needs
#[derive(Clone)]
pub struct Clients {
    pub resource: Arc<dyn ResourceClient>,
    pub schema: Arc<dyn SchemaClient>,
    pub apply: Arc<dyn ApplyClient>,
    pub composition: Arc<dyn CompositionClient>,
    pub definition: Arc<dyn DefinitionClient>,
    pub environment: Arc<dyn EnvironmentClient>,
    pub tree: Arc<dyn ResourceTreeClient>,
    pub function: Arc<dyn FunctionClient>,
}

/// API groups served without CRDs
///
/// Core ("" group), the `*.k8s.io` families, and the legacy named groups
/// are compiled into the API server.
pub fn is_builtin_group(group: &str) -> bool {
    group.is_empty()
        || group.ends_with("k8s.io")
        || matches!(group, "apps" | "batch" | "autoscaling" | "policy" | "extensions")
}
