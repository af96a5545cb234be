//! Cluster reads adjacent to diffing
//!
//! Fetching the current counterpart of a desired resource (including the
//! generateName fallback), the observed children of a composite, and
//! owner-reference upkeep.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use xpdiff_core::{Result, fields, resource};
use xpdiff_kube::{Clients, ResourceClient, ResourceTreeClient};

/// Resource-level cluster access for the diff engine
pub struct ResourceManager {
    resource: Arc<dyn ResourceClient>,
    tree: Arc<dyn ResourceTreeClient>,
}

impl ResourceManager {
    pub fn new(clients: &Clients) -> Self {
        Self {
            resource: clients.resource.clone(),
            tree: clients.tree.clone(),
        }
    }

    /// Fetch the cluster object a desired resource corresponds to
    ///
    /// Returns `(current, is_new)`. Lookup order:
    /// 1. direct get by name, when the desired resource has one;
    /// 2. on NotFound with a generateName, a label-scoped list over the
    ///    parent composite's children, matched on the
    ///    composition-resource-name annotation;
    /// 3. otherwise the resource is new.
    pub async fn fetch_current_object(
        &self,
        parent: Option<&JsonValue>,
        desired: &JsonValue,
    ) -> Result<(Option<JsonValue>, bool)> {
        let gvk = resource::gvk(desired);
        let namespace = resource::namespace(desired);
        let name = resource::name(desired);

        if !name.is_empty() {
            match self.resource.get(&gvk, namespace, name).await {
                Ok(current) => return Ok((Some(current), false)),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        if resource::generate_name(desired).is_empty() {
            return Ok((None, true));
        }

        // Root identity for the label-scoped fallback: the parent XR's
        // name when supplied, else the desired resource's composite label.
        // A rendered label can name a root that does not exist yet.
        let composite_name = parent
            .map(|p| resource::name(p).to_string())
            .filter(|n| !n.is_empty())
            .or_else(|| {
                resource::label(desired, fields::COMPOSITE_LABEL).map(str::to_string)
            })
            .filter(|n| !n.is_empty());
        let Some(composite_name) = composite_name else {
            return Ok((None, true));
        };
        let Some(slot) =
            resource::annotation(desired, fields::COMPOSITION_RESOURCE_NAME_ANNOTATION)
        else {
            return Ok((None, true));
        };

        let mut selector = BTreeMap::new();
        selector.insert(fields::COMPOSITE_LABEL.to_string(), composite_name);
        let candidates = self.resource.list_by_label(&gvk, namespace, &selector).await?;
        let matched = candidates.into_iter().find(|candidate| {
            resource::annotation(candidate, fields::COMPOSITION_RESOURCE_NAME_ANNOTATION)
                == Some(slot)
        });

        match matched {
            Some(current) => Ok((Some(current), false)),
            None => Ok((None, true)),
        }
    }

    /// The composite's currently observed composed resources
    ///
    /// A new composite (empty uid) or a failing tree fetch yields an empty
    /// list rather than an error.
    pub async fn fetch_observed_resources(&self, composite: &JsonValue) -> Vec<JsonValue> {
        if resource::uid(composite).is_empty() {
            return Vec::new();
        }
        match self.tree.resource_tree(composite).await {
            Ok(tree) => tree
                .descendants()
                .into_iter()
                .filter(|node| {
                    resource::annotation(node, fields::COMPOSITION_RESOURCE_NAME_ANNOTATION)
                        .is_some()
                })
                .cloned()
                .collect(),
            Err(e) => {
                debug!(
                    composite = resource::name(composite),
                    error = %e,
                    "cannot fetch observed resources"
                );
                Vec::new()
            }
        }
    }

    /// Point the desired resource's controller owner reference at the XR
    ///
    /// The owner is always the XR, never a Claim.
    pub fn update_owner_refs(&self, composite: Option<&JsonValue>, desired: &mut JsonValue) {
        if let Some(owner) = composite
            && !resource::name(owner).is_empty()
        {
            resource::set_controller_owner(desired, owner);
        }
    }
}
