//! Per-resource and per-composite diff calculation

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::debug;

use xpdiff_core::{DiffError, Result, fields, object, resource};
use xpdiff_kube::{ApplyClient, Clients, ResourceTreeClient};

use crate::diff::{DiffMap, ResourceDiff};
use crate::options::DiffOptions;
use crate::resources::ResourceManager;

/// Diffs and rendered-resource keys collected for one composite
#[derive(Debug, Default)]
pub struct XrDiffs {
    pub diffs: DiffMap,
    /// Diff keys of every rendered resource, regardless of diff type
    pub rendered_keys: BTreeSet<String>,
    /// Per-resource failures; the rest of the set is still usable
    pub errors: Vec<DiffError>,
}

/// Computes structured diffs for desired resources
pub struct DiffCalculator {
    resources: Arc<ResourceManager>,
    apply: Arc<dyn ApplyClient>,
    tree: Arc<dyn ResourceTreeClient>,
    composed_manager_prefix: String,
    default_field_manager: String,
}

impl DiffCalculator {
    pub fn new(clients: &Clients, resources: Arc<ResourceManager>, options: &DiffOptions) -> Self {
        Self {
            resources,
            apply: clients.apply.clone(),
            tree: clients.tree.clone(),
            composed_manager_prefix: options.composed_manager_prefix.clone(),
            default_field_manager: options.default_field_manager.clone(),
        }
    }

    /// Diff one desired resource against its cluster counterpart
    ///
    /// When the current object was created through generateName, the
    /// desired copy takes over its name and root-composite label before
    /// the dry-run apply: cluster identity is authoritative.
    pub async fn calculate_diff(
        &self,
        composite: Option<&JsonValue>,
        desired: &JsonValue,
    ) -> Result<ResourceDiff> {
        let (current, _is_new) = self.resources.fetch_current_object(composite, desired).await?;

        let mut desired = desired.clone();
        if let Some(current) = &current {
            let current_name = resource::name(current);
            let current_generate_name = resource::generate_name(current);
            if !current_name.is_empty() && !current_generate_name.is_empty() {
                resource::set_name(&mut desired, current_name);
                resource::set_generate_name(&mut desired, current_generate_name);
                if let Some(root) = resource::label(current, fields::COMPOSITE_LABEL) {
                    let root = root.to_string();
                    resource::set_label(&mut desired, fields::COMPOSITE_LABEL, &root);
                }
            }
        }

        self.resources.update_owner_refs(composite, &mut desired);

        match &current {
            Some(current) => {
                let manager = self.field_manager_for(current);
                let would_be = self.apply.dry_run_apply(&desired, &manager).await?;
                Ok(ResourceDiff::from_pair(current, &would_be))
            }
            None => Ok(ResourceDiff::added(&desired)),
        }
    }

    /// Diff an XR and its composed resources, without removal detection
    ///
    /// Per-resource failures are collected, not fatal: one resource's
    /// error never hides another's valid diff.
    pub async fn calculate_non_removal_diffs(
        &self,
        composite: &JsonValue,
        desired_xr: &JsonValue,
        composed: &[JsonValue],
    ) -> XrDiffs {
        let mut out = XrDiffs::default();

        match self.calculate_diff(None, desired_xr).await {
            Ok(diff) => {
                out.diffs.insert(diff.diff_key(), diff);
            }
            Err(e) => out.errors.push(e),
        }

        for child in composed {
            if resource::name(child).is_empty() && resource::generate_name(child).is_empty() {
                // Template bug: a resource with no identity is silently
                // dropped from the diff.
                debug!(
                    kind = resource::kind(child),
                    "dropping composed resource with neither name nor generateName"
                );
                continue;
            }

            match self.calculate_diff(Some(composite), child).await {
                Ok(diff) => {
                    out.rendered_keys.insert(diff.diff_key());
                    out.diffs.insert(diff.diff_key(), diff);
                }
                Err(e) => out.errors.push(e),
            }
        }

        out
    }

    /// Resources that exist in the live tree but were not rendered
    ///
    /// Walks the tree depth-first, skipping the root; composed nodes
    /// (those carrying the composition-resource-name annotation) whose
    /// diff key is absent from `rendered` become Removed diffs.
    pub async fn calculate_removed_resource_diffs(
        &self,
        xr: &JsonValue,
        rendered: &BTreeSet<String>,
    ) -> Result<DiffMap> {
        let tree = self.tree.resource_tree(xr).await?;

        let mut out = DiffMap::new();
        for node in tree.descendants() {
            let slot = resource::annotation(node, fields::COMPOSITION_RESOURCE_NAME_ANNOTATION)
                .unwrap_or_default();
            if slot.is_empty() {
                continue;
            }
            let key = resource::diff_key(node);
            if !rendered.contains(&key) {
                out.insert(key, ResourceDiff::removed(node));
            }
        }
        Ok(out)
    }

    /// The field manager to dry-run apply with
    ///
    /// Any managedFields entry whose manager starts with the composed
    /// prefix wins; otherwise the default manager.
    fn field_manager_for(&self, current: &JsonValue) -> String {
        object::get_path(current, &["metadata", "managedFields"])
            .and_then(|v| v.as_array())
            .and_then(|entries| {
                entries.iter().find_map(|entry| {
                    entry
                        .get("manager")
                        .and_then(|m| m.as_str())
                        .filter(|m| m.starts_with(&self.composed_manager_prefix))
                        .map(str::to_string)
                })
            })
            .unwrap_or_else(|| self.default_field_manager.clone())
    }
}
