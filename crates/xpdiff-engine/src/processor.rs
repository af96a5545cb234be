//! The recursive composite diff driver
//!
//! One entry point per candidate resource: resolve the backing XR for
//! Claims, apply XRD defaults, drive the render pipeline to a fixed point,
//! diff the composite and its composed resources, recurse into composed
//! resources that are themselves composites, and detect removals at the
//! top level only.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value as JsonValue;
use serde_json::json;
use tracing::{debug, info, warn};

use xpdiff_core::{
    Composition, DiffError, Gvk, Result, Xrd, crd_version_schema, fields, object, resource,
};
use xpdiff_kube::{Clients, CompositionClient};

use crate::calculator::DiffCalculator;
use crate::diff::DiffMap;
use crate::functions::FunctionProvider;
use crate::options::DiffOptions;
use crate::render::Renderer;
use crate::requirements::RequirementsProvider;
use crate::resources::ResourceManager;
use crate::validator::SchemaValidator;

/// Supplies the composition to render a given XR with
#[async_trait]
pub trait CompositionProvider: Send + Sync {
    async fn composition_for(&self, xr: &JsonValue) -> Result<Composition>;
}

/// Composition selection against the cluster
pub struct MatchingCompositionProvider {
    composition: Arc<dyn CompositionClient>,
}

impl MatchingCompositionProvider {
    pub fn new(composition: Arc<dyn CompositionClient>) -> Self {
        Self { composition }
    }
}

#[async_trait]
impl CompositionProvider for MatchingCompositionProvider {
    async fn composition_for(&self, xr: &JsonValue) -> Result<Composition> {
        self.composition.find_matching_composition(xr).await
    }
}

/// Returns one fixed composition for every XR
///
/// The composition-change driver uses this so every bound XR renders with
/// the new template.
pub struct FixedCompositionProvider(pub Composition);

#[async_trait]
impl CompositionProvider for FixedCompositionProvider {
    async fn composition_for(&self, _xr: &JsonValue) -> Result<Composition> {
        Ok(self.0.clone())
    }
}

/// The recursive diff processor for composite resources
pub struct XrDiffProcessor {
    clients: Clients,
    resources: Arc<ResourceManager>,
    validator: SchemaValidator,
    calculator: DiffCalculator,
    requirements: Arc<RequirementsProvider>,
    functions: Arc<dyn FunctionProvider>,
    renderer: Renderer,
    options: DiffOptions,
}

impl XrDiffProcessor {
    pub fn new(
        clients: Clients,
        functions: Arc<dyn FunctionProvider>,
        renderer: Renderer,
        options: DiffOptions,
    ) -> Self {
        let resources = Arc::new(ResourceManager::new(&clients));
        let validator = SchemaValidator::new(&clients);
        let calculator = DiffCalculator::new(&clients, resources.clone(), &options);
        let requirements = Arc::new(RequirementsProvider::new(clients.clone()));

        Self {
            clients,
            resources,
            validator,
            calculator,
            requirements,
            functions,
            renderer,
            options,
        }
    }

    /// Warm the caches: environment configs and XRD-declared CRD schemas
    pub async fn initialize(&self) -> Result<()> {
        self.requirements.initialize().await?;
        let xrds = self.clients.definition.xrds().await?;
        self.clients.schema.load_crds_from_xrds(&xrds).await
    }

    /// The requirements cache, for explicit clearing
    pub fn requirements(&self) -> &RequirementsProvider {
        &self.requirements
    }

    /// Diff one XR or Claim against the cluster
    pub async fn diff_single_resource(
        &self,
        input: &JsonValue,
        provider: &dyn CompositionProvider,
    ) -> Result<DiffMap> {
        let (diffs, _rendered) = self.diff_internal(input, provider, None, true, 0).await?;
        Ok(diffs)
    }

    /// Diff a batch; per-resource errors are collected, not fatal
    pub async fn perform_diff(
        &self,
        inputs: &[JsonValue],
        provider: &dyn CompositionProvider,
    ) -> (DiffMap, Option<DiffError>) {
        let mut all = DiffMap::new();
        let mut errors = Vec::new();
        for input in inputs {
            match self.diff_single_resource(input, provider).await {
                Ok(diffs) => all.extend(diffs),
                Err(e) => {
                    warn!(resource = %resource::display_id(input), error = %e, "diff failed");
                    errors.push(e);
                }
            }
        }
        (all, DiffError::aggregate(errors))
    }

    fn diff_internal<'a>(
        &'a self,
        input: &'a JsonValue,
        provider: &'a dyn CompositionProvider,
        parent: Option<&'a JsonValue>,
        detect_removals: bool,
        depth: usize,
    ) -> BoxFuture<'a, Result<(DiffMap, BTreeSet<String>)>> {
        Box::pin(async move {
            if depth > self.options.max_nested_depth {
                return Err(DiffError::LimitExceeded(format!(
                    "nested composite depth exceeds {}",
                    self.options.max_nested_depth
                )));
            }

            let mut xr = input.clone();
            debug!(
                resource = %resource::display_id(&xr),
                depth,
                parent = ?parent.map(resource::display_id),
                "diffing composite"
            );

            let composition = provider.composition_for(&xr).await?;
            let functions = self.functions.functions_for(&composition).await?;

            let gvk = resource::gvk(&xr);
            let is_claim_kind = self.clients.definition.is_claim_resource(&xr).await?;
            let mut xr_schema: Option<JsonValue> = None;
            match self.lookup_xrd(&gvk, is_claim_kind).await {
                Ok(xrd) => {
                    xr_schema = self.schema_for_kind(&xrd, &gvk, is_claim_kind).await;
                    if let Some(schema) = &xr_schema {
                        xpdiff_core::apply_schema_defaults(&mut xr, schema);
                    }
                }
                Err(e) if e.is_not_found() => debug!(%gvk, "no XRD registered, skipping defaults"),
                Err(e) => return Err(e),
            }

            let (current_xr, _) = self.resources.fetch_current_object(None, &xr).await?;
            if let Some(current) = &current_xr {
                graft_identity(&mut xr, current);
            }

            // Claim resolution: a Claim never renders directly. Its
            // backing XR is fetched, the Claim's spec merged in (Claim
            // wins), and the merged XR rendered. The top-level diff keeps
            // Claim identity.
            let mut claim_mode = false;
            let mut xr_for_rendering = xr.clone();
            let mut observed: Option<Vec<JsonValue>> = None;
            let mut cluster_root = current_xr.clone();

            if let Some(current) = &current_xr
                && let Some(backing_ref) = object::get_path(current, &["spec", "resourceRef"])
                && let Some((ref_gvk, ref_name)) = backing_target(backing_ref)
            {
                claim_mode = true;
                match self.clients.resource.get(&ref_gvk, "", &ref_name).await {
                    Ok(backing) => {
                        observed = Some(self.resources.fetch_observed_resources(&backing).await);
                        let mut merged = backing.clone();
                        if let Some(claim_spec) = xr.get("spec") {
                            // Null handling follows the backing XR's
                            // schema: only nullable fields are deletable.
                            let spec_schema = self.spec_schema_for(&ref_gvk).await;
                            let mut spec =
                                merged.get("spec").cloned().unwrap_or_else(|| json!({}));
                            object::merge_override_with_schema(
                                &mut spec,
                                claim_spec,
                                spec_schema.as_ref(),
                            );
                            object::set_path(&mut merged, &["spec"], spec);
                        }
                        cluster_root = Some(backing);
                        xr_for_rendering = merged;
                    }
                    Err(e) if e.is_not_found() => {
                        info!(
                            claim = %resource::display_id(&xr),
                            backing = %ref_name,
                            "backing XR not reachable, rendering without observed state"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            let observed = match observed {
                Some(observed) => observed,
                None => self.resources.fetch_observed_resources(&xr_for_rendering).await,
            };

            let rendered = self
                .renderer
                .render_to_fixed_point(
                    &self.requirements,
                    &xr_for_rendering,
                    &composition,
                    &functions,
                    &observed,
                    self.options.max_render_iterations,
                )
                .await?;
            let mut composed = rendered.composed_resources.clone();

            // Every composed child carries the root composite's name.
            let root_name = resource::name(&xr_for_rendering).to_string();
            if !root_name.is_empty() {
                for child in &mut composed {
                    if resource::label(child, fields::COMPOSITE_LABEL).is_none() {
                        resource::set_label(child, fields::COMPOSITE_LABEL, &root_name);
                    }
                }
            }
            propagate_claim_labels(&xr_for_rendering, &mut composed);

            let diff_target = if claim_mode {
                xr.clone()
            } else {
                let mut target = rendered
                    .composite_resource
                    .clone()
                    .unwrap_or_else(|| xr.clone());
                let rendered_name = resource::name(&target).to_string();
                object::merge_override_with_schema(&mut target, &xr, xr_schema.as_ref());
                if resource::name(&xr).is_empty() && !rendered_name.is_empty() {
                    resource::set_name(&mut target, &rendered_name);
                }
                target
            };

            // The render pipeline propagates the XR's namespace to every
            // child; cluster-scoped kinds must not carry one.
            for child in &mut composed {
                let child_gvk = resource::gvk(child);
                if !resource::namespace(child).is_empty()
                    && !self.clients.resource.is_namespaced(&child_gvk).await?
                {
                    object::remove_path(child, &["metadata", "namespace"]);
                }
            }

            self.validator.ensure_composed_resource_crds(&composed).await?;
            self.validator
                .validate_resources(&diff_target, &composed, is_claim_kind)
                .await?;

            let mut result = self
                .calculator
                .calculate_non_removal_diffs(&xr_for_rendering, &diff_target, &composed)
                .await;

            // Nested composite recursion. Removal detection stays off for
            // non-root calls: composed children are owned by the root XR,
            // not by intermediate composites.
            for child in &composed {
                let child_gvk = resource::gvk(child);
                if !self.is_composite_kind(&child_gvk).await? {
                    continue;
                }
                let mut nested = child.clone();
                if let Some(existing) = self.find_existing_nested(&xr_for_rendering, &observed, child).await? {
                    preserve_nested_identity(&mut nested, &existing);
                }
                match self
                    .diff_internal(&nested, provider, Some(&xr_for_rendering), false, depth + 1)
                    .await
                {
                    Ok((nested_diffs, nested_keys)) => {
                        result.diffs.extend(nested_diffs);
                        result.rendered_keys.extend(nested_keys);
                    }
                    Err(e) if e.is_not_found() => {
                        info!(
                            nested = %resource::display_id(child),
                            "no composition found for nested composite, skipping descent"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }

            if !result.errors.is_empty() {
                return Err(DiffError::aggregate(std::mem::take(&mut result.errors))
                    .expect("non-empty error list aggregates"));
            }

            // Removal detection runs only at the top level, and only once
            // nested processing has filled the rendered-resource set; a
            // nested child would otherwise look absent and be flagged.
            if detect_removals && let Some(root) = &cluster_root {
                match self
                    .calculator
                    .calculate_removed_resource_diffs(root, &result.rendered_keys)
                    .await
                {
                    Ok(removed) => result.diffs.extend(removed),
                    Err(e) => {
                        debug!(error = %e, "removal detection unavailable, under-reporting")
                    }
                }
            }

            Ok((result.diffs, result.rendered_keys))
        })
    }

    async fn lookup_xrd(&self, gvk: &Gvk, is_claim: bool) -> Result<Xrd> {
        if is_claim {
            self.clients.definition.xrd_for_claim(gvk).await
        } else {
            self.clients.definition.xrd_for_xr(gvk).await
        }
    }

    /// The schema declared for an XR or claim kind
    ///
    /// Prefers the generated CRD's version schema, falling back to the
    /// XRD's embedded one. Drives both defaulting and null handling in
    /// merges.
    async fn schema_for_kind(&self, xrd: &Xrd, gvk: &Gvk, is_claim: bool) -> Option<JsonValue> {
        let crd_name = if is_claim {
            xrd.claim_crd_name()
        } else {
            Some(xrd.crd_name())
        };

        if let Some(name) = crd_name
            && let Ok(crd) = self.clients.schema.crd_by_name(&name).await
            && let Some(schema) = crd_version_schema(&crd, &gvk.version)
        {
            return Some(schema.clone());
        }
        xrd.schema_for(&gvk.version).cloned()
    }

    /// The spec subtree of a kind's CRD schema, when declared
    async fn spec_schema_for(&self, gvk: &Gvk) -> Option<JsonValue> {
        let crd = self.clients.schema.crd_for(gvk).await.ok()?;
        crd_version_schema(&crd, &gvk.version)?
            .get("properties")?
            .get("spec")
            .cloned()
    }

    async fn is_composite_kind(&self, gvk: &Gvk) -> Result<bool> {
        if self.clients.definition.xrd_for_xr(gvk).await.is_ok() {
            return Ok(true);
        }
        match self.clients.definition.xrd_for_claim(gvk).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Locate an existing instance of a nested composite
    ///
    /// First by slot annotation and kind among the observed resources,
    /// then through the label-scoped cluster lookup.
    async fn find_existing_nested(
        &self,
        parent: &JsonValue,
        observed: &[JsonValue],
        child: &JsonValue,
    ) -> Result<Option<JsonValue>> {
        let slot = resource::annotation(child, fields::COMPOSITION_RESOURCE_NAME_ANNOTATION);
        if let Some(slot) = slot {
            let found = observed.iter().find(|candidate| {
                resource::kind(candidate) == resource::kind(child)
                    && resource::annotation(
                        candidate,
                        fields::COMPOSITION_RESOURCE_NAME_ANNOTATION,
                    ) == Some(slot)
            });
            if let Some(found) = found {
                return Ok(Some(found.clone()));
            }
        }
        let (current, _) = self.resources.fetch_current_object(Some(parent), child).await?;
        Ok(current)
    }
}

/// Graft cluster identity onto the local XR so rendered children get
/// correct owner references
fn graft_identity(xr: &mut JsonValue, current: &JsonValue) {
    let uid = resource::uid(current);
    if !uid.is_empty() {
        object::set_path(xr, &["metadata", "uid"], json!(uid));
    }
    let resource_version = resource::resource_version(current);
    if !resource_version.is_empty() {
        object::set_path(xr, &["metadata", "resourceVersion"], json!(resource_version));
    }
}

/// The backing-XR reference a bound Claim carries
fn backing_target(backing_ref: &JsonValue) -> Option<(Gvk, String)> {
    let api_version = backing_ref.get("apiVersion")?.as_str()?;
    let kind = backing_ref.get("kind")?.as_str()?;
    let name = backing_ref.get("name")?.as_str()?;
    if name.is_empty() {
        return None;
    }
    Some((Gvk::from_api_version(api_version, kind), name.to_string()))
}

/// Claim-context label propagation for nested XRs
///
/// When an XR sits inside a Claim tree (it carries a claim-name label and
/// its composite label names a root other than itself), every composed
/// child takes the root composite label, the claim labels, and a
/// root-derived generateName.
fn propagate_claim_labels(xr: &JsonValue, composed: &mut [JsonValue]) {
    let Some(claim_name) = resource::label(xr, fields::CLAIM_NAME_LABEL) else {
        return;
    };
    let Some(root) = resource::label(xr, fields::COMPOSITE_LABEL) else {
        return;
    };
    if root == resource::name(xr) {
        return;
    }

    let claim_name = claim_name.to_string();
    let claim_namespace =
        resource::label(xr, fields::CLAIM_NAMESPACE_LABEL).map(str::to_string);
    let root = root.to_string();

    for child in composed {
        resource::set_label(child, fields::COMPOSITE_LABEL, &root);
        resource::set_label(child, fields::CLAIM_NAME_LABEL, &claim_name);
        if let Some(namespace) = &claim_namespace {
            resource::set_label(child, fields::CLAIM_NAMESPACE_LABEL, namespace);
        }
        if !resource::generate_name(child).is_empty() {
            resource::set_generate_name(child, &format!("{}-", root));
        }
    }
}

/// Copy cluster identity from an existing nested composite onto its
/// rendered counterpart
///
/// The local render pipeline performs no composition selection, so the
/// compositionRef travels along too.
fn preserve_nested_identity(nested: &mut JsonValue, existing: &JsonValue) {
    let name = resource::name(existing);
    if !name.is_empty() {
        resource::set_name(nested, name);
    }
    let generate_name = resource::generate_name(existing);
    if !generate_name.is_empty() {
        resource::set_generate_name(nested, generate_name);
    }
    let uid = resource::uid(existing);
    if !uid.is_empty() {
        object::set_path(nested, &["metadata", "uid"], json!(uid));
    }
    for label in [
        fields::COMPOSITE_LABEL,
        fields::CLAIM_NAME_LABEL,
        fields::CLAIM_NAMESPACE_LABEL,
    ] {
        if let Some(value) = resource::label(existing, label) {
            let value = value.to_string();
            resource::set_label(nested, label, &value);
        }
    }
    for path in [
        ["spec", "compositionRef"].as_slice(),
        ["spec", "crossplane", "compositionRef"].as_slice(),
    ] {
        if let Some(reference) = object::get_path(existing, path) {
            let reference = reference.clone();
            object::set_path(nested, path, reference);
        }
    }
}
