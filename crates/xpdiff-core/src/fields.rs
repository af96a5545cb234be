//! Crossplane metadata constants

/// Label naming the root composite a composed resource belongs to
pub const COMPOSITE_LABEL: &str = "crossplane.io/composite";

/// Label naming the claim a composed resource descends from
pub const CLAIM_NAME_LABEL: &str = "crossplane.io/claim-name";

/// Label naming the claim's namespace
pub const CLAIM_NAMESPACE_LABEL: &str = "crossplane.io/claim-namespace";

/// Annotation identifying a rendered resource's template-local slot
///
/// This is the key used to match a rendered resource to an existing one
/// when names are server-generated.
pub const COMPOSITION_RESOURCE_NAME_ANNOTATION: &str = "crossplane.io/composition-resource-name";

/// Annotation carrying the container-runtime reuse key for a function
pub const RUNTIME_NAME_ANNOTATION: &str = "render.crossplane.io/runtime-docker-name";

/// Default prefix identifying composed-resource field managers
///
/// Configuration, not a constant: the exact prefix set is a Crossplane
/// versioning concern, so callers may override it in their options.
pub const DEFAULT_COMPOSED_MANAGER_PREFIX: &str = "apiextensions.crossplane.io/composed";

/// Default field manager for dry-run applies when no composed manager matches
pub const DEFAULT_FIELD_MANAGER: &str = "xpdiff";
