//! Engine configuration

use xpdiff_core::fields;

/// Options for a diff run
#[derive(Debug, Clone)]
pub struct DiffOptions {
    /// Apply ANSI colors to rendered diffs
    pub colorize: bool,
    /// Hide unchanged context lines beyond a small window
    pub compact: bool,
    /// Include XRs with a Manual composition update policy
    pub include_manual: bool,
    /// Maximum depth for nested composite recursion
    pub max_nested_depth: usize,
    /// Hard cap on render fixed-point iterations
    pub max_render_iterations: usize,
    /// Prefix identifying composed-resource field managers in managedFields
    pub composed_manager_prefix: String,
    /// Field manager used when no composed manager matches
    pub default_field_manager: String,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self {
            colorize: true,
            compact: false,
            include_manual: false,
            max_nested_depth: 10,
            max_render_iterations: 10,
            composed_manager_prefix: fields::DEFAULT_COMPOSED_MANAGER_PREFIX.to_string(),
            default_field_manager: fields::DEFAULT_FIELD_MANAGER.to_string(),
        }
    }
}
