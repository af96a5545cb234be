//! Composition-change mode
//!
//! Given a new composition body: diff the composition object itself, find
//! every cluster XR bound to it, filter by update policy, fan the XR diff
//! over the survivors, and write the aggregate report.

use std::io::Write;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use xpdiff_core::{Composition, DiffError, Result, object, resource};
use xpdiff_kube::CompositionClient;

use crate::diff::{DiffMap, ResourceDiff, render_diff, render_diff_map};
use crate::options::DiffOptions;
use crate::processor::{FixedCompositionProvider, XrDiffProcessor};

/// Outcome of diffing one XR bound to a changed composition
#[derive(Debug)]
pub struct XrDiffResult {
    pub display: String,
    pub namespace: String,
    pub diffs: DiffMap,
    pub error: Option<DiffError>,
}

impl XrDiffResult {
    fn has_changes(&self) -> bool {
        self.diffs.values().any(|d| d.has_changes())
    }
}

/// Drives composition-change diffs and writes the report
pub struct CompositionDiffProcessor {
    processor: Arc<XrDiffProcessor>,
    composition_client: Arc<dyn CompositionClient>,
    options: DiffOptions,
}

impl CompositionDiffProcessor {
    pub fn new(
        processor: Arc<XrDiffProcessor>,
        composition_client: Arc<dyn CompositionClient>,
        options: DiffOptions,
    ) -> Self {
        Self {
            processor,
            composition_client,
            options,
        }
    }

    /// Diff every input composition and write the aggregate report
    ///
    /// Entries whose kind is not Composition are skipped silently (the
    /// loader may hand over mixed documents). One composition's failure
    /// does not stop the others; only all of them failing is fatal.
    /// Returns whether any diff was detected.
    pub async fn diff_composition<W: Write>(
        &self,
        writer: &mut W,
        compositions: &[JsonValue],
        namespace: &str,
    ) -> Result<bool> {
        let inputs: Vec<&JsonValue> = compositions
            .iter()
            .filter(|c| resource::kind(c) == "Composition")
            .collect();
        if inputs.is_empty() {
            return Err(DiffError::Internal("no compositions provided".into()));
        }

        let mut failed = 0;
        let mut any_changes = false;
        for (index, input) in inputs.iter().enumerate() {
            if index > 0 {
                write_out(writer, &format!("\n{}\n\n", "=".repeat(80)))?;
            }
            match self.diff_one(writer, input, namespace).await {
                Ok(changed) => any_changes |= changed,
                Err(e) => {
                    warn!(
                        composition = resource::name(input),
                        error = %e,
                        "composition diff failed"
                    );
                    failed += 1;
                }
            }
        }

        if failed == inputs.len() {
            return Err(DiffError::Internal(
                "failed to process all compositions".into(),
            ));
        }
        if failed > 0 {
            warn!(failed, total = inputs.len(), "some compositions failed");
        }
        Ok(any_changes)
    }

    async fn diff_one<W: Write>(
        &self,
        writer: &mut W,
        input: &JsonValue,
        namespace: &str,
    ) -> Result<bool> {
        let new_composition = Composition::from_value(input)?;

        write_out(writer, "=== Composition Changes ===\n\n")?;
        let composition_diff = self.composition_self_diff(input, &new_composition.name).await?;
        let mut changed = composition_diff.has_changes();
        if composition_diff.has_changes() {
            write_out(
                writer,
                &render_diff(&composition_diff, self.options.colorize, self.options.compact),
            )?;
            write_out(writer, "\n")?;
        } else {
            write_out(
                writer,
                &format!(
                    "No changes detected in composition {}\n\n",
                    new_composition.name
                ),
            )?;
        }

        // A failed binding lookup means a net-new composition: it
        // legitimately has no bound XRs yet.
        let bound = match self
            .composition_client
            .find_composites_using_composition(&new_composition.name, namespace)
            .await
        {
            Ok(bound) => bound,
            Err(e) => {
                debug!(error = %e, "no binding lookup, treating composition as net-new");
                Vec::new()
            }
        };

        let (survivors, excluded): (Vec<&JsonValue>, Vec<&JsonValue>) = bound
            .iter()
            .partition(|xr| self.options.include_manual || update_policy(xr) != "Manual");

        for xr in &excluded {
            write_out(
                writer,
                &format!(
                    "Skipping {}: composition update policy is Manual\n",
                    resource::display_id(xr)
                ),
            )?;
        }
        if !excluded.is_empty() {
            write_out(writer, "\n")?;
        }

        if survivors.is_empty() {
            write_out(
                writer,
                &format!(
                    "No composite resources to evaluate for composition {}\n\n",
                    new_composition.name
                ),
            )?;
            return Ok(changed);
        }

        let provider = FixedCompositionProvider(new_composition.clone());
        let mut results = Vec::with_capacity(survivors.len());
        for xr in survivors {
            let result = match self.processor.diff_single_resource(xr, &provider).await {
                Ok(diffs) => XrDiffResult {
                    display: resource::display_id(xr),
                    namespace: resource::namespace(xr).to_string(),
                    diffs,
                    error: None,
                },
                Err(e) => XrDiffResult {
                    display: resource::display_id(xr),
                    namespace: resource::namespace(xr).to_string(),
                    diffs: DiffMap::new(),
                    error: Some(e),
                },
            };
            results.push(result);
        }

        write_out(writer, "=== Affected Composite Resources ===\n\n")?;
        for result in &results {
            let symbol = match (&result.error, result.has_changes()) {
                (Some(_), _) => "✗",
                (None, true) => "⚠",
                (None, false) => "✓",
            };
            let scope = if result.namespace.is_empty() {
                "cluster-scoped".to_string()
            } else {
                format!("namespace: {}", result.namespace)
            };
            write_out(
                writer,
                &format!("  {} {} ({})\n", symbol, result.display, scope),
            )?;
        }

        let changed_count = results
            .iter()
            .filter(|r| r.error.is_none() && r.has_changes())
            .count();
        let unchanged = results
            .iter()
            .filter(|r| r.error.is_none() && !r.has_changes())
            .count();
        let errored = results.iter().filter(|r| r.error.is_some()).count();

        let mut parts = Vec::new();
        if changed_count > 0 {
            parts.push(format!(
                "{} {} with changes",
                changed_count,
                plural(changed_count)
            ));
        }
        if unchanged > 0 {
            parts.push(format!("{} {} unchanged", unchanged, plural(unchanged)));
        }
        if errored > 0 {
            parts.push(format!("{} {} with errors", errored, plural(errored)));
        }
        write_out(writer, &format!("\nSummary: {}\n", parts.join(", ")))?;

        write_out(writer, "\n=== Impact Analysis ===\n\n")?;
        let mut impact = String::new();
        for result in &results {
            impact.push_str(&render_diff_map(
                &result.diffs,
                self.options.colorize,
                self.options.compact,
            ));
        }
        if impact.is_empty() {
            write_out(
                writer,
                "All composite resources are up-to-date. No downstream resource changes detected.\n\n",
            )?;
        } else {
            write_out(writer, &impact)?;
        }

        changed |= results.iter().any(XrDiffResult::has_changes);
        Ok(changed)
    }

    /// Diff the composition object against its cluster counterpart
    ///
    /// Server-side metadata is stripped from both before comparison.
    async fn composition_self_diff(
        &self,
        input: &JsonValue,
        name: &str,
    ) -> Result<ResourceDiff> {
        let mut stripped = input.clone();
        object::strip_server_managed(&mut stripped);

        let current = match self.composition_client.get_composition(name).await {
            Ok(current) => current.raw,
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        Ok(match current {
            Some(raw) => {
                let mut current = raw;
                object::strip_server_managed(&mut current);
                ResourceDiff::from_pair(&current, &stripped)
            }
            None => ResourceDiff::added(&stripped),
        })
    }
}

/// The effective composition update policy of an XR
///
/// v2 path wins over v1; absent means Automatic.
fn update_policy(xr: &JsonValue) -> &str {
    object::get_string(xr, &["spec", "crossplane", "compositionUpdatePolicy"])
        .or_else(|| object::get_string(xr, &["spec", "compositionUpdatePolicy"]))
        .filter(|p| !p.is_empty())
        .unwrap_or("Automatic")
}

fn plural(n: usize) -> &'static str {
    if n == 1 { "resource" } else { "resources" }
}

fn write_out<W: Write>(writer: &mut W, text: &str) -> Result<()> {
    writer
        .write_all(text.as_bytes())
        .map_err(|e| DiffError::Internal(format!("cannot write output: {}", e)))
}
