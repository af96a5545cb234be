//! Structured resource diffs
//!
//! A `ResourceDiff` captures one resource's expected change: its type
//! (Added/Removed/Modified/Equal), the current and post-merge shapes, and
//! line-level diffs computed over normalized YAML. Rendering to text lives
//! here too so the composition driver and the CLI share one formatter.

use std::collections::BTreeMap;

use console::Style;
use serde_json::Value as JsonValue;
use similar::{ChangeTag, TextDiff};

use xpdiff_core::{Gvk, object, resource};

/// Context lines kept around changes in compact rendering
const COMPACT_CONTEXT: usize = 3;

/// Type of resource change
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DiffType {
    /// Resource would be created
    Added,
    /// Resource exists but would no longer be produced
    Removed,
    /// Resource would change
    Modified,
    /// Post-merge shape equals the current one
    Equal,
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiffType::Added => write!(f, "Added"),
            DiffType::Removed => write!(f, "Removed"),
            DiffType::Modified => write!(f, "Modified"),
            DiffType::Equal => write!(f, "Equal"),
        }
    }
}

/// Type of diff line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineType {
    Added,
    Removed,
    Context,
}

/// A single line in a diff
#[derive(Debug, Clone)]
pub struct DiffLine {
    pub line_type: LineType,
    pub content: String,
    pub old_line_no: Option<usize>,
    pub new_line_no: Option<usize>,
}

/// The expected change to a single resource
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    pub gvk: Gvk,
    pub resource_name: String,
    pub diff_type: DiffType,
    pub line_diffs: Vec<DiffLine>,
    pub current: Option<JsonValue>,
    pub desired: Option<JsonValue>,
}

/// Diffs keyed by "<apiVersion>/<kind>/<name>"
///
/// A BTreeMap so iteration (and therefore output) is deterministic.
pub type DiffMap = BTreeMap<String, ResourceDiff>;

impl ResourceDiff {
    /// Canonical diff key for this resource
    pub fn diff_key(&self) -> String {
        resource::diff_key_for(&self.gvk.api_version(), &self.gvk.kind, &self.resource_name)
    }

    /// "Kind/name" for headers and logs
    pub fn display_name(&self) -> String {
        format!("{}/{}", self.gvk.kind, self.resource_name)
    }

    /// True unless the resource is unchanged
    pub fn has_changes(&self) -> bool {
        self.diff_type != DiffType::Equal
    }

    /// A diff for a resource that does not exist yet
    pub fn added(desired: &JsonValue) -> Self {
        let lines = to_yaml_lines(desired)
            .into_iter()
            .enumerate()
            .map(|(i, content)| DiffLine {
                line_type: LineType::Added,
                content,
                old_line_no: None,
                new_line_no: Some(i),
            })
            .collect();
        Self {
            gvk: resource::gvk(desired),
            resource_name: resource::effective_name(desired),
            diff_type: DiffType::Added,
            line_diffs: lines,
            current: None,
            desired: Some(desired.clone()),
        }
    }

    /// A diff for a resource that would no longer be produced
    pub fn removed(current: &JsonValue) -> Self {
        let lines = to_yaml_lines(current)
            .into_iter()
            .enumerate()
            .map(|(i, content)| DiffLine {
                line_type: LineType::Removed,
                content,
                old_line_no: Some(i),
                new_line_no: None,
            })
            .collect();
        Self {
            gvk: resource::gvk(current),
            resource_name: resource::effective_name(current),
            diff_type: DiffType::Removed,
            line_diffs: lines,
            current: Some(current.clone()),
            desired: None,
        }
    }

    /// Compare a current object with its post-merge shape
    ///
    /// Equal when the two compare identical after normalization (server
    /// metadata and status stripped), Modified otherwise.
    pub fn from_pair(current: &JsonValue, would_be: &JsonValue) -> Self {
        let current_norm = object::normalize_for_compare(current);
        let would_be_norm = object::normalize_for_compare(would_be);

        if current_norm == would_be_norm {
            return Self {
                gvk: resource::gvk(current),
                resource_name: resource::effective_name(current),
                diff_type: DiffType::Equal,
                line_diffs: Vec::new(),
                current: Some(current.clone()),
                desired: Some(would_be.clone()),
            };
        }

        let old_text = to_yaml(&current_norm);
        let new_text = to_yaml(&would_be_norm);
        let text_diff = TextDiff::from_lines(&old_text, &new_text);
        let mut lines = Vec::new();
        for change in text_diff.iter_all_changes() {
            let line_type = match change.tag() {
                ChangeTag::Delete => LineType::Removed,
                ChangeTag::Insert => LineType::Added,
                ChangeTag::Equal => LineType::Context,
            };
            lines.push(DiffLine {
                line_type,
                content: change.value().trim_end().to_string(),
                old_line_no: change.old_index(),
                new_line_no: change.new_index(),
            });
        }

        Self {
            gvk: resource::gvk(would_be),
            resource_name: resource::effective_name(would_be),
            diff_type: DiffType::Modified,
            line_diffs: lines,
            current: Some(current.clone()),
            desired: Some(would_be.clone()),
        }
    }
}

fn to_yaml(value: &JsonValue) -> String {
    serde_yaml::to_string(value).unwrap_or_default()
}

fn to_yaml_lines(value: &JsonValue) -> Vec<String> {
    to_yaml(&object::normalize_for_compare(value))
        .lines()
        .map(str::to_string)
        .collect()
}

/// Render one diff as unified text
pub fn render_diff(diff: &ResourceDiff, colorize: bool, compact: bool) -> String {
    let symbol = match diff.diff_type {
        DiffType::Added => "+++",
        DiffType::Removed => "---",
        DiffType::Modified => "~~~",
        DiffType::Equal => "===",
    };

    let header = format!("{} {}", symbol, diff.display_name());
    let mut out = String::new();
    if colorize {
        let style = match diff.diff_type {
            DiffType::Added => Style::new().green().bold(),
            DiffType::Removed => Style::new().red().bold(),
            DiffType::Modified => Style::new().yellow().bold(),
            DiffType::Equal => Style::new().dim(),
        };
        out.push_str(&format!("{}\n", style.apply_to(header)));
    } else {
        out.push_str(&header);
        out.push('\n');
    }

    let keep = visible_lines(&diff.line_diffs, compact);
    let mut last_shown: Option<usize> = None;
    for (i, line) in diff.line_diffs.iter().enumerate() {
        if !keep[i] {
            continue;
        }
        if let Some(last) = last_shown
            && i > last + 1
        {
            out.push_str("...\n");
        }
        last_shown = Some(i);

        let prefix = match line.line_type {
            LineType::Added => "+",
            LineType::Removed => "-",
            LineType::Context => " ",
        };
        if colorize {
            let style = match line.line_type {
                LineType::Added => Style::new().green(),
                LineType::Removed => Style::new().red(),
                LineType::Context => Style::new().dim(),
            };
            out.push_str(&format!("{}{}\n", prefix, style.apply_to(&line.content)));
        } else {
            out.push_str(&format!("{}{}\n", prefix, line.content));
        }
    }
    out
}

/// Which lines survive compact rendering: changes plus a small window
fn visible_lines(lines: &[DiffLine], compact: bool) -> Vec<bool> {
    if !compact {
        return vec![true; lines.len()];
    }
    let mut keep = vec![false; lines.len()];
    for (i, line) in lines.iter().enumerate() {
        if line.line_type == LineType::Context {
            continue;
        }
        let lo = i.saturating_sub(COMPACT_CONTEXT);
        let hi = (i + COMPACT_CONTEXT).min(lines.len().saturating_sub(1));
        for flag in keep.iter_mut().take(hi + 1).skip(lo) {
            *flag = true;
        }
    }
    keep
}

/// Render every changed diff in key order, separated by blank lines
pub fn render_diff_map(diffs: &DiffMap, colorize: bool, compact: bool) -> String {
    let mut out = String::new();
    for diff in diffs.values().filter(|d| d.has_changes()) {
        out.push_str(&render_diff(diff, colorize, compact));
        out.push('\n');
    }
    out
}

/// Human-readable change counts: "2 added, 1 modified, 1 removed"
pub fn summarize(diffs: &DiffMap) -> String {
    let count = |t: DiffType| diffs.values().filter(|d| d.diff_type == t).count();
    let mut parts = Vec::new();
    for (diff_type, label) in [
        (DiffType::Added, "added"),
        (DiffType::Modified, "modified"),
        (DiffType::Removed, "removed"),
    ] {
        let n = count(diff_type);
        if n > 0 {
            parts.push(format!("{} {}", n, label));
        }
    }
    if parts.is_empty() {
        "No changes".to_string()
    } else {
        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn bucket(size: &str) -> JsonValue {
        json!({
            "apiVersion": "s3.example.org/v1",
            "kind": "Bucket",
            "metadata": {"name": "b-1"},
            "spec": {"size": size}
        })
    }

    #[test]
    fn test_added_diff() {
        let diff = ResourceDiff::added(&bucket("small"));
        assert_eq!(diff.diff_type, DiffType::Added);
        assert_eq!(diff.resource_name, "b-1");
        assert!(diff.current.is_none());
        assert!(diff.line_diffs.iter().all(|l| l.line_type == LineType::Added));
        assert_eq!(diff.diff_key(), "s3.example.org/v1/Bucket/b-1");
    }

    #[test]
    fn test_removed_diff() {
        let diff = ResourceDiff::removed(&bucket("small"));
        assert_eq!(diff.diff_type, DiffType::Removed);
        assert!(diff.desired.is_none());
        assert!(diff
            .line_diffs
            .iter()
            .all(|l| l.line_type == LineType::Removed));
    }

    #[test]
    fn test_from_pair_equal_ignores_server_metadata() {
        let mut current = bucket("small");
        object::set_path(&mut current, &["metadata", "uid"], json!("u-1"));
        object::set_path(&mut current, &["metadata", "resourceVersion"], json!("7"));
        object::set_path(&mut current, &["status", "ready"], json!(true));

        let diff = ResourceDiff::from_pair(&current, &bucket("small"));
        assert_eq!(diff.diff_type, DiffType::Equal);
        assert!(diff.line_diffs.is_empty());
    }

    #[test]
    fn test_from_pair_modified() {
        let diff = ResourceDiff::from_pair(&bucket("small"), &bucket("large"));
        assert_eq!(diff.diff_type, DiffType::Modified);
        assert!(diff
            .line_diffs
            .iter()
            .any(|l| l.line_type == LineType::Removed && l.content.contains("small")));
        assert!(diff
            .line_diffs
            .iter()
            .any(|l| l.line_type == LineType::Added && l.content.contains("large")));
    }

    #[test]
    fn test_render_plain() {
        let diff = ResourceDiff::from_pair(&bucket("small"), &bucket("large"));
        let text = render_diff(&diff, false, false);
        assert!(text.starts_with("~~~ Bucket/b-1\n"));
        assert!(text.contains("-  size: small"));
        assert!(text.contains("+  size: large"));
    }

    #[test]
    fn test_render_map_filters_equal() {
        let mut map = DiffMap::new();
        let equal = ResourceDiff::from_pair(&bucket("small"), &bucket("small"));
        map.insert(equal.diff_key(), equal);
        assert!(render_diff_map(&map, false, false).is_empty());
    }

    #[test]
    fn test_summarize() {
        let mut map = DiffMap::new();
        let added = ResourceDiff::added(&bucket("small"));
        map.insert(added.diff_key(), added);
        let removed = ResourceDiff::removed(&json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "c"}
        }));
        map.insert(removed.diff_key(), removed);
        let summary = summarize(&map);
        assert!(summary.contains("1 added"));
        assert!(summary.contains("1 removed"));
        assert!(!summary.contains("modified"));
    }

    #[test]
    fn test_summarize_empty() {
        assert_eq!(summarize(&DiffMap::new()), "No changes");
    }

    #[test]
    fn test_compact_rendering_elides_context() {
        let mut current = bucket("small");
        let mut desired = bucket("small");
        for i in 0..20 {
            let key = format!("k{:02}", i);
            object::set_path(&mut current, &["spec", &key], json!("same"));
            object::set_path(&mut desired, &["spec", &key], json!("same"));
        }
        object::set_path(&mut desired, &["spec", "size"], json!("large"));

        let diff = ResourceDiff::from_pair(&current, &desired);
        let full = render_diff(&diff, false, false);
        let compact = render_diff(&diff, false, true);
        assert!(compact.len() < full.len());
        assert!(compact.contains("+  size: large"));
    }
}
