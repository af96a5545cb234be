//! Terminal output for resource-mode diffs

use xpdiff_engine::{DiffMap, render_diff_map, summarize};

/// Render the final report for a resource-mode run
pub fn format_report(diffs: &DiffMap, colorize: bool, compact: bool) -> String {
    let body = render_diff_map(diffs, colorize, compact);
    if body.is_empty() {
        return "No changes detected\n".to_string();
    }
    format!("{}Summary: {}\n", body, summarize(diffs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xpdiff_engine::ResourceDiff;

    #[test]
    fn test_no_changes() {
        assert_eq!(format_report(&DiffMap::new(), false, false), "No changes detected\n");
    }

    #[test]
    fn test_report_with_changes() {
        let mut diffs = DiffMap::new();
        let added = ResourceDiff::added(&json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "c"}
        }));
        diffs.insert(added.diff_key(), added);

        let report = format_report(&diffs, false, false);
        assert!(report.contains("+++ ConfigMap/c"));
        assert!(report.contains("Summary: 1 added"));
    }
}
