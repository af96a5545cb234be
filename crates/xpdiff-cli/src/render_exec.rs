//! Render adapter over an external `crossplane render`-compatible command
//!
//! The render pipeline spawns function containers and is driven out of
//! process. This adapter writes the inputs to temp files, invokes the
//! command, and parses the YAML stream it emits. The external pipeline
//! resolves its own requirements, so the adapter reports none and the
//! engine's fixed-point loop settles after one iteration.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::debug;

use xpdiff_core::{DiffError, Result, resource};
use xpdiff_engine::{RenderFn, RenderInputs, RenderOutcome, RenderOutputs, StepRequirements};

/// Build a RenderFn invoking the given external command
pub fn exec_render_fn(command: String) -> RenderFn {
    Arc::new(move |inputs: RenderInputs| {
        let command = command.clone();
        Box::pin(async move { run_render(&command, inputs).await })
    })
}

async fn run_render(command: &str, inputs: RenderInputs) -> Result<RenderOutcome> {
    let dir = tempfile::tempdir()
        .map_err(|e| DiffError::Internal(format!("cannot create temp dir: {}", e)))?;

    let xr_path = write_yaml(dir.path(), "xr.yaml", std::slice::from_ref(&inputs.xr))?;
    let composition_value = inputs
        .composition
        .raw
        .clone()
        .ok_or_else(|| DiffError::Internal("composition has no raw form to render with".into()))?;
    let composition_path = write_yaml(dir.path(), "composition.yaml", &[composition_value])?;
    let functions_path = write_yaml(dir.path(), "functions.yaml", &inputs.functions)?;

    let mut cmd = tokio::process::Command::new(command);
    cmd.arg("render")
        .arg(&xr_path)
        .arg(&composition_path)
        .arg(&functions_path)
        .arg("--include-full-xr")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if !inputs.observed_resources.is_empty() {
        let observed = write_yaml(dir.path(), "observed.yaml", &inputs.observed_resources)?;
        cmd.arg("--observed-resources").arg(observed);
    }
    if !inputs.required_resources.is_empty() {
        let extra = write_yaml(dir.path(), "extra.yaml", &inputs.required_resources)?;
        cmd.arg("--extra-resources").arg(extra);
    }

    debug!(command, "invoking external render");
    let output = cmd
        .output()
        .await
        .map_err(|e| DiffError::Render(format!("cannot run {}: {}", command, e)))?;

    if !output.status.success() {
        return Err(DiffError::Render(format!(
            "{} render failed: {}",
            command,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_render_output(&stdout, &inputs.xr)
}

fn write_yaml(dir: &Path, name: &str, docs: &[JsonValue]) -> Result<PathBuf> {
    let mut content = String::new();
    for (index, doc) in docs.iter().enumerate() {
        if index > 0 {
            content.push_str("---\n");
        }
        content.push_str(&serde_yaml::to_string(doc)?);
    }
    let path = dir.join(name);
    std::fs::write(&path, content)
        .map_err(|e| DiffError::Internal(format!("cannot write {}: {}", name, e)))?;
    Ok(path)
}

/// Split the rendered stream into the composite and its composed resources
///
/// The document matching the input XR's apiVersion and kind is the
/// post-render composite; everything else is composed.
fn parse_render_output(stdout: &str, xr: &JsonValue) -> Result<RenderOutcome> {
    let xr_gvk = resource::gvk(xr);
    let mut composite = None;
    let mut composed = Vec::new();

    for deserializer in serde_yaml::Deserializer::from_str(stdout) {
        let value = JsonValue::deserialize(deserializer)
            .map_err(|e| DiffError::Render(format!("unparsable render output: {}", e)))?;
        if !value.is_object() {
            continue;
        }
        if composite.is_none() && resource::gvk(&value) == xr_gvk {
            composite = Some(value);
        } else {
            composed.push(value);
        }
    }

    Ok(RenderOutcome::Done(RenderOutputs {
        composite_resource: composite,
        composed_resources: composed,
        requirements: StepRequirements::new(),
    }))
}
