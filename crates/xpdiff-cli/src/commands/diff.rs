//! The diff command: resource mode and composition mode

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use xpdiff_core::resource;
use xpdiff_engine::{
    CachedFunctionProvider, CompositionDiffProcessor, DiffOptions, FetchFunctionProvider,
    MatchingCompositionProvider, Renderer, RuntimeCleaner, XrDiffProcessor,
};
use xpdiff_kube::{Clients, ClusterClients};

use crate::error::CliError;
use crate::exit_codes;
use crate::{display, loader, render_exec};

/// Arguments to the diff command
pub struct DiffArgs {
    pub files: Vec<PathBuf>,
    pub namespace: String,
    pub no_color: bool,
    pub compact: bool,
    pub include_manual: bool,
    pub max_depth: usize,
    pub render_command: String,
}

/// Removes function runtime containers recorded for reuse
struct DockerRuntimeCleaner;

#[async_trait]
impl RuntimeCleaner for DockerRuntimeCleaner {
    async fn remove_runtime(&self, name: &str) -> xpdiff_core::Result<()> {
        let status = tokio::process::Command::new("docker")
            .args(["rm", "-f", name])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .await
            .map_err(|e| xpdiff_core::DiffError::Internal(format!("cannot run docker: {}", e)))?;
        if status.success() {
            Ok(())
        } else {
            Err(xpdiff_core::DiffError::Internal(format!(
                "docker rm {} exited with {}",
                name, status
            )))
        }
    }
}

/// Run the diff and return the process exit code
pub async fn run(args: DiffArgs) -> Result<i32, CliError> {
    let docs = loader::load_files(&args.files)?;
    if docs.is_empty() {
        return Err(CliError::input("no resources found in input"));
    }

    let (compositions, resources): (Vec<JsonValue>, Vec<JsonValue>) = docs
        .into_iter()
        .partition(|doc| resource::kind(doc) == "Composition");

    let clients = ClusterClients::connect()
        .await
        .map_err(CliError::from)?
        .into_clients();
    let options = DiffOptions {
        colorize: !args.no_color,
        compact: args.compact,
        include_manual: args.include_manual,
        max_nested_depth: args.max_depth,
        ..Default::default()
    };

    let mut tool_error = false;
    let mut schema_error = false;
    let mut diffs_found = false;
    let mut record = |e: &xpdiff_core::DiffError| {
        if e.is_only_schema() {
            schema_error = true;
        } else {
            tool_error = true;
        }
    };

    if !resources.is_empty() {
        debug!(count = resources.len(), "diffing composite resources");
        let processor = XrDiffProcessor::new(
            clients.clone(),
            Arc::new(FetchFunctionProvider::new(clients.function.clone())),
            Renderer::new(render_exec::exec_render_fn(args.render_command.clone())),
            options.clone(),
        );
        processor.initialize().await?;

        let provider = MatchingCompositionProvider::new(clients.composition.clone());
        let (diffs, error) = processor.perform_diff(&resources, &provider).await;
        print!(
            "{}",
            display::format_report(&diffs, options.colorize, options.compact)
        );
        if diffs.values().any(|d| d.has_changes()) {
            diffs_found = true;
        }
        if let Some(e) = error {
            eprintln!("Error: {}", e);
            record(&e);
        }
    }

    if !compositions.is_empty() {
        debug!(count = compositions.len(), "diffing compositions");
        let changed =
            run_composition_mode(&clients, &compositions, &args, options.clone()).await;
        match changed {
            Ok(changed) => diffs_found |= changed,
            Err(e) => {
                eprintln!("Error: {}", e);
                record(&e);
            }
        }
    }

    Ok(if tool_error {
        exit_codes::TOOL_ERROR
    } else if schema_error {
        exit_codes::VALIDATION_ERROR
    } else if diffs_found {
        exit_codes::DIFFS_DETECTED
    } else {
        exit_codes::SUCCESS
    })
}

async fn run_composition_mode(
    clients: &Clients,
    compositions: &[JsonValue],
    args: &DiffArgs,
    options: DiffOptions,
) -> xpdiff_core::Result<bool> {
    // The same functions are re-invoked across many XRs: cache them,
    // annotate for container reuse, and tear the containers down after.
    let functions = Arc::new(
        CachedFunctionProvider::new(clients.function.clone())
            .with_cleaner(Arc::new(DockerRuntimeCleaner)),
    );

    // The external render shares one container runtime; serialize it.
    let renderer = Renderer::new(render_exec::exec_render_fn(args.render_command.clone()))
        .with_mutex(Arc::new(tokio::sync::Mutex::new(())));

    let processor = Arc::new(XrDiffProcessor::new(
        clients.clone(),
        functions.clone(),
        renderer,
        options.clone(),
    ));
    processor.initialize().await?;

    let composition_processor =
        CompositionDiffProcessor::new(processor, clients.composition.clone(), options);

    let mut stdout = std::io::stdout();
    let result = composition_processor
        .diff_composition(&mut stdout, compositions, &args.namespace)
        .await;

    functions.cleanup().await;
    if let Err(e) = &result {
        warn!(error = %e, "composition diff did not complete");
    }
    result
}
