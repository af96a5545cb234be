//! xpdiff CLI - preview the cluster-side effect of Crossplane manifests

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod display;
mod error;
mod exit_codes;
mod loader;
mod render_exec;

#[derive(Parser)]
#[command(name = "xpdiff")]
#[command(version)]
#[command(about = "Show what would change if Crossplane manifests were applied", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff composite resources, claims, or compositions against the cluster
    Diff {
        /// Manifest files ("-" reads stdin)
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Namespace to search for affected composites (empty: all)
        #[arg(short, long, default_value = "")]
        namespace: String,

        /// Disable colored output
        #[arg(long)]
        no_color: bool,

        /// Hide unchanged context lines beyond a small window
        #[arg(long)]
        compact: bool,

        /// Include XRs with a Manual composition update policy
        #[arg(long)]
        include_manual: bool,

        /// Maximum nested composite depth
        #[arg(long, default_value_t = 10)]
        max_depth: usize,

        /// External render command (crossplane render compatible)
        #[arg(long, default_value = "crossplane")]
        render_command: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Diff {
            files,
            namespace,
            no_color,
            compact,
            include_manual,
            max_depth,
            render_command,
        } => {
            commands::diff::run(commands::diff::DiffArgs {
                files,
                namespace,
                no_color,
                compact,
                include_manual,
                max_depth,
                render_command,
            })
            .await
        }
    };

    match result {
        Ok(code) => ExitCode::from(code as u8),
        Err(e) => {
            let code = e.exit_code();
            eprintln!("{:?}", miette::Report::new(e));
            ExitCode::from(code as u8)
        }
    }
}
