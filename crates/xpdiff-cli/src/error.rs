//! CLI error types with exit code handling

use miette::Diagnostic;
use thiserror::Error;

use xpdiff_core::DiffError;

use crate::exit_codes;

/// CLI-facing error type carrying an exit code
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// Schema validation failed
    #[error("validation failed: {message}")]
    #[diagnostic(code(xpdiff::cli::validation))]
    Validation { message: String },

    /// Input files could not be loaded or parsed
    #[error("cannot load input: {message}")]
    #[diagnostic(code(xpdiff::cli::input))]
    Input { message: String },

    /// Anything else: cluster access, rendering, internal failures
    #[error("{message}")]
    #[diagnostic(code(xpdiff::cli::error))]
    Tool { message: String },
}

impl CliError {
    /// The exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation { .. } => exit_codes::VALIDATION_ERROR,
            CliError::Input { .. } => exit_codes::TOOL_ERROR,
            CliError::Tool { .. } => exit_codes::TOOL_ERROR,
        }
    }

    pub fn input(message: impl Into<String>) -> Self {
        Self::Input {
            message: message.into(),
        }
    }
}

impl From<DiffError> for CliError {
    fn from(e: DiffError) -> Self {
        if e.is_only_schema() {
            CliError::Validation {
                message: e.to_string(),
            }
        } else {
            CliError::Tool {
                message: e.to_string(),
            }
        }
    }
}
