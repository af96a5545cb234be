//! Error types shared across the xpdiff crates

use thiserror::Error;

/// Result type for xpdiff operations
pub type Result<T> = std::result::Result<T, DiffError>;

/// Errors produced while computing a diff
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DiffError {
    /// A direct-name lookup returned empty and no fallback applied
    #[error("{resource} not found")]
    NotFound { resource: String },

    /// CRD not loadable, schema validation failed, or scope constraint violated
    #[error("schema error: {0}")]
    Schema(String),

    /// Render function failed with no requirements to retry with
    #[error("render error: {0}")]
    Render(String),

    /// Maximum nesting depth or maximum render iterations hit
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Context cancellation propagated from a client
    #[error("operation cancelled")]
    Cancelled,

    /// Convert/merge failure on unstructured content
    #[error("internal error: {0}")]
    Internal(String),

    /// Kubernetes API error that is not a 404
    #[error("Kubernetes API error: {0}")]
    Api(String),

    /// Several independent failures collected from a batch fan-out
    #[error("{} error(s): {}", .0.len(), format_aggregate(.0))]
    Aggregate(Vec<DiffError>),
}

fn format_aggregate(errors: &[DiffError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DiffError {
    /// Build a NotFound error for a resource described as "Kind/name"
    pub fn not_found(resource: impl Into<String>) -> Self {
        DiffError::NotFound {
            resource: resource.into(),
        }
    }

    /// Join a list of errors into a single error, if any
    ///
    /// A single error is returned as itself rather than wrapped.
    pub fn aggregate(mut errors: Vec<DiffError>) -> Option<DiffError> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(DiffError::Aggregate(errors)),
        }
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiffError::NotFound { .. })
    }

    /// Check if this is a schema validation error
    pub fn is_schema(&self) -> bool {
        matches!(self, DiffError::Schema(_))
    }

    /// Check if every error in the tree is a schema validation error
    ///
    /// Drives exit-code selection: a batch that failed purely on schema
    /// validation is distinguishable from one with tool errors.
    pub fn is_only_schema(&self) -> bool {
        match self {
            DiffError::Schema(_) => true,
            DiffError::Aggregate(children) => {
                !children.is_empty() && children.iter().all(|e| e.is_only_schema())
            }
            _ => false,
        }
    }
}

impl From<serde_json::Error> for DiffError {
    fn from(e: serde_json::Error) -> Self {
        DiffError::Internal(e.to_string())
    }
}

impl From<serde_yaml::Error> for DiffError {
    fn from(e: serde_yaml::Error) -> Self {
        DiffError::Internal(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_empty() {
        assert!(DiffError::aggregate(vec![]).is_none());
    }

    #[test]
    fn test_aggregate_single_unwrapped() {
        let err = DiffError::aggregate(vec![DiffError::Schema("bad".into())]).unwrap();
        assert!(matches!(err, DiffError::Schema(_)));
    }

    #[test]
    fn test_aggregate_multiple() {
        let err = DiffError::aggregate(vec![
            DiffError::Schema("a".into()),
            DiffError::Render("b".into()),
        ])
        .unwrap();
        assert!(matches!(err, DiffError::Aggregate(ref v) if v.len() == 2));
    }

    #[test]
    fn test_is_only_schema_pure() {
        let err = DiffError::Aggregate(vec![
            DiffError::Schema("a".into()),
            DiffError::Aggregate(vec![DiffError::Schema("b".into())]),
        ]);
        assert!(err.is_only_schema());
    }

    #[test]
    fn test_is_only_schema_mixed() {
        let err = DiffError::Aggregate(vec![
            DiffError::Schema("a".into()),
            DiffError::Render("b".into()),
        ]);
        assert!(!err.is_only_schema());
    }

    #[test]
    fn test_is_not_found() {
        assert!(DiffError::not_found("Bucket/my-bucket").is_not_found());
        assert!(!DiffError::Schema("x".into()).is_not_found());
    }
}
