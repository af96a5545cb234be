//! xpdiff Core - shared types for the Crossplane diff tool
//!
//! This crate provides the foundational pieces used throughout xpdiff:
//! - Unstructured-object helpers over `serde_json::Value` (paths, merge,
//!   normalization)
//! - `Gvk` and canonical resource/diff keys
//! - Crossplane metadata constants (composite label, slot annotation)
//! - Typed views over Compositions and XRDs
//! - The shared `DiffError` kinds

pub mod composition;
pub mod error;
pub mod fields;
pub mod gvk;
pub mod object;
pub mod resource;
pub mod xrd;

pub use composition::{Composition, CompositionSpec, FunctionRef, PipelineStep, TypeRef};
pub use error::{DiffError, Result};
pub use gvk::Gvk;
pub use xrd::{Xrd, XrdNames, XrdSpec, XrdVersion, apply_schema_defaults, crd_version_schema};
