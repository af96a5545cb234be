//! Exit codes for the xpdiff CLI
//!
//! The priority when several apply is tool > schema > diff: any error that
//! is not a schema-validation error wins over the schema code, which wins
//! over "diffs detected".

/// No diff, no error
pub const SUCCESS: i32 = 0;

/// Tool error - cluster access, rendering, or internal failure
pub const TOOL_ERROR: i32 = 1;

/// Schema validation error
pub const VALIDATION_ERROR: i32 = 2;

/// Diffs were detected
pub const DIFFS_DETECTED: i32 = 3;
