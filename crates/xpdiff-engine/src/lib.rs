//! xpdiff Engine - the Crossplane diff engine
//!
//! Given a candidate composite resource (or a changed composition) this
//! crate materializes the tree of downstream resources the cluster would
//! produce, reconciles it with what exists, and emits structured
//! per-resource diffs:
//! - **Render loop**: drives the external render pipeline to a fixed
//!   point, back-supplying required resources
//! - **Diff calculation**: server-side dry-run apply, generateName
//!   matching, removal detection
//! - **Recursion**: nested composites diff with preserved cluster identity
//! - **Composition mode**: fans the XR diff over every bound composite

pub mod calculator;
pub mod composition;
pub mod diff;
pub mod functions;
pub mod options;
pub mod processor;
pub mod render;
pub mod requirements;
pub mod resources;
pub mod validator;

pub use calculator::{DiffCalculator, XrDiffs};
pub use composition::{CompositionDiffProcessor, XrDiffResult};
pub use diff::{DiffLine, DiffMap, DiffType, LineType, ResourceDiff, render_diff_map, summarize};
pub use functions::{CachedFunctionProvider, FetchFunctionProvider, FunctionProvider, RuntimeCleaner};
pub use options::DiffOptions;
pub use processor::{
    CompositionProvider, FixedCompositionProvider, MatchingCompositionProvider, XrDiffProcessor,
};
pub use render::{
    RenderFn, RenderInputs, RenderOutcome, RenderOutputs, Renderer, ResourceSelector,
    StepRequirements,
};
pub use requirements::RequirementsProvider;
pub use resources::ResourceManager;
pub use validator::SchemaValidator;
