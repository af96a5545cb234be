//! xpdiff Kube - cluster access for the Crossplane diff tool
//!
//! This crate provides:
//! - **Client capabilities**: the abstract traits the diff engine consumes
//! - **Cluster implementations**: kube-backed clients with discovery and
//!   server-side dry-run apply
//! - **Resource trees**: the live child tree rooted at a composite
//! - **Mocks**: in-memory clients for tests

pub mod clients;
pub mod cluster;
pub mod mock;
pub mod tree;

pub use clients::{
    ApplyClient, Clients, CompositionClient, DefinitionClient, EnvironmentClient, FunctionClient,
    ResourceClient, ResourceTreeClient, SchemaClient,
};
pub use cluster::{ClusterClients, composition_ref_name};
pub use mock::MockClients;
pub use tree::ResourceNode;
