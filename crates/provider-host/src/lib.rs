//! Capability provider host.
//!
//! Spawns the configured subprocess providers, speaks newline-delimited
//! JSON-RPC 2.0 over their stdio, and aggregates their advertised tools
//! into a single canonical namespace.

pub mod manager;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use manager::{ProviderManager, ProviderState};
pub use registry::{similarity, ToolRegistry};
