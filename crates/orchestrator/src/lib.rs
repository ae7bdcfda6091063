//! Tandem orchestrator: the staged workflow engine, its executor, the
//! streaming coordination layer, and the thin HTTP surface.

pub mod api;
pub mod approval;
pub mod bootstrap;
pub mod coordinator;
pub mod dev;
pub mod executor;
pub mod llm_http;
pub mod sessions;
pub mod speech;
pub mod stages;
pub mod state;

#[cfg(test)]
mod testutil;
