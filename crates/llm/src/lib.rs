//! Rate-limited LLM gateway.
//!
//! The HTTP client itself is an injected [`client::LlmClient`]; this crate
//! owns everything between the stages and that client: per-service queues,
//! adaptive throttling, single-flight coalescing, retries, and the circuit
//! breaker.

pub mod breaker;
pub mod client;
pub mod gateway;

pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{ChatMessage, ChatRole, CompletionRequest, LlmClient, Priority};
pub use gateway::LlmGateway;
