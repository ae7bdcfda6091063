//! Tool-call hygiene between the planner LLM and the providers: the
//! five-stage validation pipeline, the bounded call history, and the
//! inspector that gates execution.

pub mod history;
pub mod inspector;
pub mod validate;

pub use history::{params_hash, CallOutcome, ToolHistory};
pub use inspector::{Inspection, InspectionDecision, Inspector};
pub use validate::{SemanticReviewer, ValidationPipeline, ValidationReport};
