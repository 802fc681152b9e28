//! # Stepwise - Traced, Validated Steps for Generative Workflows
//!
//! Stepwise runs typed units of work ("steps" and "workflows") that call a
//! generative model or tools, and:
//! - Validates every input and output against a declared JSON Schema
//! - Records a hierarchical, per-run trace of spans and events (JSON Lines)
//! - Caches generation calls under a deterministic request key
//! - Evaluates targets against datasets with judges and thresholds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stepwise_core::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let shout = Step::builder("shout")
//!         .input_schema(Schema::non_empty_string()?)
//!         .handler(|_ctx, input| async move {
//!             Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
//!         });
//!
//!     let runtime = Runtime::from_config(&StepwiseConfig::load()?)?.build();
//!     let outcome = runtime.run(&shout, json!("hello")).await?;
//!     println!("{} in {}ms", outcome.output, outcome.record.duration_ms);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Runtime**: one run per call, owning the trace stream and root span
//! - **Context**: immutable per-scope handle; nesting creates child spans
//! - **Steps/Workflows**: the validate, execute, validate wrapper
//! - **Generation**: cache-aware calls to a pluggable backend
//! - **Tools**: schema-checked, name-addressed callables
//! - **Eval**: datasets, judges, aggregate means and thresholds
//!
//! ## Feature Flags
//!
//! - `backend-openai`: OpenAI-compatible chat completions backend

pub mod canonical;
pub mod config;
pub mod context;
pub mod error;
pub mod eval;
pub mod generation;
pub mod runtime;
pub mod schema;
pub mod tools;
pub mod trace;
pub mod workflow;

#[cfg(test)]
mod test_support;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{BackendConfig, BackendProvider, CacheMode, StepwiseConfig};
    pub use crate::context::{ExecutionContext, OnValidationError, Policies};
    pub use crate::error::{Result, StepwiseError};
    pub use crate::eval::{
        run_eval, Case, CollisionPolicy, Dataset, EvalDefinition, EvalRunResult, EvalSpec,
        ExactMatch, FnJudge, Judge, JudgeInput, JudgeRegistry, KeyTerms, Score,
    };
    pub use crate::generation::{
        BackendFactory, BackendResponse, Cache, FileCache, GenerationBackend, GenerationRequest,
        GenerationResult, MemoryCache, Message, MessageRole, ScriptedBackend, StubBackend,
        TokenUsage,
    };
    pub use crate::runtime::{RunError, RunOutcome, RunRecord, RunStatus, Runtime};
    pub use crate::schema::{Direction, Schema, ValidationIssue};
    pub use crate::tools::{FnTool, Tool, ToolRegistry};
    pub use crate::trace::{
        JsonlSinkFactory, MemorySinkFactory, NullSinkFactory, RunId, SpanId, SpanTree,
        TraceEvent, TraceRecord, TraceSummary,
    };
    pub use crate::workflow::{Step, Target, TargetKind, TargetRegistry, Workflow};
    pub use serde_json::json;
}
