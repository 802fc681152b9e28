//! Steps and workflows
//!
//! Steps and workflows are [`Target`]s: named units with an input schema, an
//! output schema and a body. Every invocation goes through [`invoke`], which
//!
//! 1. opens a child span named after the unit,
//! 2. validates the input (the body never sees invalid input),
//! 3. runs the body in the child context,
//! 4. validates the output (invalid output is never returned),
//! 5. closes the span with the elapsed time on success and failure alike.
//!
//! Nesting falls out naturally: each wrapper opens a child of whatever
//! context it is given.
//!
//! # Example
//!
//! ```rust,ignore
//! use stepwise_core::prelude::*;
//!
//! let shout = Step::builder("shout")
//!     .input_schema(Schema::non_empty_string()?)
//!     .handler(|_ctx, input| async move {
//!         Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
//!     });
//!
//! let pipeline = Workflow::builder("pipeline").step(shout).build()?;
//! let outcome = runtime.run(&pipeline, json!("hi")).await?;
//! ```

mod pipeline;
mod step;

pub use pipeline::{Steps, Workflow, WorkflowBuilder};
pub use step::{Step, StepBuilder};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::context::ExecutionContext;
use crate::error::{Result, StepwiseError};
use crate::schema::{Direction, Schema};
use crate::trace::TraceEvent;

/// Whether a target is a single step or a composition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Step,
    Workflow,
}

impl std::fmt::Display for TargetKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetKind::Step => write!(f, "step"),
            TargetKind::Workflow => write!(f, "workflow"),
        }
    }
}

/// A unit of work the runtime can execute
#[async_trait]
pub trait Target: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TargetKind;

    fn input_schema(&self) -> &Schema;

    fn output_schema(&self) -> &Schema;

    /// The raw body. Callers go through [`invoke`] instead.
    async fn execute(&self, ctx: &ExecutionContext, input: Value) -> Result<Value>;
}

/// Run a target in its own child span with input and output validation.
pub async fn invoke(target: &dyn Target, ctx: &ExecutionContext, input: Value) -> Result<Value> {
    let started = Instant::now();
    let child = ctx.child(target.name(), Some(json!({"kind": target.kind()})));
    let result = run_validated(target, &child, input).await;
    child.end_span(started, result.as_ref().err().map(|e| e.to_string()), None);
    child.checkpoint().await;
    result
}

/// Validate input, run the body, validate output, all in `ctx`'s span.
pub(crate) async fn run_validated(
    target: &dyn Target,
    ctx: &ExecutionContext,
    input: Value,
) -> Result<Value> {
    check(ctx, target.input_schema(), Direction::Input, &input)?;
    let output = target.execute(ctx, input).await?;
    check(ctx, target.output_schema(), Direction::Output, &output)?;
    Ok(output)
}

fn check(ctx: &ExecutionContext, schema: &Schema, direction: Direction, value: &Value) -> Result<()> {
    schema.validate(value).map_err(|issues| {
        ctx.trace().emit(
            ctx.span_id(),
            TraceEvent::ValidationError {
                direction,
                issues: issues.clone(),
            },
        );
        StepwiseError::validation(direction, issues)
    })
}

/// Name-keyed table of runnable targets
#[derive(Default, Clone)]
pub struct TargetRegistry {
    targets: HashMap<String, Arc<dyn Target>>,
}

impl std::fmt::Debug for TargetRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRegistry")
            .field("targets", &self.names())
            .finish()
    }
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target under its own name; last write wins
    pub fn register(&mut self, target: Arc<dyn Target>) -> Option<Arc<dyn Target>> {
        self.targets.insert(target.name().to_string(), target)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Target>> {
        self.targets.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.targets.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
