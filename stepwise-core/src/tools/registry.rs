//! Tool Registry for registration, lookup and validated invocation
//!
//! The `ToolRegistry` provides:
//! - Registration by name (re-registering a name replaces the old tool)
//! - Lookup by name
//! - Validated, traced invocation through [`ToolRegistry::call`]
//! - Descriptors for generation requests
//!
//! # Example
//!
//! ```rust,ignore
//! use stepwise_core::tools::{FnTool, ToolRegistry};
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(FnTool::new("echo", |_ctx, v| async move { Ok(v) })));
//!
//! let output = registry.call("echo", &ctx, json!("hi")).await?;
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::tool::Tool;
use crate::context::ExecutionContext;
use crate::error::{Result, StepwiseError};
use crate::generation::ToolDescriptor;
use crate::schema::Direction;
use crate::trace::TraceEvent;

/// Name-keyed table of tools
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, returning the one it replaced
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        let name = tool.name().to_string();
        let previous = self.tools.insert(name.clone(), tool);
        if previous.is_some() {
            debug!(tool = %name, "replaced registered tool");
        }
        previous
    }

    pub fn unregister(&mut self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors for every tool, sorted by name
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.descriptor())
            .collect()
    }

    /// Invoke a tool by name.
    ///
    /// Unknown names fail with [`StepwiseError::ToolNotFound`] and emit
    /// nothing. Otherwise input and output are validated against the tool's
    /// schemas and exactly one `tool_call` event is emitted.
    pub async fn call(&self, name: &str, ctx: &ExecutionContext, input: Value) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| StepwiseError::ToolNotFound(name.to_string()))?;
        let trace = ctx.trace();

        if let Err(issues) = tool.input_schema().validate(&input) {
            let err = StepwiseError::validation(Direction::Input, issues.clone());
            trace.emit(
                ctx.span_id(),
                TraceEvent::ValidationError {
                    direction: Direction::Input,
                    issues,
                },
            );
            trace.emit(ctx.span_id(), tool_call(name, input, None, Some(&err)));
            return Err(err);
        }

        debug!(run_id = %ctx.run_id(), tool = %name, "calling tool");
        let output = match tool.call(ctx, input.clone()).await {
            Ok(output) => output,
            Err(err) => {
                trace.emit(ctx.span_id(), tool_call(name, input, None, Some(&err)));
                return Err(err);
            }
        };

        if let Err(issues) = tool.output_schema().validate(&output) {
            let err = StepwiseError::validation(Direction::Output, issues.clone());
            trace.emit(
                ctx.span_id(),
                TraceEvent::ValidationError {
                    direction: Direction::Output,
                    issues,
                },
            );
            trace.emit(ctx.span_id(), tool_call(name, input, None, Some(&err)));
            return Err(err);
        }

        trace.emit(
            ctx.span_id(),
            tool_call(name, input, Some(output.clone()), None),
        );
        Ok(output)
    }
}

fn tool_call(
    name: &str,
    input: Value,
    output: Option<Value>,
    error: Option<&StepwiseError>,
) -> TraceEvent {
    TraceEvent::ToolCall {
        tool: name.to_string(),
        input,
        output,
        error: error.map(|e| e.to_string()),
    }
}
