//! Workflow Step definition

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{invoke, Target, TargetKind};
use crate::context::ExecutionContext;
use crate::error::{Result, StepwiseError};
use crate::schema::{Direction, Schema, ValidationIssue};
use crate::trace::TraceEvent;

pub(crate) type BoxedBody = Arc<
    dyn Fn(ExecutionContext, Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// The smallest validated, traced unit of work
#[derive(Clone)]
pub struct Step {
    name: String,
    description: Option<String>,
    input_schema: Schema,
    output_schema: Schema,
    body: BoxedBody,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema.id())
            .field("output_schema", &self.output_schema.id())
            .finish()
    }
}

impl Step {
    /// Start building a step. Schemas default to accepting anything.
    pub fn builder(name: impl Into<String>) -> StepBuilder {
        StepBuilder {
            name: name.into(),
            description: None,
            input_schema: Schema::any(),
            output_schema: Schema::any(),
        }
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Invoke through the validating, tracing wrapper
    pub async fn call(&self, ctx: &ExecutionContext, input: Value) -> Result<Value> {
        invoke(self, ctx, input).await
    }
}

#[async_trait]
impl Target for Step {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Step
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    async fn execute(&self, ctx: &ExecutionContext, input: Value) -> Result<Value> {
        (self.body)(ctx.clone(), input).await
    }
}

/// Builder for [`Step`]
pub struct StepBuilder {
    name: String,
    description: Option<String>,
    input_schema: Schema,
    output_schema: Schema,
}

impl StepBuilder {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = schema;
        self
    }

    /// Finish with a JSON-in, JSON-out body
    pub fn handler<F, Fut>(self, body: F) -> Step
    where
        F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Step {
            name: self.name,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            body: Arc::new(move |ctx, input| Box::pin(body(ctx, input))),
        }
    }

    /// Finish with a typed body.
    ///
    /// The validated input is deserialized into `I`; a mismatch is reported
    /// as an input validation error. The returned `O` is serialized and then
    /// checked against the output schema like any other step output.
    pub fn typed<I, O, F, Fut>(self, body: F) -> Step
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ExecutionContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let body = Arc::new(body);
        self.handler(move |ctx, input| {
            let body = body.clone();
            async move {
                let typed: I = match serde_json::from_value(input) {
                    Ok(typed) => typed,
                    Err(e) => {
                        let issues = vec![ValidationIssue::new("", e.to_string())];
                        ctx.trace().emit(
                            ctx.span_id(),
                            TraceEvent::ValidationError {
                                direction: Direction::Input,
                                issues: issues.clone(),
                            },
                        );
                        return Err(StepwiseError::validation(Direction::Input, issues));
                    }
                };
                let output = body(ctx, typed).await?;
                Ok(serde_json::to_value(output)?)
            }
        })
    }
}
