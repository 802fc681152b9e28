//! Workflows: named compositions of steps
//!
//! A workflow has the same wrapping contract as a step. Its body either
//! pipes each step's output into the next (the default) or is a custom
//! handler that receives the composed steps and calls them as it likes.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::{invoke, Target, TargetKind};
use crate::context::ExecutionContext;
use crate::error::{Result, StepwiseError};
use crate::schema::Schema;

/// The steps a workflow composes, callable by name
#[derive(Clone, Default)]
pub struct Steps {
    items: Arc<Vec<Arc<dyn Target>>>,
}

impl Steps {
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Target>> {
        self.items.iter().find(|s| s.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Target>> {
        self.items.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.items.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Invoke the named step through its wrapper
    pub async fn run(&self, name: &str, ctx: &ExecutionContext, input: Value) -> Result<Value> {
        let step = self.get(name).ok_or_else(|| {
            StepwiseError::Configuration(format!("No step named '{}' in this workflow", name))
        })?;
        invoke(step.as_ref(), ctx, input).await
    }
}

impl std::fmt::Debug for Steps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

type WorkflowBody = Arc<
    dyn Fn(ExecutionContext, Value, Steps) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// A composition of steps sharing the step wrapping contract
#[derive(Clone)]
pub struct Workflow {
    name: String,
    description: Option<String>,
    input_schema: Schema,
    output_schema: Schema,
    steps: Steps,
    // None pipes steps in order
    body: Option<WorkflowBody>,
}

impl std::fmt::Debug for Workflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("custom_body", &self.body.is_some())
            .finish()
    }
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            name: name.into(),
            description: None,
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            steps: Vec::new(),
        }
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn steps(&self) -> &Steps {
        &self.steps
    }

    pub async fn call(&self, ctx: &ExecutionContext, input: Value) -> Result<Value> {
        invoke(self, ctx, input).await
    }
}

#[async_trait]
impl Target for Workflow {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Workflow
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    async fn execute(&self, ctx: &ExecutionContext, input: Value) -> Result<Value> {
        if let Some(body) = &self.body {
            return body(ctx.clone(), input, self.steps.clone()).await;
        }
        let mut value = input;
        for step in self.steps.iter() {
            value = invoke(step.as_ref(), ctx, value).await?;
        }
        Ok(value)
    }
}

/// Builder for [`Workflow`]
pub struct WorkflowBuilder {
    name: String,
    description: Option<String>,
    input_schema: Schema,
    output_schema: Schema,
    steps: Vec<Arc<dyn Target>>,
}

impl WorkflowBuilder {
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

    /// Append a step (or a nested workflow)
    pub fn step(mut self, step: impl Target + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn step_arc(mut self, step: Arc<dyn Target>) -> Self {
        self.steps.push(step);
        self
    }

    /// Pipe steps in order: each output becomes the next input.
    ///
    /// # Errors
    ///
    /// A workflow needs at least one step.
    pub fn build(self) -> Result<Workflow> {
        if self.steps.is_empty() {
            return Err(StepwiseError::Configuration(format!(
                "Workflow '{}' has no steps",
                self.name
            )));
        }
        Ok(self.finish(None))
    }

    /// Custom orchestration over the composed steps
    pub fn handler<F, Fut>(self, body: F) -> Workflow
    where
        F: Fn(ExecutionContext, Value, Steps) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.finish(Some(Arc::new(move |ctx, input, steps| {
            Box::pin(body(ctx, input, steps))
        })))
    }

    fn finish(self, body: Option<WorkflowBody>) -> Workflow {
        Workflow {
            name: self.name,
            description: self.description,
            input_schema: self.input_schema,
            output_schema: self.output_schema,
            steps: Steps {
                items: Arc::new(self.steps),
            },
            body,
        }
    }
}
