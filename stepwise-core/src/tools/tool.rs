//! Tool trait and closure-backed tools
//!
//! Tools are named, schema-validated operations that step bodies (and
//! models, through descriptors) can invoke.

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::generation::ToolDescriptor;
use crate::schema::Schema;

/// A callable, schema-validated operation
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (unique identifier in a registry)
    fn name(&self) -> &str;

    /// Human-readable description, shown to models
    fn description(&self) -> &str {
        ""
    }

    fn input_schema(&self) -> &Schema;

    fn output_schema(&self) -> &Schema;

    /// Run the tool. Input has already been validated.
    async fn call(&self, ctx: &ExecutionContext, input: Value) -> Result<Value>;

    /// Descriptor handed to generation backends
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.input_schema().document().clone(),
        }
    }
}

type BoxedHandler = Arc<
    dyn Fn(ExecutionContext, Value) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>>
        + Send
        + Sync,
>;

/// Tool whose body is a closure
///
/// ```rust,ignore
/// let upper = FnTool::new("upper", |_ctx, input| async move {
///     Ok(json!(input.as_str().unwrap_or_default().to_uppercase()))
/// })
/// .with_input_schema(Schema::non_empty_string()?);
/// ```
#[derive(Clone)]
pub struct FnTool {
    name: String,
    description: String,
    input_schema: Schema,
    output_schema: Schema,
    handler: BoxedHandler,
}

impl FnTool {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ExecutionContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            input_schema: Schema::any(),
            output_schema: Schema::any(),
            handler: Arc::new(move |ctx, input| Box::pin(handler(ctx, input))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Schema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Schema) -> Self {
        self.output_schema = schema;
        self
    }
}

impl std::fmt::Debug for FnTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.name)
            .field("description", &self.description)
            .finish()
    }
}

#[async_trait]
impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn input_schema(&self) -> &Schema {
        &self.input_schema
    }

    fn output_schema(&self) -> &Schema {
        &self.output_schema
    }

    async fn call(&self, ctx: &ExecutionContext, input: Value) -> Result<Value> {
        (self.handler)(ctx.clone(), input).await
    }
}
