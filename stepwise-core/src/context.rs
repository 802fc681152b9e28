//! Execution context
//!
//! An [`ExecutionContext`] is the per-scope bundle handed to every step body:
//! the active run and span, the run's [`Trace`], the generation backend, the
//! tool registry, an optional cache and the policy settings. Contexts are
//! never mutated; nesting produces a new context pointing at a child span and
//! leaves the parent untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::error::Result;
use crate::generation::{
    self, Cache, GenerationBackend, GenerationRequest, GenerationResult, StubBackend,
};
use crate::tools::ToolRegistry;
use crate::trace::{RunId, RunUsage, SpanId, Trace, TraceEvent};

/// What to do when a value fails its schema
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnValidationError {
    #[default]
    Fail,
    Repair,
}

/// Policy settings carried on every context.
///
/// Reserved: nothing in the runtime consults these yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policies {
    pub repair_attempts: u32,
    pub on_validation_error: OnValidationError,
}

/// Per-scope execution state
#[derive(Clone)]
pub struct ExecutionContext {
    run_id: RunId,
    span_id: SpanId,
    parent: Option<SpanId>,
    span_name: String,
    trace: Trace,
    backend: Arc<dyn GenerationBackend>,
    tools: Arc<ToolRegistry>,
    cache: Option<Arc<dyn Cache>>,
    policies: Policies,
}

impl ExecutionContext {
    pub fn builder(trace: Trace) -> ContextBuilder {
        ContextBuilder {
            trace,
            backend: Arc::new(StubBackend),
            tools: Arc::new(ToolRegistry::new()),
            cache: None,
            policies: Policies::default(),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn span_id(&self) -> &SpanId {
        &self.span_id
    }

    pub fn parent_span_id(&self) -> Option<&SpanId> {
        self.parent.as_ref()
    }

    pub fn span_name(&self) -> &str {
        &self.span_name
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn backend(&self) -> &Arc<dyn GenerationBackend> {
        &self.backend
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    pub fn cache(&self) -> Option<&Arc<dyn Cache>> {
        self.cache.as_ref()
    }

    pub fn policies(&self) -> &Policies {
        &self.policies
    }

    /// Open a child span and return a context scoped to it.
    ///
    /// The caller owns the matching `span_end`; prefer [`ExecutionContext::span`].
    pub fn child(&self, name: impl Into<String>, metadata: Option<Value>) -> ExecutionContext {
        let name = name.into();
        let span_id = SpanId::new();
        debug!(run_id = %self.run_id, span_id = %span_id, parent = %self.span_id, span = %name, "span start");
        self.trace.emit(
            &span_id,
            TraceEvent::SpanStart {
                parent: Some(self.span_id.clone()),
                name: name.clone(),
                metadata,
            },
        );
        ExecutionContext {
            span_id,
            parent: Some(self.span_id.clone()),
            span_name: name,
            ..self.clone()
        }
    }

    /// Run `body` inside a child span. The span is closed on both paths and an
    /// error is returned unchanged after being recorded on the `span_end`.
    pub async fn span<T, F, Fut>(
        &self,
        name: impl Into<String>,
        metadata: Option<Value>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(ExecutionContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let child = self.child(name, metadata);
        let result = body(child.clone()).await;
        let error = result.as_ref().err().map(|e| e.to_string());
        child.end_span(started, error, None);
        child.checkpoint().await;
        result
    }

    /// Emit a point-in-time event on the current span
    pub fn event(&self, name: impl Into<String>, metadata: Option<Value>) {
        self.trace.emit(
            &self.span_id,
            TraceEvent::Event {
                name: name.into(),
                metadata,
            },
        );
    }

    /// Attach a named payload to the current span
    pub fn artifact(&self, name: impl Into<String>, payload: Value) {
        self.trace.emit(
            &self.span_id,
            TraceEvent::Artifact {
                name: name.into(),
                payload,
            },
        );
    }

    /// Cache-aware generation call in this context
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationResult> {
        generation::generate(self, &request).await
    }

    /// Look up and invoke a registered tool in this context
    pub async fn call_tool(&self, name: &str, input: Value) -> Result<Value> {
        self.tools.call(name, self, input).await
    }

    /// Emit this context's `span_end`
    pub(crate) fn end_span(&self, started: Instant, error: Option<String>, usage: Option<RunUsage>) {
        let duration_ms = started.elapsed().as_millis() as u64;
        let (tokens, cost) = match usage {
            Some(u) => (u.tokens, u.cost),
            None => (None, None),
        };
        debug!(
            run_id = %self.run_id,
            span_id = %self.span_id,
            span = %self.span_name,
            duration_ms,
            failed = error.is_some(),
            "span end"
        );
        self.trace.emit(
            &self.span_id,
            TraceEvent::SpanEnd {
                parent: self.parent.clone(),
                name: self.span_name.clone(),
                duration_ms,
                error,
                cost,
                tokens,
            },
        );
    }

    /// Flush the trace; failures are logged and surface again at close
    pub(crate) async fn checkpoint(&self) {
        if let Err(e) = self.trace.flush().await {
            warn!(run_id = %self.run_id, error = %e, "trace flush failed");
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run_id", &self.run_id)
            .field("span_id", &self.span_id)
            .field("parent", &self.parent)
            .field("span_name", &self.span_name)
            .field("backend", &self.backend.provider())
            .field("tools", &self.tools)
            .field("cache", &self.cache.is_some())
            .field("policies", &self.policies)
            .finish()
    }
}

/// Assembles the services for a run's root context
pub struct ContextBuilder {
    trace: Trace,
    backend: Arc<dyn GenerationBackend>,
    tools: Arc<ToolRegistry>,
    cache: Option<Arc<dyn Cache>>,
    policies: Policies,
}

impl ContextBuilder {
    pub fn backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn tools(mut self, tools: Arc<ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn cache(mut self, cache: Option<Arc<dyn Cache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn policies(mut self, policies: Policies) -> Self {
        self.policies = policies;
        self
    }

    /// Open the root span and return its context
    pub fn root(self, name: impl Into<String>, metadata: Option<Value>) -> ExecutionContext {
        let name = name.into();
        let span_id = SpanId::new();
        let run_id = self.trace.run_id().clone();
        self.trace.emit(
            &span_id,
            TraceEvent::SpanStart {
                parent: None,
                name: name.clone(),
                metadata,
            },
        );
        ExecutionContext {
            run_id,
            span_id,
            parent: None,
            span_name: name,
            trace: self.trace,
            backend: self.backend,
            tools: self.tools,
            cache: self.cache,
            policies: self.policies,
        }
    }
}
