//! Run orchestration
//!
//! [`Runtime::run`] is the single entry point for executing a step or
//! workflow as a top-level run. It owns the run's lifecycle: a fresh
//! [`RunId`] and trace stream, the root span, validation of the top-level
//! input and output, and teardown of the sink whether the run succeeds or
//! fails. The caller always gets a [`RunRecord`] back, on the error path
//! inside [`RunError`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::StepwiseConfig;
use crate::context::{ExecutionContext, Policies};
use crate::error::StepwiseError;
use crate::generation::{BackendFactory, Cache, GenerationBackend, StubBackend, TokenUsage};
use crate::tools::ToolRegistry;
use crate::trace::{NullSinkFactory, RunId, Trace, TraceSinkFactory};
use crate::workflow::{run_validated, Target};

/// Final status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Failure,
}

/// Summary of one top-level run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub target: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

/// Output and record of a successful run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub output: Value,
    pub record: RunRecord,
}

/// A failed run: the record plus the original error, unchanged
#[derive(Debug)]
pub struct RunError {
    pub record: RunRecord,
    pub source: StepwiseError,
}

impl RunError {
    /// Discard the record and keep the error
    pub fn into_inner(self) -> StepwiseError {
        self.source
    }
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.source.fmt(f)
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<RunError> for StepwiseError {
    fn from(err: RunError) -> Self {
        err.source
    }
}

/// Shared services for runs
#[derive(Clone)]
pub struct Runtime {
    sinks: Arc<dyn TraceSinkFactory>,
    backend: Arc<dyn GenerationBackend>,
    tools: Arc<ToolRegistry>,
    cache: Option<Arc<dyn Cache>>,
    policies: Policies,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("backend", &self.backend.provider())
            .field("tools", &self.tools)
            .field("cache", &self.cache.is_some())
            .field("policies", &self.policies)
            .finish()
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::default()
    }

    /// Build a runtime from configuration: sink factory, cache, backend and
    /// policies all come from `config`; tools are added by the caller.
    pub fn from_config(config: &StepwiseConfig) -> crate::error::Result<RuntimeBuilder> {
        Ok(RuntimeBuilder::default()
            .sink_factory(config.sink_factory())
            .backend(BackendFactory::create(&config.backend)?)
            .cache(config.build_cache())
            .policies(config.policies.clone()))
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

    /// Execute `target` as a new top-level run.
    ///
    /// # Errors
    ///
    /// Any failure inside the run, or a sink failure while closing a run
    /// that otherwise succeeded. The [`RunRecord`] is always attached.
    pub async fn run(
        &self,
        target: &dyn Target,
        input: Value,
    ) -> std::result::Result<RunOutcome, RunError> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let started = Instant::now();
        info!(run_id = %run_id, target = %target.name(), "run started");

        let sink = match self.sinks.open(&run_id).await {
            Ok(sink) => sink,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "failed to open trace sink");
                let record = self.record(&run_id, target, started_at, started, None, Some(&e));
                return Err(RunError { record, source: e });
            }
        };
        let trace = Trace::new(run_id.clone(), sink);
        let ctx = ExecutionContext::builder(trace.clone())
            .backend(self.backend.clone())
            .tools(self.tools.clone())
            .cache(self.cache.clone())
            .policies(self.policies.clone())
            .root(target.name(), Some(json!({"kind": target.kind()})));

        let mut result = run_validated(target, &ctx, input).await;

        let usage = trace.usage();
        ctx.end_span(
            started,
            result.as_ref().err().map(|e| e.to_string()),
            Some(usage.clone()),
        );

        if let Err(close_err) = trace.close().await {
            match result {
                Ok(_) => result = Err(close_err),
                Err(ref original) => {
                    warn!(
                        run_id = %run_id,
                        error = %close_err,
                        original = %original,
                        "trace close failed after run failure"
                    );
                }
            }
        }

        let record = self.record(
            &run_id,
            target,
            started_at,
            started,
            Some((usage.tokens, usage.cost)),
            result.as_ref().err(),
        );
        info!(
            run_id = %run_id,
            target = %target.name(),
            status = ?record.status,
            duration_ms = record.duration_ms,
            "run finished"
        );

        match result {
            Ok(output) => Ok(RunOutcome { output, record }),
            Err(source) => Err(RunError { record, source }),
        }
    }

    fn record(
        &self,
        run_id: &RunId,
        target: &dyn Target,
        started_at: DateTime<Utc>,
        started: Instant,
        usage: Option<(Option<TokenUsage>, Option<f64>)>,
        error: Option<&StepwiseError>,
    ) -> RunRecord {
        let (tokens, cost) = usage.unwrap_or((None, None));
        RunRecord {
            run_id: run_id.clone(),
            target: target.name().to_string(),
            status: if error.is_some() {
                RunStatus::Failure
            } else {
                RunStatus::Success
            },
            started_at,
            ended_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            cost,
            tokens,
            error: error.map(|e| e.to_string()),
        }
    }
}

/// Builder for [`Runtime`]. Defaults: traces discarded, no backend, no
/// tools, no cache.
pub struct RuntimeBuilder {
    sinks: Arc<dyn TraceSinkFactory>,
    backend: Arc<dyn GenerationBackend>,
    tools: ToolRegistry,
    cache: Option<Arc<dyn Cache>>,
    policies: Policies,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self {
            sinks: Arc::new(NullSinkFactory),
            backend: Arc::new(StubBackend),
            tools: ToolRegistry::new(),
            cache: None,
            policies: Policies::default(),
        }
    }
}

impl RuntimeBuilder {
    pub fn sink_factory(mut self, sinks: Arc<dyn TraceSinkFactory>) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn backend(mut self, backend: Arc<dyn GenerationBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    /// Register one more tool
    pub fn tool(mut self, tool: impl crate::tools::Tool + 'static) -> Self {
        self.tools.register(Arc::new(tool));
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

    pub fn build(self) -> Runtime {
        Runtime {
            sinks: self.sinks,
            backend: self.backend,
            tools: Arc::new(self.tools),
            cache: self.cache,
            policies: self.policies,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::{BackendResponse, GenerationRequest, ScriptedBackend};
    use crate::schema::{Direction, Schema};
    use crate::trace::{
        MemorySinkFactory, RunId, SpanTree, TraceEvent, TraceSink, TraceRecord,
    };
    use crate::workflow::{Step, Workflow};
    use async_trait::async_trait;

    fn runtime(sinks: &MemorySinkFactory) -> Runtime {
        Runtime::builder()
            .sink_factory(Arc::new(sinks.clone()))
            .build()
    }

    #[tokio::test]
    async fn test_successful_run_closes_trace() {
        let sinks = MemorySinkFactory::new();
        let backend = Arc::new(ScriptedBackend::new().respond_with(
            BackendResponse::text("ok").with_usage(TokenUsage::new(3, 2)).with_cost(0.01),
        ));
        let rt = Runtime::builder()
            .sink_factory(Arc::new(sinks.clone()))
            .backend(backend)
            .build();
        let step = Step::builder("ask").handler(|ctx, _input| async move {
            Ok(ctx.generate(GenerationRequest::new("m").user("q")).await?.value())
        });

        let outcome = rt.run(&step, json!({})).await.unwrap();
        assert_eq!(outcome.output, json!("ok"));
        assert!(outcome.record.is_success());
        assert_eq!(outcome.record.target, "ask");
        assert_eq!(outcome.record.tokens, Some(TokenUsage::new(3, 2)));
        assert_eq!(outcome.record.cost, Some(0.01));
        assert!(outcome.record.error.is_none());

        let run_id = &outcome.record.run_id;
        assert!(sinks.is_closed(run_id));
        let records = sinks.records(run_id);
        let tree = SpanTree::build(&records);
        assert!(tree.is_well_formed(), "{:?}", tree.issues);
        assert_eq!(tree.roots.len(), 1);
        match &records.last().unwrap().event {
            TraceEvent::SpanEnd { name, tokens, cost, parent, .. } => {
                assert_eq!(name, "ask");
                assert!(parent.is_none());
                assert_eq!(*tokens, Some(TokenUsage::new(3, 2)));
                assert_eq!(*cost, Some(0.01));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_top_level_input_validated() {
        let sinks = MemorySinkFactory::new();
        let step = Step::builder("strict")
            .input_schema(Schema::non_empty_string().unwrap())
            .handler(|_ctx, input| async move { Ok(input) });

        let err = runtime(&sinks).run(&step, json!("")).await.unwrap_err();
        assert_eq!(err.source.validation_direction(), Some(Direction::Input));
        assert_eq!(err.record.status, RunStatus::Failure);

        let kinds: Vec<&str> = sinks
            .records(&err.record.run_id)
            .iter()
            .map(|r| r.event.kind())
            .collect();
        assert_eq!(kinds, vec!["span_start", "validation_error", "span_end"]);
    }

    #[tokio::test]
    async fn test_nested_failure_reported_once_at_root() {
        let sinks = MemorySinkFactory::new();
        let inner = Step::builder("inner").handler(|_ctx, _input| async move {
            Err::<Value, _>(StepwiseError::Other("inner exploded".to_string()))
        });
        let workflow = Workflow::builder("outer").step(inner).build().unwrap();

        let err = runtime(&sinks).run(&workflow, json!(1)).await.unwrap_err();
        assert_eq!(err.to_string(), "inner exploded");
        assert!(matches!(err.source, StepwiseError::Other(_)));
        assert_eq!(err.record.status, RunStatus::Failure);
        assert_eq!(err.record.error.as_deref(), Some("inner exploded"));

        let records = sinks.records(&err.record.run_id);
        let root_ends: Vec<&TraceRecord> = records
            .iter()
            .filter(|r| matches!(&r.event, TraceEvent::SpanEnd { parent: None, .. }))
            .collect();
        assert_eq!(root_ends.len(), 1);
        assert_eq!(root_ends[0].event.error(), Some("inner exploded"));
    }

    struct BrokenSink;

    #[async_trait]
    impl TraceSink for BrokenSink {
        async fn write(&mut self, _record: &TraceRecord) -> crate::error::Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> crate::error::Result<()> {
            Err(StepwiseError::Trace("disk full".to_string()))
        }
    }

    struct BrokenSinkFactory;

    #[async_trait]
    impl TraceSinkFactory for BrokenSinkFactory {
        async fn open(&self, _run_id: &RunId) -> crate::error::Result<Box<dyn TraceSink>> {
            Ok(Box::new(BrokenSink))
        }
    }

    #[tokio::test]
    async fn test_close_failure_fails_successful_run() {
        let rt = Runtime::builder()
            .sink_factory(Arc::new(BrokenSinkFactory))
            .build();
        let ok = Step::builder("ok").handler(|_ctx, input| async move { Ok(input) });

        let err = rt.run(&ok, json!(1)).await.unwrap_err();
        assert!(matches!(err.source, StepwiseError::Trace(_)));
        assert_eq!(err.record.status, RunStatus::Failure);
    }

    #[tokio::test]
    async fn test_close_failure_does_not_mask_run_error() {
        let rt = Runtime::builder()
            .sink_factory(Arc::new(BrokenSinkFactory))
            .build();
        let bad = Step::builder("bad").handler(|_ctx, _input| async move {
            Err::<Value, _>(StepwiseError::Tool {
                tool: "t".to_string(),
                message: "nope".to_string(),
            })
        });

        let err = rt.run(&bad, json!(1)).await.unwrap_err();
        assert!(matches!(err.source, StepwiseError::Tool { .. }));
    }

    /// Fails every write and records whether `close` was reached
    struct UnwritableSink {
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl TraceSink for UnwritableSink {
        async fn write(&mut self, _record: &TraceRecord) -> crate::error::Result<()> {
            Err(StepwiseError::Trace("read-only filesystem".to_string()))
        }

        async fn close(&mut self) -> crate::error::Result<()> {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct UnwritableSinkFactory {
        closed: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl TraceSinkFactory for UnwritableSinkFactory {
        async fn open(&self, _run_id: &RunId) -> crate::error::Result<Box<dyn TraceSink>> {
            Ok(Box::new(UnwritableSink {
                closed: self.closed.clone(),
            }))
        }
    }

    #[tokio::test]
    async fn test_sink_is_closed_when_writes_fail() {
        let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let rt = Runtime::builder()
            .sink_factory(Arc::new(UnwritableSinkFactory {
                closed: closed.clone(),
            }))
            .build();
        let ok = Step::builder("ok").handler(|_ctx, input| async move { Ok(input) });

        let err = rt.run(&ok, json!(1)).await.unwrap_err();
        assert!(matches!(err.source, StepwiseError::Trace(ref m) if m == "read-only filesystem"));
        assert_eq!(err.record.status, RunStatus::Failure);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_runs_get_distinct_ids() {
        let sinks = MemorySinkFactory::new();
        let rt = runtime(&sinks);
        let step = Step::builder("echo").handler(|_ctx, input| async move { Ok(input) });

        let a = rt.run(&step, json!("a")).await.unwrap();
        let b = rt.run(&step, json!("b")).await.unwrap();
        assert_ne!(a.record.run_id, b.record.run_id);
        assert_eq!(sinks.run_ids().len(), 2);
    }
}
