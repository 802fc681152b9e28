//! Shared fixtures for unit tests

use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::generation::{Cache, GenerationBackend, StubBackend};
use crate::tools::ToolRegistry;
use crate::trace::{MemorySinkFactory, RunId, Trace, TraceRecord, TraceSinkFactory};

pub(crate) struct Harness {
    pub sinks: MemorySinkFactory,
    pub ctx: ExecutionContext,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with(Arc::new(StubBackend), ToolRegistry::new(), None).await
    }

    pub async fn with(
        backend: Arc<dyn GenerationBackend>,
        tools: ToolRegistry,
        cache: Option<Arc<dyn Cache>>,
    ) -> Self {
        let sinks = MemorySinkFactory::new();
        let run_id = RunId::new();
        let sink = sinks.open(&run_id).await.unwrap();
        let ctx = ExecutionContext::builder(Trace::new(run_id, sink))
            .backend(backend)
            .tools(Arc::new(tools))
            .cache(cache)
            .root("test", None);
        Self { sinks, ctx }
    }

    /// Flush and return everything emitted so far
    pub async fn records(&self) -> Vec<TraceRecord> {
        self.ctx.trace().flush().await.unwrap();
        self.sinks.records(self.ctx.run_id())
    }

    pub async fn kinds(&self) -> Vec<&'static str> {
        self.records().await.iter().map(|r| r.event.kind()).collect()
    }
}
