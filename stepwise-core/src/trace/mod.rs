//! Run tracing
//!
//! Every run owns one [`Trace`]: an append-only, ordered log of
//! [`TraceRecord`]s written to a [`TraceSink`]. Emission is synchronous and
//! lands in an in-memory buffer; [`Trace::flush`] drains the buffer into the
//! sink under a write lock so sink order always equals emission order.
//!
//! # Example
//!
//! ```rust,ignore
//! use stepwise_core::trace::{MemorySinkFactory, Trace, TraceSinkFactory, RunId};
//!
//! let factory = MemorySinkFactory::new();
//! let run_id = RunId::new();
//! let trace = Trace::new(run_id.clone(), factory.open(&run_id).await?);
//! trace.emit(&root_span, TraceEvent::Event { name: "hello".into(), metadata: None });
//! trace.close().await?;
//! assert_eq!(factory.records(&run_id).len(), 1);
//! ```

mod event;
mod ids;
mod sink;
mod tree;

pub use event::{TraceEvent, TraceRecord};
pub use ids::{RunId, SpanId};
pub use sink::{
    JsonlFileSink, JsonlSinkFactory, MemorySink, MemorySinkFactory, NullSink, NullSinkFactory,
    TraceSink, TraceSinkFactory,
};
pub use tree::{read_trace, SpanNode, SpanTree, TraceSummary, TreeIssue};

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{Result, StepwiseError};
use crate::generation::TokenUsage;

/// Token and cost totals accumulated across a run's generation calls
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunUsage {
    pub tokens: Option<TokenUsage>,
    pub cost: Option<f64>,
}

impl RunUsage {
    /// Add one call's usage to the totals
    pub fn add(&mut self, tokens: Option<&TokenUsage>, cost: Option<f64>) {
        if let Some(t) = tokens {
            self.tokens.get_or_insert_with(TokenUsage::default).add(t);
        }
        if let Some(c) = cost {
            *self.cost.get_or_insert(0.0) += c;
        }
    }
}

#[derive(Default)]
struct Buffer {
    next_seq: u64,
    pending: Vec<TraceRecord>,
}

struct TraceInner {
    run_id: RunId,
    buffer: Mutex<Buffer>,
    sink: tokio::sync::Mutex<Box<dyn TraceSink>>,
    usage: Mutex<RunUsage>,
    closed: AtomicBool,
}

/// Shared handle to one run's trace stream
#[derive(Clone)]
pub struct Trace {
    inner: Arc<TraceInner>,
}

impl Trace {
    pub fn new(run_id: RunId, sink: Box<dyn TraceSink>) -> Self {
        Self {
            inner: Arc::new(TraceInner {
                run_id,
                buffer: Mutex::new(Buffer::default()),
                sink: tokio::sync::Mutex::new(sink),
                usage: Mutex::new(RunUsage::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// A trace that discards every record
    pub fn detached(run_id: RunId) -> Self {
        Self::new(run_id, Box::new(NullSink))
    }

    pub fn run_id(&self) -> &RunId {
        &self.inner.run_id
    }

    /// Append an event for `span_id`. Never fails; events emitted after
    /// [`Trace::close`] are dropped.
    pub fn emit(&self, span_id: &SpanId, event: TraceEvent) {
        if self.inner.closed.load(Ordering::Acquire) {
            warn!(
                run_id = %self.inner.run_id,
                kind = event.kind(),
                "dropping trace event emitted after close"
            );
            return;
        }
        let mut buffer = self.lock_buffer();
        let seq = buffer.next_seq;
        buffer.next_seq += 1;
        buffer.pending.push(TraceRecord {
            seq,
            timestamp: Utc::now(),
            run_id: self.inner.run_id.clone(),
            span_id: span_id.clone(),
            event,
        });
    }

    /// Number of records emitted so far
    pub fn emitted(&self) -> u64 {
        self.lock_buffer().next_seq
    }

    /// Add a generation call's usage to the run totals
    pub fn record_usage(&self, tokens: Option<&TokenUsage>, cost: Option<f64>) {
        let mut usage = self.inner.usage.lock().unwrap_or_else(|p| p.into_inner());
        usage.add(tokens, cost);
    }

    /// Current run totals
    pub fn usage(&self) -> RunUsage {
        self.inner
            .usage
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Write every buffered record to the sink, in emission order.
    pub async fn flush(&self) -> Result<()> {
        let mut sink = self.inner.sink.lock().await;
        // Drained while holding the sink lock so concurrent flushes cannot interleave.
        let pending = std::mem::take(&mut self.lock_buffer().pending);
        if pending.is_empty() {
            return Ok(());
        }
        for (written, record) in pending.iter().enumerate() {
            if let Err(e) = sink.write(record).await {
                // Put back what was not written so a later flush retries it.
                let mut buffer = self.lock_buffer();
                let mut rest = pending[written..].to_vec();
                rest.append(&mut buffer.pending);
                buffer.pending = rest;
                return Err(e);
            }
        }
        sink.flush().await?;
        debug!(run_id = %self.inner.run_id, records = pending.len(), "flushed trace");
        Ok(())
    }

    /// Flush remaining records and close the sink. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let flushed = self.flush().await;
        let mut sink = self.inner.sink.lock().await;
        // The sink is closed even when the final flush failed; that error wins.
        let closed = sink.close().await;
        match (flushed, closed) {
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(run_id = %self.inner.run_id, error = %close_err, "trace sink close failed");
                }
                Err(as_trace_error(e))
            }
            (Ok(()), closed) => closed.map_err(as_trace_error),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        // Emission never fails; a poisoned buffer is still structurally valid.
        self.inner.buffer.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn as_trace_error(e: StepwiseError) -> StepwiseError {
    match e {
        StepwiseError::Trace(_) => e,
        other => StepwiseError::Trace(other.to_string()),
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("run_id", &self.inner.run_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Rejects every write; remembers whether it was closed
    struct RejectingSink {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TraceSink for RejectingSink {
        async fn write(&mut self, _record: &TraceRecord) -> Result<()> {
            Err(StepwiseError::Io(std::io::Error::other("device gone")))
        }

        async fn close(&mut self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn event(name: &str) -> TraceEvent {
        TraceEvent::Event {
            name: name.to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn flush_preserves_emission_order() {
        let factory = MemorySinkFactory::new();
        let run_id = RunId::new();
        let trace = Trace::new(run_id.clone(), factory.open(&run_id).await.unwrap());
        let span = SpanId::new();

        trace.emit(&span, event("a"));
        trace.emit(&span, event("b"));
        assert!(factory.records(&run_id).is_empty());

        trace.flush().await.unwrap();
        trace.emit(&span, event("c"));
        trace.close().await.unwrap();

        let records = factory.records(&run_id);
        let seqs: Vec<u64> = records.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(factory.is_closed(&run_id));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drops_late_events() {
        let factory = MemorySinkFactory::new();
        let run_id = RunId::new();
        let trace = Trace::new(run_id.clone(), factory.open(&run_id).await.unwrap());

        trace.close().await.unwrap();
        trace.close().await.unwrap();
        trace.emit(&SpanId::new(), event("late"));
        trace.flush().await.unwrap();

        assert!(factory.records(&run_id).is_empty());
    }

    #[tokio::test]
    async fn usage_accumulates() {
        let trace = Trace::detached(RunId::new());
        trace.record_usage(Some(&TokenUsage::new(10, 5)), Some(0.01));
        trace.record_usage(Some(&TokenUsage::new(1, 1)), None);
        trace.record_usage(None, Some(0.02));

        let usage = trace.usage();
        assert_eq!(usage.tokens, Some(TokenUsage::new(11, 6)));
        assert!((usage.cost.unwrap() - 0.03).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_reaches_the_sink_when_the_final_flush_fails() {
        let closed = Arc::new(AtomicBool::new(false));
        let trace = Trace::new(
            RunId::new(),
            Box::new(RejectingSink {
                closed: closed.clone(),
            }),
        );
        trace.emit(&SpanId::new(), event("lost"));

        let err = trace.close().await.unwrap_err();
        assert!(matches!(err, StepwiseError::Trace(ref m) if m.contains("device gone")));
        assert!(closed.load(Ordering::SeqCst));
        assert!(trace.is_closed());
    }
}
