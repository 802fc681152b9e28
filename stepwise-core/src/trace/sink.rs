//! Trace sinks
//!
//! A sink receives one run's records in emission order. Factories open one
//! sink per run.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

use super::event::TraceRecord;
use super::ids::RunId;
use crate::error::{Result, StepwiseError};

/// Destination for one run's trace stream
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Append one record
    async fn write(&mut self, record: &TraceRecord) -> Result<()>;

    /// Push buffered records to durable storage
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Finish the stream; no writes follow
    async fn close(&mut self) -> Result<()>;
}

/// Opens a sink for each run
#[async_trait]
pub trait TraceSinkFactory: Send + Sync {
    async fn open(&self, run_id: &RunId) -> Result<Box<dyn TraceSink>>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl TraceSink for NullSink {
    async fn write(&mut self, _record: &TraceRecord) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSinkFactory;

#[async_trait]
impl TraceSinkFactory for NullSinkFactory {
    async fn open(&self, _run_id: &RunId) -> Result<Box<dyn TraceSink>> {
        Ok(Box::new(NullSink))
    }
}

/// JSON Lines file per run: `<dir>/<run_id>.jsonl`
pub struct JsonlFileSink {
    path: PathBuf,
    writer: Option<tokio::io::BufWriter<tokio::fs::File>>,
}

impl JsonlFileSink {
    /// Create (truncating) the trace file for a run.
    pub async fn create(dir: impl AsRef<Path>, run_id: &RunId) -> Result<Self> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!("{}.jsonl", run_id));
        let file = tokio::fs::File::create(&path).await.map_err(|e| {
            StepwiseError::Trace(format!("Failed to create {}: {}", path.display(), e))
        })?;
        Ok(Self {
            path,
            writer: Some(tokio::io::BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TraceSink for JsonlFileSink {
    async fn write(&mut self, record: &TraceRecord) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            StepwiseError::Trace(format!("{} is already closed", self.path.display()))
        })?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.get_ref().sync_all().await?;
        }
        Ok(())
    }
}

/// Opens a [`JsonlFileSink`] under a directory
#[derive(Debug, Clone)]
pub struct JsonlSinkFactory {
    dir: PathBuf,
}

impl JsonlSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Where the trace for `run_id` is written
    pub fn path_for(&self, run_id: &RunId) -> PathBuf {
        self.dir.join(format!("{}.jsonl", run_id))
    }
}

#[async_trait]
impl TraceSinkFactory for JsonlSinkFactory {
    async fn open(&self, run_id: &RunId) -> Result<Box<dyn TraceSink>> {
        Ok(Box::new(JsonlFileSink::create(&self.dir, run_id).await?))
    }
}

#[derive(Debug, Default)]
struct StoredRun {
    records: Vec<TraceRecord>,
    closed: bool,
}

type RunStore = Arc<Mutex<HashMap<RunId, StoredRun>>>;

/// In-memory sink; records are visible through its [`MemorySinkFactory`]
pub struct MemorySink {
    run_id: RunId,
    store: RunStore,
}

#[async_trait]
impl TraceSink for MemorySink {
    async fn write(&mut self, record: &TraceRecord) -> Result<()> {
        let mut store = self.store.lock().map_err(|e| {
            StepwiseError::Trace(format!("Failed to lock memory trace store: {}", e))
        })?;
        let run = store.entry(self.run_id.clone()).or_default();
        if run.closed {
            return Err(StepwiseError::Trace(format!(
                "trace for run {} is already closed",
                self.run_id
            )));
        }
        run.records.push(record.clone());
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        let mut store = self.store.lock().map_err(|e| {
            StepwiseError::Trace(format!("Failed to lock memory trace store: {}", e))
        })?;
        store.entry(self.run_id.clone()).or_default().closed = true;
        Ok(())
    }
}

/// Keeps every run's records in memory, for tests and embedding
#[derive(Debug, Clone, Default)]
pub struct MemorySinkFactory {
    store: RunStore,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records written for a run, in order
    pub fn records(&self, run_id: &RunId) -> Vec<TraceRecord> {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store
            .get(run_id)
            .map(|run| run.records.clone())
            .unwrap_or_default()
    }

    /// Whether the sink for a run has been closed
    pub fn is_closed(&self, run_id: &RunId) -> bool {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        store.get(run_id).map(|run| run.closed).unwrap_or(false)
    }

    /// Every run seen so far
    pub fn run_ids(&self) -> Vec<RunId> {
        let store = self.store.lock().unwrap_or_else(|p| p.into_inner());
        let mut ids: Vec<RunId> = store.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl TraceSinkFactory for MemorySinkFactory {
    async fn open(&self, run_id: &RunId) -> Result<Box<dyn TraceSink>> {
        let mut store = self.store.lock().map_err(|e| {
            StepwiseError::Trace(format!("Failed to lock memory trace store: {}", e))
        })?;
        store.insert(run_id.clone(), StoredRun::default());
        Ok(Box::new(MemorySink {
            run_id: run_id.clone(),
            store: self.store.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SpanId, TraceEvent};

    fn record(seq: u64, run_id: &RunId, name: &str) -> TraceRecord {
        TraceRecord {
            seq,
            timestamp: chrono::Utc::now(),
            run_id: run_id.clone(),
            span_id: SpanId::from("s"),
            event: TraceEvent::Event {
                name: name.to_string(),
                metadata: None,
            },
        }
    }

    #[tokio::test]
    async fn jsonl_sink_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let factory = JsonlSinkFactory::new(dir.path());
        let run_id = RunId::new();

        let mut sink = factory.open(&run_id).await.unwrap();
        sink.write(&record(0, &run_id, "first")).await.unwrap();
        sink.write(&record(1, &run_id, "second")).await.unwrap();
        sink.close().await.unwrap();

        let text = std::fs::read_to_string(factory.path_for(&run_id)).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: TraceRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.seq, 1);
    }

    #[tokio::test]
    async fn jsonl_sink_rejects_writes_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = RunId::new();
        let mut sink = JsonlFileSink::create(dir.path(), &run_id).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        let err = sink.write(&record(0, &run_id, "late")).await.unwrap_err();
        assert!(matches!(err, StepwiseError::Trace(_)));
    }

    #[tokio::test]
    async fn memory_factory_keeps_runs_apart() {
        let factory = MemorySinkFactory::new();
        let a = RunId::from("a");
        let b = RunId::from("b");

        let mut sink_a = factory.open(&a).await.unwrap();
        let mut sink_b = factory.open(&b).await.unwrap();
        sink_a.write(&record(0, &a, "a0")).await.unwrap();
        sink_b.write(&record(0, &b, "b0")).await.unwrap();
        sink_a.write(&record(1, &a, "a1")).await.unwrap();
        sink_a.close().await.unwrap();

        assert_eq!(factory.records(&a).len(), 2);
        assert_eq!(factory.records(&b).len(), 1);
        assert!(factory.is_closed(&a));
        assert!(!factory.is_closed(&b));
        assert_eq!(factory.run_ids(), vec![a, b]);
    }
}
