//! Reading traces back and checking their span structure

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use super::event::{TraceEvent, TraceRecord};
use super::ids::{RunId, SpanId};
use crate::error::{Result, StepwiseError};
use crate::generation::TokenUsage;

/// Load a JSON Lines trace file. Blank lines are skipped.
pub fn read_trace(path: impl AsRef<Path>) -> Result<Vec<TraceRecord>> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)
        .map_err(|e| StepwiseError::Trace(format!("Failed to open {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);

    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: TraceRecord = serde_json::from_str(&line).map_err(|e| {
            StepwiseError::Trace(format!("{}:{}: {}", path.display(), index + 1, e))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// One reconstructed span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanNode {
    pub span_id: SpanId,
    pub parent: Option<SpanId>,
    pub name: String,
    pub start_seq: u64,
    pub end_seq: Option<u64>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub children: Vec<SpanId>,
}

/// A structural problem in a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum TreeIssue {
    /// Span started but never ended
    Unclosed { span_id: SpanId },
    /// `span_end` for a span that never started
    EndWithoutStart { span_id: SpanId },
    /// Second `span_end` for the same span
    DuplicateEnd { span_id: SpanId },
    /// `span_start` seen twice for the same span
    DuplicateStart { span_id: SpanId },
    /// `span_end` parent or name differs from its `span_start`
    MismatchedEnd { span_id: SpanId, field: String },
    /// Parent pointer names a span with no `span_start` before it
    UnknownParent { span_id: SpanId, parent: SpanId },
    /// Not exactly one root span
    RootCount { count: usize },
    /// Records from more than one run in a single stream
    MixedRuns { run_ids: Vec<RunId> },
}

/// Span tree rebuilt from a run's records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanTree {
    pub roots: Vec<SpanId>,
    pub spans: Vec<SpanNode>,
    pub issues: Vec<TreeIssue>,
}

impl SpanTree {
    /// Rebuild the tree and collect every structural issue.
    pub fn build(records: &[TraceRecord]) -> Self {
        let mut spans: Vec<SpanNode> = Vec::new();
        let mut index: HashMap<SpanId, usize> = HashMap::new();
        let mut issues = Vec::new();
        let mut roots = Vec::new();

        let mut run_ids: Vec<RunId> = Vec::new();
        for record in records {
            if !run_ids.contains(&record.run_id) {
                run_ids.push(record.run_id.clone());
            }
        }
        if run_ids.len() > 1 {
            issues.push(TreeIssue::MixedRuns { run_ids });
        }

        for record in records {
            match &record.event {
                TraceEvent::SpanStart { parent, name, .. } => {
                    if index.contains_key(&record.span_id) {
                        issues.push(TreeIssue::DuplicateStart {
                            span_id: record.span_id.clone(),
                        });
                        continue;
                    }
                    match parent {
                        Some(p) => match index.get(p) {
                            Some(&i) => spans[i].children.push(record.span_id.clone()),
                            None => issues.push(TreeIssue::UnknownParent {
                                span_id: record.span_id.clone(),
                                parent: p.clone(),
                            }),
                        },
                        None => roots.push(record.span_id.clone()),
                    }
                    index.insert(record.span_id.clone(), spans.len());
                    spans.push(SpanNode {
                        span_id: record.span_id.clone(),
                        parent: parent.clone(),
                        name: name.clone(),
                        start_seq: record.seq,
                        end_seq: None,
                        duration_ms: None,
                        error: None,
                        children: Vec::new(),
                    });
                }
                TraceEvent::SpanEnd {
                    parent,
                    name,
                    duration_ms,
                    error,
                    ..
                } => {
                    let Some(&i) = index.get(&record.span_id) else {
                        issues.push(TreeIssue::EndWithoutStart {
                            span_id: record.span_id.clone(),
                        });
                        continue;
                    };
                    let node = &mut spans[i];
                    if node.end_seq.is_some() {
                        issues.push(TreeIssue::DuplicateEnd {
                            span_id: record.span_id.clone(),
                        });
                        continue;
                    }
                    if node.parent != *parent {
                        issues.push(TreeIssue::MismatchedEnd {
                            span_id: record.span_id.clone(),
                            field: "parent".to_string(),
                        });
                    }
                    if node.name != *name {
                        issues.push(TreeIssue::MismatchedEnd {
                            span_id: record.span_id.clone(),
                            field: "name".to_string(),
                        });
                    }
                    node.end_seq = Some(record.seq);
                    node.duration_ms = Some(*duration_ms);
                    node.error = error.clone();
                }
                _ => {}
            }
        }

        for node in &spans {
            if node.end_seq.is_none() {
                issues.push(TreeIssue::Unclosed {
                    span_id: node.span_id.clone(),
                });
            }
        }
        if !records.is_empty() && roots.len() != 1 {
            issues.push(TreeIssue::RootCount { count: roots.len() });
        }

        Self {
            roots,
            spans,
            issues,
        }
    }

    /// Every span started has exactly one later end and there is one root.
    pub fn is_well_formed(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn get(&self, span_id: &SpanId) -> Option<&SpanNode> {
        self.spans.iter().find(|s| &s.span_id == span_id)
    }

    /// Spans in start order whose name matches
    pub fn find_by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SpanNode> + 'a {
        self.spans.iter().filter(move |s| s.name == name)
    }

    /// Depth of a span below its root (root = 0). `None` for unknown spans
    /// and for parent chains that loop.
    pub fn depth(&self, span_id: &SpanId) -> Option<usize> {
        let mut node = self.get(span_id)?;
        let mut depth = 0;
        while let Some(parent) = &node.parent {
            if depth >= self.spans.len() {
                return None;
            }
            node = self.get(parent)?;
            depth += 1;
        }
        Some(depth)
    }
}

/// Counts and totals for one trace
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub run_ids: Vec<RunId>,
    pub events: usize,
    pub spans: usize,
    pub failed_spans: usize,
    pub generation_calls: usize,
    pub failed_generation_calls: usize,
    pub tool_calls: usize,
    pub failed_tool_calls: usize,
    pub validation_errors: usize,
    pub artifacts: usize,
    pub tokens: TokenUsage,
    pub cost: f64,
    /// Duration recorded on root span ends
    pub duration_ms: u64,
}

impl TraceSummary {
    pub fn from_records(records: &[TraceRecord]) -> Self {
        let mut summary = Self {
            events: records.len(),
            ..Default::default()
        };

        for record in records {
            if !summary.run_ids.contains(&record.run_id) {
                summary.run_ids.push(record.run_id.clone());
            }
            match &record.event {
                TraceEvent::SpanStart { .. } => summary.spans += 1,
                TraceEvent::SpanEnd {
                    parent,
                    duration_ms,
                    error,
                    ..
                } => {
                    if error.is_some() {
                        summary.failed_spans += 1;
                    }
                    if parent.is_none() {
                        summary.duration_ms += duration_ms;
                    }
                }
                TraceEvent::GenerationCall {
                    error,
                    tokens,
                    cost,
                    ..
                } => {
                    summary.generation_calls += 1;
                    if error.is_some() {
                        summary.failed_generation_calls += 1;
                    }
                    if let Some(t) = tokens {
                        summary.tokens.add(t);
                    }
                    summary.cost += cost.unwrap_or(0.0);
                }
                TraceEvent::ToolCall { error, .. } => {
                    summary.tool_calls += 1;
                    if error.is_some() {
                        summary.failed_tool_calls += 1;
                    }
                }
                TraceEvent::ValidationError { .. } => summary.validation_errors += 1,
                TraceEvent::Artifact { .. } => summary.artifacts += 1,
                TraceEvent::Event { .. } => {}
            }
        }
        summary
    }

    /// Merge another summary into this one
    pub fn merge(&mut self, other: &TraceSummary) {
        for id in &other.run_ids {
            if !self.run_ids.contains(id) {
                self.run_ids.push(id.clone());
            }
        }
        self.events += other.events;
        self.spans += other.spans;
        self.failed_spans += other.failed_spans;
        self.generation_calls += other.generation_calls;
        self.failed_generation_calls += other.failed_generation_calls;
        self.tool_calls += other.tool_calls;
        self.failed_tool_calls += other.failed_tool_calls;
        self.validation_errors += other.validation_errors;
        self.artifacts += other.artifacts;
        self.tokens.add(&other.tokens);
        self.cost += other.cost;
        self.duration_ms += other.duration_ms;
    }
}
