//! Trace event types
//!
//! Each line of a trace stream is one [`TraceRecord`]: an envelope carrying
//! the run, span, sequence number and timestamp, flattened together with a
//! `"type"`-tagged [`TraceEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::{RunId, SpanId};
use crate::generation::TokenUsage;
use crate::schema::{Direction, ValidationIssue};

/// A single trace entry as written to a sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Position in the run's emission order, starting at 0
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub run_id: RunId,
    /// Span the event is attached to (the span itself for start/end)
    pub span_id: SpanId,
    #[serde(flatten)]
    pub event: TraceEvent,
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    SpanStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<SpanId>,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    SpanEnd {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<SpanId>,
        name: String,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenUsage>,
    },
    GenerationCall {
        model: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_hash: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parsed: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tokens: Option<TokenUsage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
    },
    ToolCall {
        tool: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ValidationError {
        direction: Direction,
        issues: Vec<ValidationIssue>,
    },
    Artifact {
        name: String,
        payload: Value,
    },
    Event {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
}

impl TraceEvent {
    /// The snake_case tag this event serializes with
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::SpanStart { .. } => "span_start",
            TraceEvent::SpanEnd { .. } => "span_end",
            TraceEvent::GenerationCall { .. } => "generation_call",
            TraceEvent::ToolCall { .. } => "tool_call",
            TraceEvent::ValidationError { .. } => "validation_error",
            TraceEvent::Artifact { .. } => "artifact",
            TraceEvent::Event { .. } => "event",
        }
    }

    /// Error message carried by the event, if any
    pub fn error(&self) -> Option<&str> {
        match self {
            TraceEvent::SpanEnd { error, .. }
            | TraceEvent::GenerationCall { error, .. }
            | TraceEvent::ToolCall { error, .. } => error.as_deref(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_serializes_flat_with_type_tag() {
        let record = TraceRecord {
            seq: 3,
            timestamp: Utc::now(),
            run_id: RunId::from("run-1"),
            span_id: SpanId::from("span-2"),
            event: TraceEvent::ValidationError {
                direction: Direction::Input,
                issues: vec![ValidationIssue::new("", "too short")],
            },
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "validation_error");
        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["span_id"], "span-2");
        assert_eq!(value["direction"], "input");
        assert_eq!(value["issues"][0]["message"], "too short");

        let back: TraceRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn optional_fields_are_omitted() {
        let record = TraceRecord {
            seq: 0,
            timestamp: Utc::now(),
            run_id: RunId::from("r"),
            span_id: SpanId::from("s"),
            event: TraceEvent::SpanStart {
                parent: None,
                name: "root".to_string(),
                metadata: None,
            },
        };
        let value = serde_json::to_value(&record).unwrap();
        assert!(value.get("parent").is_none());
        assert!(value.get("metadata").is_none());

        let parsed: TraceRecord = serde_json::from_value(json!({
            "seq": 1,
            "timestamp": "2026-01-01T00:00:00Z",
            "run_id": "r",
            "span_id": "s",
            "type": "span_end",
            "name": "root",
            "duration_ms": 12
        }))
        .unwrap();
        assert_eq!(parsed.event.kind(), "span_end");
        assert_eq!(parsed.event.error(), None);
    }
}
