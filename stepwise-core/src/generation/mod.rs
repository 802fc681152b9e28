//! Cache-aware generation calls
//!
//! [`generate`] issues one request to the context's backend, short-circuiting
//! through the context's cache when one is configured:
//!
//! - the cache key is the canonical JSON of the request, with the model the
//!   backend will actually use (see [`cache_key`]),
//!   so logically identical requests share an entry regardless of key order
//! - hits return the stored result and emit nothing
//! - misses call the backend and emit exactly one `generation_call` event
//! - with a schema, output is decoded as JSON (falling back to the raw text)
//!   and validated; invalid output fails with a validation error and is
//!   never cached

mod backend;
mod cache;
#[cfg(feature = "backend-openai")]
mod openai;
mod types;

pub use backend::{BackendFactory, GenerationBackend, ScriptedBackend, StubBackend};
pub use cache::{Cache, FileCache, MemoryCache};
#[cfg(feature = "backend-openai")]
pub use openai::OpenAiBackend;
pub use types::{
    BackendResponse, GenerationRequest, GenerationResult, Message, MessageRole, TokenUsage,
    ToolDescriptor,
};

use serde_json::{json, Value};
use tracing::debug;

use crate::canonical::{canonical_json, sha256_hex};
use crate::context::ExecutionContext;
use crate::error::{Result, StepwiseError};
use crate::schema::Direction;
use crate::trace::TraceEvent;

/// Deterministic cache key for a request sent to `provider`.
pub fn cache_key(provider: &str, request: &GenerationRequest) -> String {
    let key = json!({
        "provider": provider,
        "model": request.model,
        "messages": request.messages,
        "schema": request.schema.as_ref().map(|s| s.id()),
        "temperature": request.temperature.unwrap_or(0.0),
        "max_output_tokens": request.max_output_tokens,
        "tools": request.tools,
    });
    canonical_json(&key)
}

/// Decode model output as JSON, tolerating a surrounding code fence; falls
/// back to the raw text as a JSON string.
pub fn parse_output(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return value;
    }
    if let Some(inner) = strip_code_fence(trimmed) {
        if let Ok(value) = serde_json::from_str(inner) {
            return value;
        }
    }
    Value::String(raw.to_string())
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("```")?;
    let body = rest.strip_suffix("```")?;
    // drop an optional language tag on the opening line
    let body = match body.find('\n') {
        Some(newline) if !body[..newline].trim().contains(' ') => &body[newline + 1..],
        _ => body,
    };
    Some(body.trim())
}

fn request_params(request: &GenerationRequest) -> Value {
    json!({
        "temperature": request.temperature,
        "max_output_tokens": request.max_output_tokens,
        "schema": request.schema.as_ref().map(|s| s.id()),
        "tools": request.tools.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
    })
}

/// Run one generation request in `ctx`.
///
/// # Errors
///
/// Backend errors are returned unchanged. Output that fails the request's
/// schema yields [`StepwiseError::Validation`] with direction `output`.
pub async fn generate(
    ctx: &ExecutionContext,
    request: &GenerationRequest,
) -> Result<GenerationResult> {
    let backend = ctx.backend();
    // Key and trace carry the model actually sent, not an empty default.
    let model = backend.resolve_model(&request.model);
    let resolved;
    let request = if model == request.model {
        request
    } else {
        resolved = GenerationRequest {
            model,
            ..request.clone()
        };
        &resolved
    };
    let key = cache_key(backend.provider(), request);
    let request_hash = sha256_hex(&key);

    if let Some(cache) = ctx.cache() {
        if let Some(value) = cache.get(&key).await? {
            let mut result: GenerationResult = serde_json::from_value(value).map_err(|e| {
                StepwiseError::Cache(format!("Cached generation result is unreadable: {}", e))
            })?;
            debug!(run_id = %ctx.run_id(), request_hash = %request_hash, "generation cache hit");
            result.cached = true;
            return Ok(result);
        }
        debug!(run_id = %ctx.run_id(), request_hash = %request_hash, "generation cache miss");
    }

    let trace = ctx.trace();
    let response = match backend.generate(request).await {
        Ok(response) => response,
        Err(e) => {
            trace.emit(
                ctx.span_id(),
                TraceEvent::GenerationCall {
                    model: request.model.clone(),
                    params: Some(request_params(request)),
                    request_hash: Some(request_hash),
                    raw: None,
                    parsed: None,
                    error: Some(e.to_string()),
                    tokens: None,
                    cost: None,
                },
            );
            return Err(e);
        }
    };
    trace.record_usage(response.usage.as_ref(), response.cost);

    let parsed = match &request.schema {
        None => None,
        Some(schema) => {
            let candidate = parse_output(&response.text);
            if let Err(issues) = schema.validate(&candidate) {
                let err = StepwiseError::validation(Direction::Output, issues.clone());
                trace.emit(
                    ctx.span_id(),
                    TraceEvent::GenerationCall {
                        model: request.model.clone(),
                        params: Some(request_params(request)),
                        request_hash: Some(request_hash),
                        raw: Some(response.text.clone()),
                        parsed: Some(candidate),
                        error: Some(err.to_string()),
                        tokens: response.usage,
                        cost: response.cost,
                    },
                );
                trace.emit(
                    ctx.span_id(),
                    TraceEvent::ValidationError {
                        direction: Direction::Output,
                        issues,
                    },
                );
                return Err(err);
            }
            Some(candidate)
        }
    };

    trace.emit(
        ctx.span_id(),
        TraceEvent::GenerationCall {
            model: request.model.clone(),
            params: Some(request_params(request)),
            request_hash: Some(request_hash),
            raw: Some(response.text.clone()),
            parsed: parsed.clone(),
            error: None,
            tokens: response.usage,
            cost: response.cost,
        },
    );

    let result = GenerationResult {
        raw: response.text,
        parsed,
        usage: response.usage,
        cost: response.cost,
        cached: false,
    };

    if let Some(cache) = ctx.cache() {
        cache.set(&key, serde_json::to_value(&result)?).await?;
    }
    Ok(result)
}
