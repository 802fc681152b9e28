//! Built-in demo targets and tools
//!
//! `echo` needs nothing. `summarize` drafts a JSON summary with the
//! configured backend and counts its words with the `word_count` tool.

use std::sync::Arc;

use stepwise_core::prelude::*;

/// Targets the CLI can run by name
pub fn targets() -> Result<TargetRegistry> {
    let mut registry = TargetRegistry::new();
    registry.register(Arc::new(echo()?));
    registry.register(Arc::new(summarize()?));
    Ok(registry)
}

/// Tools available to every demo run
pub fn tools() -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(word_count()?));
    Ok(registry)
}

fn echo() -> Result<Step> {
    Ok(Step::builder("echo")
        .description("Return the input unchanged")
        .handler(|_ctx, input| async move { Ok(input) }))
}

fn summary_schema() -> Result<Schema> {
    Schema::new(json!({
        "type": "object",
        "properties": {"summary": {"type": "string", "minLength": 1}},
        "required": ["summary"]
    }))
}

fn summarize() -> Result<Workflow> {
    let schema = summary_schema()?;
    let draft = Step::builder("draft")
        .description("Ask the model for a one-sentence summary")
        .input_schema(Schema::non_empty_string()?)
        .output_schema(schema.clone())
        .handler(move |ctx, input| {
            let schema = schema.clone();
            async move {
                let text = input.as_str().unwrap_or_default();
                let request = GenerationRequest::default()
                    .system(
                        "Summarize the user's text in one sentence. \
                         Reply with JSON: {\"summary\": \"...\"}",
                    )
                    .user(text)
                    .with_temperature(0.0)
                    .with_schema(schema);
                Ok(ctx.generate(request).await?.value())
            }
        });

    let count = Step::builder("count")
        .description("Attach the summary's word count")
        .handler(|ctx, input| async move {
            let summary = input["summary"].clone();
            let words = ctx.call_tool("word_count", summary.clone()).await?;
            Ok(json!({"summary": summary, "words": words}))
        });

    Workflow::builder("summarize")
        .description("Summarize text and count the summary's words")
        .input_schema(Schema::non_empty_string()?)
        .step(draft)
        .step(count)
        .build()
}

fn word_count() -> Result<FnTool> {
    Ok(FnTool::new("word_count", |_ctx, input| async move {
        let text = input.as_str().unwrap_or_default();
        Ok(json!(text.split_whitespace().count()))
    })
    .with_description("Count whitespace-separated words in a string")
    .with_input_schema(Schema::non_empty_string()?)
    .with_output_schema(Schema::new(json!({"type": "integer", "minimum": 0}))?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(backend: Arc<ScriptedBackend>) -> Runtime {
        Runtime::builder()
            .backend(backend)
            .tools(tools().unwrap())
            .build()
    }

    #[test]
    fn test_registry_names() {
        let targets = targets().unwrap();
        assert_eq!(targets.names(), vec!["echo", "summarize"]);
        assert_eq!(targets.get("summarize").unwrap().kind(), TargetKind::Workflow);
    }

    #[tokio::test]
    async fn test_summarize_with_scripted_backend() {
        let backend = Arc::new(ScriptedBackend::new().respond(r#"{"summary": "Rust is fast."}"#));
        let targets = targets().unwrap();
        let summarize = targets.get("summarize").unwrap();

        let outcome = runtime(backend)
            .run(summarize.as_ref(), json!("Rust is a fast, memory-safe language."))
            .await
            .unwrap();
        assert_eq!(outcome.output, json!({"summary": "Rust is fast.", "words": 3}));
    }

    #[tokio::test]
    async fn test_summarize_rejects_empty_text() {
        let targets = targets().unwrap();
        let summarize = targets.get("summarize").unwrap();

        let err = runtime(Arc::new(ScriptedBackend::new()))
            .run(summarize.as_ref(), json!(""))
            .await
            .unwrap_err();
        assert_eq!(err.source.validation_direction(), Some(Direction::Input));
    }
}
