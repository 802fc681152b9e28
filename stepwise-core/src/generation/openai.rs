//! OpenAI-compatible chat completions backend

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::backend::GenerationBackend;
use super::types::{BackendResponse, GenerationRequest, Message, MessageRole, TokenUsage};
use crate::error::{Result, StepwiseError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Chat completions over HTTP (OpenAI, Azure OpenAI, or any compatible server).
pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
}

impl OpenAiBackend {
    /// # Arguments
    ///
    /// * `api_key` - API key sent as a bearer token
    /// * `model` - Default model, used when a request leaves `model` empty
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Create from environment variables.
    ///
    /// Reads `OPENAI_API_KEY` (required), `OPENAI_MODEL` and `OPENAI_BASE_URL`.
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            StepwiseError::Configuration("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        let model = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());
        let base_url =
            std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Ok(Self::with_base_url(api_key, model, base_url))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatRequest {
        let model = self.resolve_model(&request.model);
        let tools = request
            .tools
            .iter()
            .map(|t| ChatTool {
                kind: "function",
                function: ChatFunction {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.parameters.clone(),
                },
            })
            .collect();

        ChatRequest {
            model,
            messages: convert_messages(&request.messages),
            temperature: request.temperature,
            max_tokens: request.max_output_tokens,
            response_format: request
                .schema
                .as_ref()
                .map(|_| serde_json::json!({"type": "json_object"})),
            tools,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ChatTool>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: ChatFunction,
}

#[derive(Serialize)]
struct ChatFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Value>,
}

#[derive(Deserialize)]
struct ChatUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

fn convert_messages(messages: &[Message]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| ChatMessage {
            role: match m.role {
                MessageRole::System => "system",
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
                MessageRole::Tool => "tool",
            },
            content: m.content.clone(),
        })
        .collect()
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn provider(&self) -> &str {
        "openai"
    }

    fn resolve_model(&self, requested: &str) -> String {
        if requested.is_empty() {
            self.model.clone()
        } else {
            requested.to_string()
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse> {
        let body = self.build_request(request);
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| StepwiseError::Backend(format!("Failed to send request: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            if let Ok(error) = serde_json::from_str::<ApiError>(&text) {
                return Err(StepwiseError::Backend(format!(
                    "API error ({}): {}",
                    error.error.error_type.unwrap_or_else(|| status.to_string()),
                    error.error.message
                )));
            }
            return Err(StepwiseError::Backend(format!(
                "API error ({}): {}",
                status, text
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| StepwiseError::Backend(format!("Failed to parse response: {}", e)))?;

        let message = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .ok_or_else(|| StepwiseError::Backend("API returned no choices".to_string()))?;

        // Tool calls come back without text content; surface them as JSON.
        let text = match (message.content, message.tool_calls) {
            (Some(content), _) if !content.is_empty() => content,
            (_, Some(calls)) => serde_json::to_string(&calls)?,
            (content, None) => content.unwrap_or_default(),
        };

        Ok(BackendResponse {
            text,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            cost: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ToolDescriptor;
    use crate::schema::Schema;

    #[test]
    fn request_body_carries_schema_and_tools() {
        let backend = OpenAiBackend::with_base_url("key", "fallback-model", "http://localhost:1/v1/");
        assert_eq!(backend.base_url(), "http://localhost:1/v1");

        let request = GenerationRequest::new("")
            .system("be brief")
            .user("hi")
            .with_schema(Schema::any())
            .with_max_output_tokens(64)
            .with_tools(vec![ToolDescriptor {
                name: "word_count".to_string(),
                description: "Count words".to_string(),
                parameters: serde_json::json!({"type": "object"}),
            }]);

        let body = serde_json::to_value(backend.build_request(&request)).unwrap();
        assert_eq!(body["model"], "fallback-model");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["tools"][0]["function"]["name"], "word_count");
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn default_model_is_part_of_the_cache_key() {
        let mini = OpenAiBackend::new("k", "gpt-4o-mini");
        let full = OpenAiBackend::new("k", "gpt-4o");
        let request = GenerationRequest::default().user("hi");

        let key_for = |backend: &OpenAiBackend| {
            let resolved = GenerationRequest {
                model: backend.resolve_model(&request.model),
                ..request.clone()
            };
            crate::generation::cache_key(backend.provider(), &resolved)
        };
        assert_ne!(key_for(&mini), key_for(&full));
        assert!(key_for(&mini).contains("gpt-4o-mini"));
        assert_eq!(full.resolve_model("pinned"), "pinned");
    }
}
