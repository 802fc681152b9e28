//! Generation backends

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::types::{BackendResponse, GenerationRequest};
use crate::config::{BackendConfig, BackendProvider};
use crate::error::{Result, StepwiseError};

#[cfg(feature = "backend-openai")]
use super::openai::OpenAiBackend;

/// A generative model behind a single request/response call
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Provider tag; part of every cache key
    fn provider(&self) -> &str;

    /// Model actually sent for a request naming `requested`; an empty name
    /// means the backend's default.
    fn resolve_model(&self, requested: &str) -> String {
        requested.to_string()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse>;
}

/// Backend used when nothing is configured; every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct StubBackend;

#[async_trait]
impl GenerationBackend for StubBackend {
    fn provider(&self) -> &str {
        "stub"
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<BackendResponse> {
        Err(StepwiseError::Backend(
            "No generation backend configured".to_string(),
        ))
    }
}

type Responder = dyn Fn(&GenerationRequest) -> Result<BackendResponse> + Send + Sync;

/// Deterministic backend for tests and demos.
///
/// Queued responses are consumed first, in order; after that the responder
/// closure (if any) answers. A backend with neither left fails the call.
pub struct ScriptedBackend {
    provider: String,
    default_model: Option<String>,
    queue: Mutex<VecDeque<Result<BackendResponse>>>,
    responder: Option<Box<Responder>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self {
            provider: "scripted".to_string(),
            default_model: None,
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with a closure
    pub fn from_fn<F>(responder: F) -> Self
    where
        F: Fn(&GenerationRequest) -> Result<BackendResponse> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    /// Model substituted for requests that leave `model` empty
    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Queue a plain-text response
    pub fn respond(self, text: impl Into<String>) -> Self {
        self.respond_with(BackendResponse::text(text))
    }

    pub fn respond_with(self, response: BackendResponse) -> Self {
        self.push(Ok(response));
        self
    }

    /// Queue a failure
    pub fn fail(self, message: impl Into<String>) -> Self {
        self.push(Err(StepwiseError::Backend(message.into())));
        self
    }

    fn push(&self, item: Result<BackendResponse>) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(item);
    }

    /// Number of times `generate` was called
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Requests received so far
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for ScriptedBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn resolve_model(&self, requested: &str) -> String {
        match &self.default_model {
            Some(model) if requested.is_empty() => model.clone(),
            _ => requested.to_string(),
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<BackendResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .map_err(|e| StepwiseError::Backend(format!("Failed to record request: {}", e)))?
            .push(request.clone());

        let queued = self
            .queue
            .lock()
            .map_err(|e| StepwiseError::Backend(format!("Failed to lock script: {}", e)))?
            .pop_front();
        if let Some(item) = queued {
            return item;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Err(StepwiseError::Backend(
                "Scripted backend has no responses left".to_string(),
            )),
        }
    }
}

/// Factory for creating backends from configuration
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be created (e.g., missing API key
    /// or a provider compiled out).
    pub fn create(config: &BackendConfig) -> Result<Arc<dyn GenerationBackend>> {
        match config.provider {
            BackendProvider::Stub => Ok(Arc::new(StubBackend)),

            #[cfg(feature = "backend-openai")]
            BackendProvider::OpenAi => {
                let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                    StepwiseError::Configuration(format!(
                        "{} environment variable not set",
                        config.api_key_env
                    ))
                })?;
                let backend = match &config.base_url {
                    Some(base_url) => {
                        OpenAiBackend::with_base_url(api_key, config.model.clone(), base_url.clone())
                    }
                    None => OpenAiBackend::new(api_key, config.model.clone()),
                };
                Ok(Arc::new(backend))
            }

            #[cfg(not(feature = "backend-openai"))]
            BackendProvider::OpenAi => Err(StepwiseError::Configuration(
                "OpenAI backend requires 'backend-openai' feature".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_backend_drains_queue_then_responder() {
        let backend = ScriptedBackend::from_fn(|req| {
            Ok(BackendResponse::text(format!("echo:{}", req.messages.len())))
        })
        .respond("first")
        .fail("second fails");

        let req = GenerationRequest::new("m").user("hi");
        assert_eq!(backend.generate(&req).await.unwrap().text, "first");
        assert!(backend.generate(&req).await.is_err());
        assert_eq!(backend.generate(&req).await.unwrap().text, "echo:1");
        assert_eq!(backend.calls(), 3);
        assert_eq!(backend.requests().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_script_fails() {
        let backend = ScriptedBackend::new();
        let err = backend
            .generate(&GenerationRequest::new("m"))
            .await
            .unwrap_err();
        assert!(matches!(err, StepwiseError::Backend(_)));
    }

    #[tokio::test]
    async fn factory_builds_stub() {
        let backend = BackendFactory::create(&BackendConfig::default()).unwrap();
        assert_eq!(backend.provider(), "stub");
        assert!(backend.generate(&GenerationRequest::new("m")).await.is_err());
    }
}
