//! Language-model backends and the helpers every generation stage shares.
//!
//! Stages only see the [`LlmBackend`] capability. Which implementation sits
//! behind it (local OpenAI-compatible server, llama.cpp server, or the
//! scripted mock) is decided once from configuration.

pub mod llamacpp;
pub mod local_server;
pub mod mock;
pub mod params;
pub mod response_parser;

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::error_handler::{ErrorKind, LlmError, StageIssue};
use crate::llm::params::Operation;
use crate::llm::response_parser::{ExpectedShape, LlmResponseParser};

pub use llamacpp::LlamaCppBackend;
pub use local_server::LocalServerBackend;
pub use mock::MockBackend;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert in medical device software regulation \
(IEC 62304, ISO 14971). Analyze source code precisely and answer ONLY with JSON in the requested format.";

#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn is_available(&self) -> bool;

    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        context_chunks: &[String],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError>;
}

pub type SharedBackend = Arc<dyn LlmBackend>;

/// Issue a generation call with the registered parameters for `operation`.
pub async fn generate_for(
    backend: &dyn LlmBackend,
    operation: Operation,
    prompt: &str,
    context_chunks: &[String],
) -> Result<String, LlmError> {
    let params = operation.params();
    debug!(
        backend = backend.name(),
        operation = operation.name(),
        temperature = params.temperature,
        max_tokens = params.max_tokens,
        prompt_chars = prompt.len(),
        "issuing LLM request"
    );
    let text = backend
        .generate(
            prompt,
            Some(DEFAULT_SYSTEM_PROMPT),
            context_chunks,
            params.temperature,
            params.max_tokens,
        )
        .await?;
    if text.trim().is_empty() {
        return Err(LlmError::EmptyResponse);
    }
    Ok(text)
}

/// Why a structured LLM call produced nothing usable.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallFailure {
    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error("malformed LLM response: {0}")]
    Malformed(String),
}

impl From<CallFailure> for StageIssue {
    fn from(failure: CallFailure) -> Self {
        let kind = match failure {
            CallFailure::Llm(_) => ErrorKind::LlmUnavailable,
            CallFailure::Malformed(_) => ErrorKind::ResponseParse,
        };
        StageIssue::new(kind, failure.to_string())
    }
}

/// Generate and parse JSON of the expected shape. A malformed response is
/// retried once; backend errors are not retried.
pub async fn request_json(
    backend: &dyn LlmBackend,
    operation: Operation,
    prompt: &str,
    context_chunks: &[String],
    expected: ExpectedShape,
) -> Result<Value, CallFailure> {
    let mut last_error = String::new();
    for attempt in 1..=2 {
        let raw = generate_for(backend, operation, prompt, context_chunks).await?;
        let parsed = LlmResponseParser::parse(&raw, expected);
        match parsed.data {
            Some(data) if parsed.success => return Ok(data),
            _ => {
                last_error = parsed.error.unwrap_or_default();
                debug!(operation = operation.name(), attempt, error = %last_error, "unparseable LLM response");
            }
        }
    }
    Err(CallFailure::Malformed(last_error))
}

/// Resolve an optional backend to one that is reachable right now.
pub async fn available_backend(backend: Option<&SharedBackend>) -> Option<SharedBackend> {
    match backend {
        Some(backend) if backend.is_available().await => Some(Arc::clone(backend)),
        _ => None,
    }
}

/// The backend a stage talks to.
///
/// Standalone stages check it when they start. Inside an orchestrated run the
/// backend has already been checked once for the whole run and is trusted as is.
#[derive(Clone, Default)]
pub struct StageBackend {
    backend: Option<SharedBackend>,
    checked: bool,
}

impl StageBackend {
    pub fn unchecked(backend: Option<SharedBackend>) -> Self {
        Self { backend, checked: false }
    }

    pub fn checked(backend: Option<SharedBackend>) -> Self {
        Self { backend, checked: true }
    }

    /// Mark the held backend as already checked.
    pub fn into_checked(self) -> Self {
        Self::checked(self.backend)
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    pub async fn resolve(&self) -> Option<SharedBackend> {
        if self.checked {
            self.backend.clone()
        } else {
            available_backend(self.backend.as_ref()).await
        }
    }
}

/// Join a user prompt with retrieved context the way chat-style servers expect it.
pub(crate) fn render_prompt_with_context(prompt: &str, context_chunks: &[String]) -> String {
    if context_chunks.is_empty() {
        return prompt.to_string();
    }
    let mut full = String::from("Context:\n");
    for chunk in context_chunks {
        full.push_str("---\n");
        full.push_str(chunk);
        full.push('\n');
    }
    full.push_str("---\n\n");
    full.push_str(prompt);
    full
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_without_context_is_unchanged() {
        assert_eq!(render_prompt_with_context("hello", &[]), "hello");
    }

    #[test]
    fn test_prompt_with_context_wraps_chunks() {
        let rendered =
            render_prompt_with_context("question", &["int a;".to_string(), "int b;".to_string()]);
        assert!(rendered.starts_with("Context:\n---\nint a;\n---\nint b;\n---\n\n"));
        assert!(rendered.ends_with("question"));
    }

    #[tokio::test]
    async fn test_generate_for_rejects_blank_output() {
        let backend = MockBackend::new().with_default_response("   ");
        let result = generate_for(&backend, Operation::FeatureExtraction, "p", &[]).await;
        assert_eq!(result, Err(LlmError::EmptyResponse));
    }

    #[tokio::test]
    async fn test_request_json_retries_malformed_once() {
        let mock = MockBackend::new().with_default_response("no json here");
        let result = request_json(&mock, Operation::UserRequirements, "p", &[], ExpectedShape::Object).await;
        assert!(matches!(result, Err(CallFailure::Malformed(_))));
        assert_eq!(mock.call_count(), 2);

        let issue: StageIssue = result.unwrap_err().into();
        assert_eq!(issue.kind, ErrorKind::ResponseParse);
    }

    #[tokio::test]
    async fn test_request_json_does_not_retry_backend_errors() {
        let mock = MockBackend::new().failing(LlmError::Timeout(5));
        let result = request_json(&mock, Operation::UserRequirements, "p", &[], ExpectedShape::Object).await;
        assert_eq!(result, Err(CallFailure::Llm(LlmError::Timeout(5))));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn test_available_backend_filters_offline() {
        let offline: SharedBackend = Arc::new(MockBackend::unavailable());
        assert!(available_backend(Some(&offline)).await.is_none());

        let online: SharedBackend = Arc::new(MockBackend::new());
        assert!(available_backend(Some(&online)).await.is_some());
        assert!(available_backend(None).await.is_none());
    }

    #[tokio::test]
    async fn test_checked_stage_backend_is_not_asked_again() {
        let mock = Arc::new(MockBackend::new());
        let shared: SharedBackend = mock.clone();

        assert!(StageBackend::unchecked(Some(shared.clone())).resolve().await.is_some());
        assert_eq!(mock.availability_checks(), 1);

        let trusted = StageBackend::unchecked(Some(shared)).into_checked();
        assert!(trusted.resolve().await.is_some());
        assert!(trusted.resolve().await.is_some());
        assert_eq!(mock.availability_checks(), 1);

        assert!(StageBackend::checked(None).resolve().await.is_none());
        assert!(!StageBackend::default().is_configured());
    }
}
