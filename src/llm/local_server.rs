use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{render_prompt_with_context, LlmBackend};
use crate::error_handler::LlmError;

/// OpenAI-compatible chat completion server (Ollama, LM Studio, vLLM, ...).
pub struct LocalServerBackend {
    http_client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

impl LocalServerBackend {
    pub fn new(base_url: &str, model: &str, timeout_secs: u64) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: None,
            timeout_secs,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.is_empty());
        self
    }

    fn endpoint(&self, path: &str) -> String {
        // Accept base URLs given with or without the /v1 suffix.
        if self.base_url.ends_with("/v1") {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/v1/{}", self.base_url, path)
        }
    }

    fn map_error(&self, err: reqwest::Error) -> LlmError {
        if err.is_timeout() {
            LlmError::Timeout(self.timeout_secs)
        } else {
            LlmError::from(err)
        }
    }
}

#[async_trait]
impl LlmBackend for LocalServerBackend {
    fn name(&self) -> &str {
        "local_server"
    }

    async fn is_available(&self) -> bool {
        let mut request = self
            .http_client
            .get(self.endpoint("models"))
            .timeout(Duration::from_secs(5));
        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(base_url = %self.base_url, error = %e, "local LLM server not reachable");
                false
            }
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        context_chunks: &[String],
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let user_content = render_prompt_with_context(prompt, context_chunks);
        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = system_prompt {
            messages.push(ChatMessage {
                role: "system",
                content: system_prompt,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: &user_content,
        });

        let request = ChatRequest {
            model: &self.model,
            messages,
            max_tokens,
            temperature,
            stream: false,
        };

        let mut builder = self
            .http_client
            .post(self.endpoint("chat/completions"))
            .header("Content-Type", "application/json")
            .json(&request);
        if let Some(api_key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = builder.send().await.map_err(|e| self.map_error(e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!("{}: {}", status, error_text)));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| self.map_error(e))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_handles_v1_suffix() {
        let plain = LocalServerBackend::new("http://localhost:11434/", "llama3", 30);
        assert_eq!(
            plain.endpoint("chat/completions"),
            "http://localhost:11434/v1/chat/completions"
        );

        let versioned = LocalServerBackend::new("http://localhost:1234/v1", "llama3", 30);
        assert_eq!(versioned.endpoint("models"), "http://localhost:1234/v1/models");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unavailable() {
        let backend = LocalServerBackend::new("http://127.0.0.1:1", "llama3", 1);
        assert!(!backend.is_available().await);
        let result = backend.generate("p", None, &[], 0.1, 16).await;
        assert!(matches!(
            result,
            Err(LlmError::Unavailable(_)) | Err(LlmError::Http(_)) | Err(LlmError::Timeout(_))
        ));
    }
}
