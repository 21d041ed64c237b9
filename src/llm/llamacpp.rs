use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{render_prompt_with_context, LlmBackend};
use crate::error_handler::LlmError;

/// llama.cpp `server` binary, raw completion endpoint.
pub struct LlamaCppBackend {
    http_client: Client,
    base_url: String,
    timeout_secs: u64,
}

#[derive(Serialize)]
struct CompletionRequest {
    prompt: String,
    n_predict: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    content: String,
}

impl LlamaCppBackend {
    pub fn new(base_url: &str, timeout_secs: u64) -> Self {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
        }
    }

    fn build_prompt(prompt: &str, system_prompt: Option<&str>, context_chunks: &[String]) -> String {
        let body = render_prompt_with_context(prompt, context_chunks);
        match system_prompt {
            Some(system) => format!("{}\n\n{}\n\nResponse:\n", system, body),
            None => format!("{}\n\nResponse:\n", body),
        }
    }
}

#[async_trait]
impl LlmBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llamacpp"
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .http_client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(base_url = %self.base_url, error = %e, "llama.cpp server not reachable");
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
        let request = CompletionRequest {
            prompt: Self::build_prompt(prompt, system_prompt, context_chunks),
            n_predict: max_tokens,
            temperature,
            stream: false,
        };

        let response = self
            .http_client
            .post(format!("{}/completion", self.base_url))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout(self.timeout_secs)
                } else {
                    LlmError::from(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Http(format!("{}: {}", status, error_text)));
        }

        let completion: CompletionResponse = response.json().await?;
        Ok(completion.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_layout() {
        let prompt = LlamaCppBackend::build_prompt("list features", Some("be precise"), &[]);
        assert_eq!(prompt, "be precise\n\nlist features\n\nResponse:\n");

        let with_context =
            LlamaCppBackend::build_prompt("q", None, &["void f(void) {}".to_string()]);
        assert!(with_context.starts_with("Context:\n---\nvoid f(void) {}"));
    }
}
