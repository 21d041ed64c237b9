use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use super::LlmBackend;
use crate::error_handler::LlmError;

/// Scripted backend for tests and offline runs.
///
/// Queued responses are served first, in order. After that a response is
/// chosen by the first rule whose pattern occurs in the prompt, then the
/// default response. With neither, the call fails as unavailable.
#[derive(Debug, Default)]
pub struct MockBackend {
    offline: bool,
    queued: Mutex<VecDeque<String>>,
    rules: Vec<(String, String)>,
    default_response: Option<String>,
    failure: Option<LlmError>,
    calls: AtomicUsize,
    availability_calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports `is_available() == false` and fails every call.
    pub fn unavailable() -> Self {
        Self {
            offline: true,
            ..Self::default()
        }
    }

    pub fn with_response(mut self, prompt_contains: &str, response: &str) -> Self {
        self.rules
            .push((prompt_contains.to_string(), response.to_string()));
        self
    }

    /// Answer the next calls with `responses`, one each, before any rule applies.
    pub fn with_sequence(self, responses: &[&str]) -> Self {
        if let Ok(mut queued) = self.queued.lock() {
            queued.extend(responses.iter().map(|r| r.to_string()));
        }
        self
    }

    pub fn with_default_response(mut self, response: &str) -> Self {
        self.default_response = Some(response.to_string());
        self
    }

    /// Stay available but fail every generation with `error`.
    pub fn failing(mut self, error: LlmError) -> Self {
        self.failure = Some(error);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `is_available` calls so far.
    pub fn availability_checks(&self) -> usize {
        self.availability_calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts
            .lock()
            .map(|prompts| prompts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn is_available(&self) -> bool {
        self.availability_calls.fetch_add(1, Ordering::SeqCst);
        !self.offline
    }

    async fn generate(
        &self,
        prompt: &str,
        _system_prompt: Option<&str>,
        _context_chunks: &[String],
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }

        if self.offline {
            return Err(LlmError::Unavailable("mock backend is offline".to_string()));
        }
        if let Some(error) = &self.failure {
            return Err(error.clone());
        }
        if let Some(next) = self.queued.lock().ok().and_then(|mut queued| queued.pop_front()) {
            return Ok(next);
        }

        self.rules
            .iter()
            .find(|(pattern, _)| prompt.contains(pattern.as_str()))
            .map(|(_, response)| response.clone())
            .or_else(|| self.default_response.clone())
            .ok_or_else(|| LlmError::Unavailable("no scripted response".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rules_take_precedence_over_default() {
        let mock = MockBackend::new()
            .with_response("hazard", "[]")
            .with_default_response("{}");

        assert_eq!(mock.generate("identify hazard", None, &[], 0.1, 10).await.unwrap(), "[]");
        assert_eq!(mock.generate("other", None, &[], 0.1, 10).await.unwrap(), "{}");
        assert_eq!(mock.call_count(), 2);
        assert_eq!(mock.prompts(), vec!["identify hazard", "other"]);
    }

    #[tokio::test]
    async fn test_sequence_served_before_rules() {
        let mock = MockBackend::new()
            .with_sequence(&["first", "second"])
            .with_default_response("rest");

        assert_eq!(mock.generate("a", None, &[], 0.1, 10).await.unwrap(), "first");
        assert_eq!(mock.generate("b", None, &[], 0.1, 10).await.unwrap(), "second");
        assert_eq!(mock.generate("c", None, &[], 0.1, 10).await.unwrap(), "rest");
        assert!(mock.is_available().await);
        assert_eq!(mock.availability_checks(), 1);
    }

    #[tokio::test]
    async fn test_failure_modes() {
        let offline = MockBackend::unavailable().with_default_response("{}");
        assert!(!offline.is_available().await);
        assert!(offline.generate("p", None, &[], 0.1, 10).await.is_err());

        let timing_out = MockBackend::new().failing(LlmError::Timeout(30));
        assert!(timing_out.is_available().await);
        assert_eq!(
            timing_out.generate("p", None, &[], 0.1, 10).await,
            Err(LlmError::Timeout(30))
        );
    }
}
