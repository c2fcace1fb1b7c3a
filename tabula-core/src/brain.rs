//! Brain module: LLM provider abstraction.
//!
//! Defines the `LlmProvider` trait for model-agnostic completions and a
//! `MockLlmProvider` with queued responses for tests.

use crate::error::LlmError;
use crate::types::{CompletionRequest, CompletionResponse, Content, Message, Role, TokenUsage};
use async_trait::async_trait;

/// Trait for LLM providers.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;

    /// Whether `CompletionRequest::tools` is honoured.
    fn supports_tools(&self) -> bool;

    fn model_name(&self) -> &str;

    /// Single-prompt text generation.
    async fn generate(&self, system: &str, prompt: &str) -> Result<String, LlmError> {
        let mut messages = Vec::with_capacity(2);
        if !system.is_empty() {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(prompt));
        let response = self
            .complete(CompletionRequest {
                messages,
                ..Default::default()
            })
            .await?;
        response
            .message
            .content
            .joined_text()
            .ok_or_else(|| LlmError::ResponseParse {
                message: "Model returned no text content".to_string(),
            })
    }
}

/// A mock LLM provider for testing.
pub struct MockLlmProvider {
    model: String,
    responses: std::sync::Mutex<Vec<Result<CompletionResponse, String>>>,
    requests: std::sync::Mutex<Vec<CompletionRequest>>,
}

impl MockLlmProvider {
    pub fn new() -> Self {
        Self {
            model: "mock-model".to_string(),
            responses: std::sync::Mutex::new(Vec::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Mock answering every call (up to 20) with `text`.
    pub fn with_response(text: &str) -> Self {
        let provider = Self::new();
        for _ in 0..20 {
            provider.queue_response(Self::text_response(text));
        }
        provider
    }

    /// Responses are returned in FIFO order.
    pub fn queue_response(&self, response: CompletionResponse) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(Ok(response));
        }
    }

    /// Queue an API failure for the next `complete` call.
    pub fn queue_error(&self, message: &str) {
        if let Ok(mut responses) = self.responses.lock() {
            responses.push(Err(message.to_string()));
        }
    }

    /// Number of requests received so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// The most recent request, if any.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().ok().and_then(|r| r.last().cloned())
    }

    pub fn text_response(text: &str) -> CompletionResponse {
        CompletionResponse {
            message: Message::assistant(text),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 50,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("stop".to_string()),
        }
    }

    pub fn tool_call_response(tool_name: &str, arguments: serde_json::Value) -> CompletionResponse {
        let call_id = format!("call_{}", uuid::Uuid::new_v4());
        CompletionResponse {
            message: Message::new(
                Role::Assistant,
                Content::tool_call(&call_id, tool_name, arguments),
            ),
            usage: TokenUsage {
                input_tokens: 100,
                output_tokens: 30,
            },
            model: "mock-model".to_string(),
            finish_reason: Some("tool_calls".to_string()),
        }
    }
}

impl Default for MockLlmProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockLlmProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }
        let next = self
            .responses
            .lock()
            .ok()
            .and_then(|mut r| if r.is_empty() { None } else { Some(r.remove(0)) });
        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(message)) => Err(LlmError::ApiRequest { message }),
            None => Ok(MockLlmProvider::text_response(
                "I'm a mock LLM. No queued responses available.",
            )),
        }
    }

    fn supports_tools(&self) -> bool {
        true
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_queue_order() {
        let provider = MockLlmProvider::new();
        provider.queue_response(MockLlmProvider::text_response("first"));
        provider.queue_response(MockLlmProvider::text_response("second"));

        let a = provider.generate("", "q").await.unwrap();
        let b = provider.generate("", "q").await.unwrap();
        assert_eq!(a, "first");
        assert_eq!(b, "second");
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_provider_queued_error() {
        let provider = MockLlmProvider::new();
        provider.queue_error("upstream down");
        let err = provider.generate("", "q").await.unwrap_err();
        assert!(matches!(err, LlmError::ApiRequest { .. }));
    }

    #[tokio::test]
    async fn test_generate_includes_system_message() {
        let provider = MockLlmProvider::with_response("ok");
        provider.generate("be terse", "hello").await.unwrap();
        let request = provider.last_request().unwrap();
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].content.as_text(), Some("hello"));
    }

    #[tokio::test]
    async fn test_generate_rejects_tool_only_reply() {
        let provider = MockLlmProvider::new();
        provider.queue_response(MockLlmProvider::tool_call_response(
            "run_procedure",
            serde_json::json!({}),
        ));
        let err = provider.generate("", "q").await.unwrap_err();
        assert!(matches!(err, LlmError::ResponseParse { .. }));
    }
}
