use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone)]
pub struct LLMResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRequest>,
}

impl LLMResponse {
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub role: String,
    pub content: String,
    /// OpenAI-style content blocks (`[{"type":"text",...},
    /// {"type":"image_url",...}]`), set only on the current turn's
    /// user message when it carries image attachments. When present,
    /// providers send this instead of `content`.
    pub content_blocks: Option<Value>,
    pub tool_calls: Option<Vec<ToolCallRequest>>,
    pub tool_call_id: Option<String>,
    pub is_error: bool,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Option<Vec<ToolCallRequest>>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
            tool_calls,
            ..Default::default()
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            is_error,
            ..Default::default()
        }
    }

    pub fn user_with_blocks(text: impl Into<String>, blocks: Value) -> Self {
        let text = text.into();
        Self {
            role: "user".into(),
            content_blocks: Some(blocks),
            content: text,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ProviderMetrics {
    pub request_count: u64,
    pub token_count: u64,
    pub error_count: u64,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// The contract every LLM backend implements. The agent loop calls
/// `chat` directly — no retry within a turn (§4.9 point 6); `chat_with_retry`
/// is kept for callers outside a turn (e.g. startup health checks)
/// that want backoff.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<LLMResponse>;

    fn default_model(&self) -> &str;

    async fn chat_with_retry(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
        retry_config: Option<RetryConfig>,
    ) -> anyhow::Result<LLMResponse> {
        let config = retry_config.unwrap_or_default();
        let mut last_error = None;

        let messages_arc = Arc::new(messages);
        let tools_arc = tools.map(Arc::new);

        for attempt in 0..=config.max_retries {
            match self
                .chat(
                    (*messages_arc).clone(),
                    tools_arc.as_ref().map(|t| (**t).clone()),
                    model,
                    max_tokens,
                    temperature,
                )
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < config.max_retries {
                        let delay = (config.initial_delay_ms as f64
                            * config.backoff_multiplier.powi(attempt as i32))
                        .min(config.max_delay_ms as f64) as u64;
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("All retry attempts failed")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyProvider {
        failures_before_success: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for FlakyProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Option<Vec<ToolDefinition>>,
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LLMResponse> {
            use std::sync::atomic::Ordering;
            if self.failures_before_success.fetch_sub(1, Ordering::SeqCst) > 1 {
                anyhow::bail!("simulated transient failure")
            }
            Ok(LLMResponse {
                content: Some("ok".to_string()),
                tool_calls: vec![],
            })
        }

        fn default_model(&self) -> &str {
            "stub-model"
        }
    }

    #[tokio::test]
    async fn chat_with_retry_recovers_after_transient_failures() {
        let provider = FlakyProvider {
            failures_before_success: std::sync::atomic::AtomicUsize::new(3),
        };
        let retry_config = RetryConfig {
            max_retries: 5,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 1.0,
        };
        let result = provider
            .chat_with_retry(vec![Message::user("hi")], None, None, 100, 0.0, Some(retry_config))
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn has_tool_calls_reflects_contents() {
        let empty = LLMResponse { content: None, tool_calls: vec![] };
        assert!(!empty.has_tool_calls());
    }
}
