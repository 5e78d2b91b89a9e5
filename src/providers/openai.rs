use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::errors::ConductorError;

use super::base::{LLMProvider, LLMResponse, Message, ProviderMetrics, ToolCallRequest, ToolDefinition};

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Talks to any OpenAI-compatible `/chat/completions` endpoint —
/// the request/response shape this provider builds is the same one
/// `ToolCallRequest`/`ToolDefinition` are already modeled after.
pub struct OpenAiProvider {
    api_key: String,
    default_model: String,
    base_url: String,
    client: Client,
    metrics: Arc<Mutex<ProviderMetrics>>,
}

impl OpenAiProvider {
    pub fn new(api_key: String, base_url: String, default_model: String, request_timeout_secs: u64) -> Self {
        Self {
            api_key,
            default_model,
            base_url,
            client: Client::builder()
                .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
                .timeout(Duration::from_secs(request_timeout_secs))
                .build()
                .unwrap_or_else(|_| Client::new()),
            metrics: Arc::new(Mutex::new(ProviderMetrics::default())),
        }
    }

    async fn metrics_snapshot(&self) -> ProviderMetrics {
        self.metrics.lock().await.clone()
    }

    fn build_payload(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> Value {
        let openai_messages: Vec<Value> = messages
            .into_iter()
            .map(|msg| {
                let content = msg.content_blocks.clone().unwrap_or(json!(msg.content));
                let mut m = json!({"role": msg.role, "content": content});
                if let Some(tool_calls) = msg.tool_calls {
                    m["tool_calls"] = json!(tool_calls
                        .into_iter()
                        .map(|tc| json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {"name": tc.name, "arguments": tc.arguments}
                        }))
                        .collect::<Vec<_>>());
                }
                if let Some(id) = msg.tool_call_id {
                    m["tool_call_id"] = json!(id);
                }
                m
            })
            .collect();

        let mut payload = json!({
            "model": model.unwrap_or(&self.default_model),
            "messages": openai_messages,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        if let Some(tools) = tools {
            payload["tools"] = json!(tools
                .into_iter()
                .map(|t| json!({
                    "type": "function",
                    "function": {"name": t.name, "description": t.description, "parameters": t.parameters}
                }))
                .collect::<Vec<_>>());
        }

        payload
    }

    fn parse_response(&self, body: Value) -> anyhow::Result<LLMResponse> {
        let choice = body["choices"]
            .as_array()
            .and_then(|arr| arr.first())
            .ok_or_else(|| anyhow::anyhow!("no choices in provider response"))?;

        let message = &choice["message"];
        let content = message["content"].as_str().map(|s| s.to_string());

        let mut tool_calls = Vec::new();
        if let Some(raw_calls) = message["tool_calls"].as_array() {
            for call in raw_calls {
                if let Some(function) = call["function"].as_object() {
                    let arguments = function["arguments"]
                        .as_str()
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or_else(|| json!({}));
                    tool_calls.push(ToolCallRequest {
                        id: call["id"].as_str().unwrap_or_default().to_string(),
                        name: function["name"].as_str().unwrap_or_default().to_string(),
                        arguments,
                    });
                }
            }
        }

        Ok(LLMResponse { content, tool_calls })
    }

    /// Maps transport-level failures onto the shared error taxonomy so
    /// the agent loop can distinguish retryable provider hiccups from
    /// terminal ones without inspecting HTTP status codes itself.
    fn classify_status(status: reqwest::StatusCode, body: &str) -> ConductorError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            ConductorError::FatalToTurn(format!("provider authentication failed: {body}"))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            ConductorError::Transient(format!("provider returned {status}: {body}"))
        } else {
            ConductorError::FatalToTurn(format!("provider returned {status}: {body}"))
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAiProvider {
    async fn chat(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolDefinition>>,
        model: Option<&str>,
        max_tokens: u32,
        temperature: f32,
    ) -> anyhow::Result<LLMResponse> {
        let payload = self.build_payload(messages, tools, model, max_tokens, temperature);

        let response = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .send()
            .await
            .map_err(|e| ConductorError::Transient(format!("provider request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_status(status, &body).into());
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ConductorError::Transient(format!("invalid provider response: {e}")))?;

        {
            let mut metrics = self.metrics.lock().await;
            metrics.request_count += 1;
            if let Some(tokens) = body.get("usage").and_then(|u| u.get("total_tokens")).and_then(Value::as_u64) {
                metrics.token_count += tokens;
            }
        }

        self.parse_response(body)
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(base_url: String) -> OpenAiProvider {
        OpenAiProvider::new("test-key".to_string(), base_url, "gpt-test".to_string(), 30)
    }

    #[tokio::test]
    async fn chat_parses_plain_text_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "hello there"}}],
                "usage": {"total_tokens": 12}
            })))
            .mount(&server)
            .await;

        let provider = provider(server.uri());
        let result = provider
            .chat(vec![Message::user("hi")], None, None, 100, 0.0)
            .await
            .unwrap();
        assert_eq!(result.content.as_deref(), Some("hello there"));
        assert!(!result.has_tool_calls());
        assert_eq!(provider.metrics_snapshot().await.token_count, 12);
    }

    #[tokio::test]
    async fn chat_parses_tool_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "exec", "arguments": "{\"command\":\"ls\"}"}
                        }]
                    }
                }],
                "usage": {"total_tokens": 5}
            })))
            .mount(&server)
            .await;

        let provider = provider(server.uri());
        let result = provider
            .chat(vec![Message::user("list files")], None, None, 100, 0.0)
            .await
            .unwrap();
        assert!(result.has_tool_calls());
        assert_eq!(result.tool_calls[0].name, "exec");
        assert_eq!(result.tool_calls[0].arguments["command"], "ls");
    }

    #[tokio::test]
    async fn chat_classifies_401_as_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
            .mount(&server)
            .await;

        let provider = provider(server.uri());
        let err = provider
            .chat(vec![Message::user("hi")], None, None, 100, 0.0)
            .await
            .unwrap_err();
        let conductor_err = err.downcast_ref::<ConductorError>().expect("expected ConductorError");
        assert!(!conductor_err.is_retryable());
    }

    #[tokio::test]
    async fn chat_classifies_500_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let provider = provider(server.uri());
        let err = provider
            .chat(vec![Message::user("hi")], None, None, 100, 0.0)
            .await
            .unwrap_err();
        let conductor_err = err.downcast_ref::<ConductorError>().expect("expected ConductorError");
        assert!(conductor_err.is_retryable());
    }
}
