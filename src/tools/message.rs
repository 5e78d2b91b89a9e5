use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::bus::{MessageBus, OutboundMessage};

use super::base::{Tool, ToolResult};

/// Explicit delivery for turns that don't auto-publish their final
/// reply (background and cron turns, §4.9) — the model calls this to
/// push a message onto a channel rather than relying on the implicit
/// publish that ordinary turns get.
pub struct MessageTool {
    bus: Arc<MessageBus>,
}

impl MessageTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for MessageTool {
    fn name(&self) -> &str {
        "message"
    }
    fn description(&self) -> &str {
        "Delivers a message to a channel, bypassing the normal end-of-turn publish."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "channel": {"type": "string", "minLength": 1},
                "chatId": {"type": "string", "minLength": 1},
                "content": {"type": "string", "minLength": 1}
            },
            "required": ["channel", "chatId", "content"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let (Some(channel), Some(chat_id), Some(content)) = (
            params.get("channel").and_then(Value::as_str),
            params.get("chatId").and_then(Value::as_str),
            params.get("content").and_then(Value::as_str),
        ) else {
            return ToolResult::error("Missing required parameter");
        };

        self.bus
            .publish_outbound(OutboundMessage {
                channel: channel.to_string(),
                chat_id: chat_id.to_string(),
                content: content.to_string(),
                media_attachments: vec![],
                reply_to: None,
            })
            .await;

        ToolResult::success("Message delivered")
    }
}
