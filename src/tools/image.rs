use async_trait::async_trait;
use serde_json::Value;

use super::base::{Tool, ToolResult};

/// Image generation is peripheral (§1): this tool only documents the
/// attachment contract — `mediaAttachments` on an `OutboundMessage`
/// carrying `kind`/`mimeType`/base64 `data` — rather than generating
/// anything itself.
pub struct ImageTool;

#[async_trait]
impl Tool for ImageTool {
    fn name(&self) -> &str {
        "image"
    }
    fn description(&self) -> &str {
        "Image generation is not implemented by this runtime."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"prompt": {"type": "string", "minLength": 1}},
            "required": ["prompt"]
        })
    }
    async fn execute(&self, _params: Value) -> ToolResult {
        ToolResult::error(
            "image generation is not supported; deliver images via mediaAttachments instead",
        )
    }
}
