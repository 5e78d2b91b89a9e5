use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::base::{Tool, ToolResult};

/// Runs a single subagent turn to completion and returns its final
/// text. The agent loop implements this against itself; kept as a
/// trait here so the tools module never depends on the agent module.
#[async_trait]
pub trait SubagentRunner: Send + Sync {
    async fn run_subagent(&self, prompt: &str) -> Result<String, String>;
}

/// Spawns a subagent to carry out `prompt` in isolation and returns
/// its final reply as the tool result. Excluded from background/cron
/// turn views (§4.9) so scheduled monitors cannot recursively spawn.
pub struct SpawnTool {
    runner: Arc<dyn SubagentRunner>,
}

impl SpawnTool {
    pub fn new(runner: Arc<dyn SubagentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Tool for SpawnTool {
    fn name(&self) -> &str {
        "spawn"
    }
    fn description(&self) -> &str {
        "Spawns a subagent to carry out a task and returns its final reply."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"prompt": {"type": "string", "minLength": 1}},
            "required": ["prompt"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let Some(prompt) = params.get("prompt").and_then(Value::as_str) else {
            return ToolResult::error("Missing required parameter: prompt");
        };
        match self.runner.run_subagent(prompt).await {
            Ok(reply) => ToolResult::success(reply),
            Err(reason) => ToolResult::error(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoRunner;

    #[async_trait]
    impl SubagentRunner for EchoRunner {
        async fn run_subagent(&self, prompt: &str) -> Result<String, String> {
            Ok(format!("subagent reply to: {prompt}"))
        }
    }

    #[tokio::test]
    async fn delegates_to_runner() {
        let tool = SpawnTool::new(Arc::new(EchoRunner));
        let result = tool.execute(serde_json::json!({"prompt": "hello"})).await;
        assert_eq!(
            result,
            ToolResult::success("subagent reply to: hello".to_string())
        );
    }

    #[tokio::test]
    async fn missing_prompt_is_rejected() {
        let tool = SpawnTool::new(Arc::new(EchoRunner));
        let result = tool.execute(serde_json::json!({})).await;
        assert!(result.is_error());
    }
}
