pub mod client;
pub mod protocol;
pub mod proxy_tool;
pub mod sanitize;

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::McpServerConfig;
use crate::tools::ToolRegistry;

pub use client::McpClient;
pub use proxy_tool::ProxyTool;

/// Spawns and hands-shakes every configured server concurrently,
/// registering its tools into `registry` as each one completes.
/// Returns immediately; tools appear asynchronously (§4.7).
pub fn discover_servers(configs: Vec<McpServerConfig>, registry: Arc<ToolRegistry>) {
    for config in configs {
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = discover_one(&config, &registry).await {
                warn!(server = config.name, error = %e, "mcp server discovery failed");
            }
        });
    }
}

async fn discover_one(config: &McpServerConfig, registry: &ToolRegistry) -> anyhow::Result<()> {
    let client = Arc::new(McpClient::connect(config).await?);
    let tools = client.list_tools().await?;
    let mut registered = 0usize;
    for tool in tools {
        if !sanitize::allowed(&tool.name, &config.allowlist) {
            continue;
        }
        let proxy_name = sanitize::proxy_tool_name(&config.name, &tool.name);
        let proxy = ProxyTool::new(
            client.clone(),
            tool.name.clone(),
            proxy_name,
            tool.description.clone(),
            tool.input_schema.clone(),
        );
        registry.register(Arc::new(proxy)).await;
        registered += 1;
    }
    info!(server = config.name, tools = registered, "mcp server ready");
    Ok(())
}
