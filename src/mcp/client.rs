use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::McpServerConfig;

use super::protocol::{McpToolDescriptor, RpcNotification, RpcRequest, RpcResponse};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RESPONSE_BYTES: usize = 50 * 1024;
const PROTOCOL_VERSION: &str = "2024-11-05";

/// One stdio subprocess speaking JSON-RPC 2.0. Long-lived: once the
/// child exits it is marked dead and never auto-restarted (§4.7).
pub struct McpClient {
    server_name: String,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    next_id: AtomicU64,
    dead: AtomicBool,
}

impl McpClient {
    pub async fn connect(config: &McpServerConfig) -> anyhow::Result<Self> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args);
        cmd.env_clear();
        cmd.envs(&config.env);
        for var in ["PATH", "HOME", "LANG"] {
            if let Ok(value) = std::env::var(var) {
                cmd.env(var, value);
            }
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());

        let mut child = cmd.spawn()?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("no stdout"))?;

        let client = Self {
            server_name: config.name.clone(),
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            next_id: AtomicU64::new(1),
            dead: AtomicBool::new(false),
        };
        client.handshake().await?;
        Ok(client)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn write_line(&self, line: String) -> anyhow::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn read_response(&self) -> anyhow::Result<RpcResponse> {
        let mut line = String::new();
        let mut stdout = self.stdout.lock().await;
        let bytes = stdout.read_line(&mut line).await?;
        if bytes == 0 {
            anyhow::bail!("mcp server '{}' closed stdout", self.server_name);
        }
        Ok(serde_json::from_str(&line)?)
    }

    async fn request(&self, method: &str, params: Option<Value>, timeout: Duration) -> anyhow::Result<Value> {
        if self.is_dead() {
            anyhow::bail!("mcp server '{}' is dead", self.server_name);
        }
        let id = self.allocate_id();
        let req = RpcRequest::new(id, method, params);
        let line = serde_json::to_string(&req)?;

        let result = tokio::time::timeout(timeout, async {
            self.write_line(line).await?;
            self.read_response().await
        })
        .await;

        match result {
            Ok(Ok(response)) => {
                if response.id != Some(id) {
                    anyhow::bail!("mcp server '{}' responded with mismatched id", self.server_name);
                }
                if let Some(err) = response.error {
                    anyhow::bail!("mcp server '{}' error {}: {}", self.server_name, err.code, err.message);
                }
                Ok(response.result.unwrap_or(Value::Null))
            }
            Ok(Err(e)) => {
                self.mark_dead();
                Err(e)
            }
            Err(_) => {
                self.mark_dead();
                anyhow::bail!("mcp server '{}' timed out on {}", self.server_name, method)
            }
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> anyhow::Result<()> {
        let note = RpcNotification::new(method, params);
        let line = serde_json::to_string(&note)?;
        self.write_line(line).await
    }

    async fn handshake(&self) -> anyhow::Result<()> {
        self.request(
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "clientInfo": {"name": "conductor", "version": crate::VERSION},
                "capabilities": {}
            })),
            HANDSHAKE_TIMEOUT,
        )
        .await?;
        self.notify("notifications/initialized", None).await
    }

    pub async fn list_tools(&self) -> anyhow::Result<Vec<McpToolDescriptor>> {
        let result = self.request("tools/list", None, LIST_TIMEOUT).await?;
        let tools = result
            .get("tools")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("tools/list response missing 'tools'"))?;
        Ok(serde_json::from_value(tools)?)
    }

    pub async fn call_tool(&self, remote_name: &str, arguments: Value) -> Result<String, String> {
        let result = self
            .request(
                "tools/call",
                Some(serde_json::json!({"name": remote_name, "arguments": arguments})),
                CALL_TIMEOUT,
            )
            .await
            .map_err(|e| e.to_string())?;

        let mut rendered = serde_json::to_string(&result).unwrap_or_default();
        if rendered.len() > MAX_RESPONSE_BYTES {
            rendered.truncate(MAX_RESPONSE_BYTES);
            rendered.push_str(&format!("... (truncated at {MAX_RESPONSE_BYTES} bytes)"));
        }
        Ok(rendered)
    }

    pub async fn shutdown(&self) {
        self.mark_dead();
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            warn!(server = self.server_name, error = %e, "failed to kill mcp server process");
        }
    }
}
