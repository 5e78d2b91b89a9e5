use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::errors::ConductorError;
use crate::sandbox::{SandboxExecutor, SandboxOperation};

use super::base::{Tool, ToolResult};

fn is_env_path(raw: &str) -> bool {
    Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n == ".env")
        .unwrap_or(false)
}

fn map_err(e: ConductorError) -> ToolResult {
    match e {
        ConductorError::AccessDenied(msg) => ToolResult::access_denied(msg),
        other => ToolResult::error(other.to_string()),
    }
}

pub struct ReadFileTool {
    executor: Arc<Mutex<SandboxExecutor>>,
}

impl ReadFileTool {
    pub fn new(executor: Arc<Mutex<SandboxExecutor>>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }
    fn description(&self) -> &str {
        "Reads a text file from the workspace."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string", "minLength": 1}},
            "required": ["path"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let Some(path) = params.get("path").and_then(Value::as_str) else {
            return ToolResult::error("Missing required parameter: path");
        };
        if is_env_path(path) {
            return ToolResult::access_denied(".env files cannot be read");
        }
        let mut executor = self.executor.lock().await;
        match executor
            .execute(SandboxOperation::ReadFile { path: path.to_string() })
            .await
        {
            Ok(result) => ToolResult::success(result.data),
            Err(e) => map_err(e),
        }
    }
}

pub struct WriteFileTool {
    executor: Arc<Mutex<SandboxExecutor>>,
}

impl WriteFileTool {
    pub fn new(executor: Arc<Mutex<SandboxExecutor>>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }
    fn description(&self) -> &str {
        "Writes a text file in the workspace, creating parent directories as needed."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "minLength": 1},
                "content": {"type": "string"}
            },
            "required": ["path", "content"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let Some(path) = params.get("path").and_then(Value::as_str) else {
            return ToolResult::error("Missing required parameter: path");
        };
        let Some(content) = params.get("content").and_then(Value::as_str) else {
            return ToolResult::error("Missing required parameter: content");
        };
        if is_env_path(path) {
            return ToolResult::access_denied(".env files cannot be written");
        }
        let mut executor = self.executor.lock().await;
        match executor
            .execute(SandboxOperation::WriteFile {
                path: path.to_string(),
                content: content.as_bytes().to_vec(),
            })
            .await
        {
            Ok(_) => ToolResult::success(format!("Wrote {} bytes to {path}", content.len())),
            Err(e) => map_err(e),
        }
    }
}

pub struct EditFileTool {
    executor: Arc<Mutex<SandboxExecutor>>,
}

impl EditFileTool {
    pub fn new(executor: Arc<Mutex<SandboxExecutor>>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }
    fn description(&self) -> &str {
        "Replaces a unique occurrence of oldText with newText in a workspace file."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {"type": "string", "minLength": 1},
                "oldText": {"type": "string", "minLength": 1},
                "newText": {"type": "string"}
            },
            "required": ["path", "oldText", "newText"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let (Some(path), Some(old_text), Some(new_text)) = (
            params.get("path").and_then(Value::as_str),
            params.get("oldText").and_then(Value::as_str),
            params.get("newText").and_then(Value::as_str),
        ) else {
            return ToolResult::error("Missing required parameter");
        };
        if is_env_path(path) {
            return ToolResult::access_denied(".env files cannot be edited");
        }

        let mut executor = self.executor.lock().await;
        let current = match executor
            .execute(SandboxOperation::ReadFile { path: path.to_string() })
            .await
        {
            Ok(result) => result.data,
            Err(e) => return map_err(e),
        };

        let occurrences = current.matches(old_text).count();
        if occurrences == 0 {
            return ToolResult::error("oldText not found in file");
        }
        if occurrences > 1 {
            return ToolResult::error(format!("oldText appears {occurrences} times, expected exactly once"));
        }

        let updated = current.replacen(old_text, new_text, 1);
        match executor
            .execute(SandboxOperation::WriteFile {
                path: path.to_string(),
                content: updated.into_bytes(),
            })
            .await
        {
            Ok(_) => ToolResult::success(format!("Edited {path}")),
            Err(e) => map_err(e),
        }
    }
}

pub struct ListDirTool {
    executor: Arc<Mutex<SandboxExecutor>>,
}

impl ListDirTool {
    pub fn new(executor: Arc<Mutex<SandboxExecutor>>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &str {
        "list_dir"
    }
    fn description(&self) -> &str {
        "Lists entries in a workspace directory, sorted."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": []
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let path = params.get("path").and_then(Value::as_str).unwrap_or(".");
        let mut executor = self.executor.lock().await;
        match executor
            .execute(SandboxOperation::ListDir { path: path.to_string() })
            .await
        {
            Ok(result) => ToolResult::success(result.data),
            Err(e) => map_err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn executor(dir: &std::path::Path) -> Arc<Mutex<SandboxExecutor>> {
        Arc::new(Mutex::new(SandboxExecutor::direct(dir.to_path_buf())))
    }

    #[tokio::test]
    async fn read_file_denies_env_basename() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ReadFileTool::new(executor(dir.path()));
        let result = tool.execute(serde_json::json!({"path": ".env"})).await;
        assert!(matches!(result, ToolResult::AccessDenied(_)));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let write = WriteFileTool::new(exec.clone());
        write
            .execute(serde_json::json!({"path": "a.txt", "content": "hi"}))
            .await;
        let read = ReadFileTool::new(exec);
        let result = read.execute(serde_json::json!({"path": "a.txt"})).await;
        assert_eq!(result, ToolResult::success("hi"));
    }

    #[tokio::test]
    async fn edit_file_requires_exactly_one_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        std::fs::write(dir.path().join("dup.txt"), "foo foo").unwrap();
        let edit = EditFileTool::new(exec);
        let result = edit
            .execute(serde_json::json!({"path": "dup.txt", "oldText": "foo", "newText": "bar"}))
            .await;
        match result {
            ToolResult::Error(msg) => assert!(msg.contains("appears 2 times")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn edit_file_replaces_unique_occurrence() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        std::fs::write(dir.path().join("one.txt"), "hello world").unwrap();
        let edit = EditFileTool::new(exec.clone());
        edit.execute(serde_json::json!({"path": "one.txt", "oldText": "world", "newText": "rust"}))
            .await;
        let read = ReadFileTool::new(exec);
        let result = read.execute(serde_json::json!({"path": "one.txt"})).await;
        assert_eq!(result, ToolResult::success("hello rust"));
    }

    #[tokio::test]
    async fn list_dir_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("z.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let tool = ListDirTool::new(executor(dir.path()));
        let result = tool.execute(serde_json::json!({"path": "."})).await;
        assert_eq!(result, ToolResult::success("a.txt\nz.txt".to_string()));
    }
}
