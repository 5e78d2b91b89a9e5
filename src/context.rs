//! Assembles the per-turn LLM request: system prompt (identity +
//! bootstrap documents + long-term memory) followed by history and
//! the current message (§4.8).
//!
//! Grounded on `agent/context.rs`'s `build_system_prompt`/
//! `load_bootstrap_files` mtime-cache pattern; the `SkillsLoader`
//! integration is dropped — no skills marketplace in scope.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Local};
use serde_json::{json, Value};
use tracing::warn;

use crate::bus::MediaAttachment;
use crate::errors::Result;
use crate::memory::MemoryManager;
use crate::providers::base::Message;
use crate::session::TurnRecord;

const BOOTSTRAP_FILES: &[&str] = &["AGENTS.md", "SOUL.md", "USER.md", "TOOLS.md", "IDENTITY.md"];

pub struct ContextBuilder {
    workspace: PathBuf,
    memory: Arc<MemoryManager>,
    bootstrap_cache: Option<String>,
    bootstrap_mtimes: HashMap<String, u64>,
}

impl ContextBuilder {
    pub fn new(workspace: impl AsRef<Path>, memory: Arc<MemoryManager>) -> Self {
        Self {
            workspace: workspace.as_ref().to_path_buf(),
            memory,
            bootstrap_cache: None,
            bootstrap_mtimes: HashMap::new(),
        }
    }

    /// Full system prompt for a regular turn: identity, bootstrap
    /// documents, and the long-term memory document.
    pub async fn build_system_prompt(&mut self) -> Result<String> {
        let mut parts = Vec::new();
        parts.push(self.get_identity());

        let bootstrap = self.load_bootstrap_files();
        if !bootstrap.is_empty() {
            parts.push(bootstrap);
        }

        let memory = self.memory.read_document().await?;
        if !memory.trim().is_empty() {
            parts.push(format!("# Memory\n\n{memory}"));
        }

        Ok(parts.join("\n\n---\n\n"))
    }

    /// Minimal prompt for background/cron turns (§4.9): identity only,
    /// no bootstrap documents or memory context — an unattended turn
    /// has no conversational history to ground those in.
    pub fn build_background_system_prompt(&self) -> String {
        self.get_identity()
    }

    fn get_identity(&self) -> String {
        let now = Local::now();
        let date_str = format!(
            "{}-{:02}-{:02} ({}) {}",
            now.year(),
            now.month(),
            now.day(),
            now.format("%A"),
            now.format("%H:%M %Z")
        );
        let workspace_path = self
            .workspace
            .canonicalize()
            .unwrap_or_else(|_| self.workspace.clone())
            .to_string_lossy()
            .to_string();

        let identity_file = self.workspace.join("IDENTITY.md");
        if let Ok(content) = std::fs::read_to_string(&identity_file) {
            return format!(
                "{content}\n\n## Current Context\n\n**Date**: {date_str}\n**Workspace**: {workspace_path}"
            );
        }

        self.default_identity(&date_str, &workspace_path)
    }

    fn default_identity(&self, date_str: &str, workspace_path: &str) -> String {
        format!(
            "You are a helpful assistant with access to tools for reading, writing, \
and editing files, executing shell commands, searching and fetching web pages, \
sending messages to chat channels, and scheduling recurring or one-off background \
turns.\n\n## Current Date\n{date_str}\n\n## Workspace\n{workspace_path}\n\n\
IMPORTANT: when responding to direct questions or conversation, reply with text \
directly. Only use the `message` tool to deliver content to a specific chat \
channel; it is not how you answer the current turn.\n\nNever claim an action \
was performed unless a tool call in this turn actually performed it."
        )
    }

    /// Caches on unchanged bootstrap-file mtimes, rebuilding from disk
    /// only when one of `BOOTSTRAP_FILES` (other than `IDENTITY.md`,
    /// which is folded into identity separately) has changed.
    fn load_bootstrap_files(&mut self) -> String {
        let mut current_mtimes = HashMap::new();
        for filename in BOOTSTRAP_FILES {
            if *filename == "IDENTITY.md" {
                continue;
            }
            let path = self.workspace.join(filename);
            if let Ok(metadata) = std::fs::metadata(&path) {
                if let Ok(mtime) = metadata.modified() {
                    if let Ok(duration) = mtime.duration_since(std::time::UNIX_EPOCH) {
                        current_mtimes.insert(filename.to_string(), duration.as_secs());
                    }
                }
            }
        }

        if let Some(cache) = &self.bootstrap_cache {
            if current_mtimes == self.bootstrap_mtimes {
                return cache.clone();
            }
        }

        let mut parts = Vec::new();
        for filename in BOOTSTRAP_FILES {
            if *filename == "IDENTITY.md" {
                continue;
            }
            let path = self.workspace.join(filename);
            match std::fs::read_to_string(&path) {
                Ok(content) => parts.push(format!("## {filename}\n\n{content}")),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to read bootstrap file {}: {}", filename, e),
            }
        }

        let rendered = parts.join("\n\n");
        self.bootstrap_cache = Some(rendered.clone());
        self.bootstrap_mtimes = current_mtimes;
        rendered
    }

    /// Builds the message list for a regular turn: system prompt,
    /// history capped to the most recent `memory_window` records (§4.8),
    /// then the current message — with any image attachments on it
    /// emitted as OpenAI-style content blocks. Past-turn images are
    /// never re-emitted (only the current inbound record carries
    /// `media_attachments`).
    pub async fn build_messages(
        &mut self,
        history: &[TurnRecord],
        current_message: &str,
        attachments: &[MediaAttachment],
        channel: &str,
        chat_id: &str,
    ) -> Result<Vec<Message>> {
        let mut system_prompt = self.build_system_prompt().await?;
        system_prompt.push_str(&format!(
            "\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
        ));

        let window = self.memory.window();
        let windowed = if history.len() > window {
            &history[history.len() - window..]
        } else {
            history
        };

        let mut messages = vec![Message::system(system_prompt)];
        messages.extend(render_history(windowed));
        messages.push(render_current_message(current_message, attachments));
        Ok(messages)
    }

    /// Background/cron variant: minimal system prompt, no history.
    pub fn build_background_messages(&self, prompt: &str) -> Vec<Message> {
        vec![Message::system(self.build_background_system_prompt()), Message::user(prompt)]
    }
}

fn render_history(records: &[TurnRecord]) -> Vec<Message> {
    let mut messages = Vec::new();
    for record in records {
        match record {
            TurnRecord::User { content, .. } => {
                if !content.is_empty() {
                    messages.push(Message::user(content.clone()));
                }
            }
            TurnRecord::Assistant { content, .. } => {
                if !content.is_empty() {
                    messages.push(Message::assistant(content.clone(), None));
                }
            }
            TurnRecord::ToolCallRequest { call_id, tool_name, arguments, .. } => {
                messages.push(Message::assistant(
                    "",
                    Some(vec![crate::providers::base::ToolCallRequest {
                        id: call_id.clone(),
                        name: tool_name.clone(),
                        arguments: arguments.clone(),
                    }]),
                ));
            }
            TurnRecord::ToolCallResult { call_id, status, content, .. } => {
                messages.push(Message::tool_result(call_id.clone(), content.clone(), status != "success"));
            }
        }
    }
    messages
}

fn render_current_message(content: &str, attachments: &[MediaAttachment]) -> Message {
    let time_prefix = format!("[{}] ", Local::now().format("%H:%M"));
    let text = format!("{time_prefix}{content}");

    let images: Vec<&MediaAttachment> = attachments.iter().filter(|a| a.kind == "image").collect();
    if images.is_empty() {
        return Message::user(text);
    }

    let mut blocks = vec![json!({"type": "text", "text": text})];
    for image in images {
        let Some(data) = &image.data else { continue };
        blocks.push(json!({
            "type": "image_url",
            "image_url": {"url": format!("data:{};base64,{}", image.mime_type, data)}
        }));
    }
    Message::user_with_blocks(text, Value::Array(blocks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::base::{LLMResponse, ToolDefinition};
    use async_trait::async_trait;

    struct StubProvider;

    #[async_trait]
    impl crate::providers::base::LLMProvider for StubProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Option<Vec<ToolDefinition>>,
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LLMResponse> {
            Ok(LLMResponse { content: Some(String::new()), tool_calls: vec![] })
        }
        fn default_model(&self) -> &str {
            "stub"
        }
    }

    fn builder(dir: &Path) -> ContextBuilder {
        let memory = Arc::new(MemoryManager::new(dir, Arc::new(StubProvider), None, 40, 8192));
        ContextBuilder::new(dir, memory)
    }

    #[tokio::test]
    async fn system_prompt_includes_bootstrap_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "be concise").unwrap();
        let mut ctx = builder(dir.path());
        let prompt = ctx.build_system_prompt().await.unwrap();
        assert!(prompt.contains("be concise"));
    }

    #[tokio::test]
    async fn system_prompt_includes_memory_document_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryManager::new(dir.path(), Arc::new(StubProvider), None, 40, 8192));
        memory.append("prior fact").await.unwrap();
        let mut ctx = ContextBuilder::new(dir.path(), memory);
        let prompt = ctx.build_system_prompt().await.unwrap();
        assert!(prompt.contains("prior fact"));
    }

    #[test]
    fn current_message_with_image_becomes_content_blocks() {
        let attachments = vec![MediaAttachment {
            kind: "image".to_string(),
            mime_type: "image/png".to_string(),
            data: Some("Zm9v".to_string()),
        }];
        let message = render_current_message("look at this", &attachments);
        let blocks = message.content_blocks.expect("expected content blocks");
        assert_eq!(blocks.as_array().unwrap().len(), 2);
        assert_eq!(blocks[1]["type"], "image_url");
    }

    #[test]
    fn current_message_without_attachments_stays_plain_text() {
        let message = render_current_message("hello", &[]);
        assert!(message.content_blocks.is_none());
    }

    #[tokio::test]
    async fn bootstrap_cache_reused_when_mtimes_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SOUL.md"), "v1").unwrap();
        let mut ctx = builder(dir.path());
        let first = ctx.load_bootstrap_files();
        let second = ctx.load_bootstrap_files();
        assert_eq!(first, second);
        assert!(first.contains("v1"));
    }

    #[tokio::test]
    async fn build_messages_caps_history_to_memory_window() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryManager::new(dir.path(), Arc::new(StubProvider), None, 2, 8192));
        let mut ctx = ContextBuilder::new(dir.path(), memory);
        let history: Vec<TurnRecord> = (0..5)
            .map(|i| TurnRecord::User {
                content: format!("msg{i}"),
                media_attachments: vec![],
                at_ms: i,
            })
            .collect();

        let messages = ctx.build_messages(&history, "latest", &[], "cli", "u1").await.unwrap();

        // system prompt + 2 windowed history records + current message
        assert_eq!(messages.len(), 4);
        assert!(messages[1].content.contains("msg3"));
        assert!(messages[2].content.contains("msg4"));
    }
}
