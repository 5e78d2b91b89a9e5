//! Windowed consolidation of session history into a single long-term
//! memory document (§2, §4.8 "long-term memory document", §9 Open
//! Question: consolidation only runs when no turn lock is held).
//!
//! Grounded on `agent/compaction.rs`'s approach — ask the provider to
//! fold an old transcript into prose — but not on the teacher's
//! SQLite+FTS+embeddings memory system, which is out of this engine's
//! scope at the share this component is given.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::warn;

use crate::errors::{ConductorError, Result};
use crate::providers::base::{LLMProvider, Message};
use crate::session::types::TurnRecord;
use crate::session::SessionManager;

const MEMORY_FILE: &str = "MEMORY.md";

const CONSOLIDATION_PROMPT: &str = "Summarize the following conversation transcript concisely, \
preserving key decisions, facts, names, dates, and any pending commitments. Write plain prose, \
no more than 300 words, with no preamble.\n\nTranscript:\n{transcript}";

/// Reads and appends to a single on-disk document; summarizes and
/// rewrites session history once it grows past the configured window.
pub struct MemoryManager {
    memory_path: PathBuf,
    provider: Arc<dyn LLMProvider>,
    model: Option<String>,
    window: usize,
    doc_cap_bytes: usize,
}

impl MemoryManager {
    pub fn new(
        workspace: impl AsRef<Path>,
        provider: Arc<dyn LLMProvider>,
        model: Option<String>,
        window: usize,
        doc_cap_bytes: usize,
    ) -> Self {
        Self {
            memory_path: workspace.as_ref().join("memory").join(MEMORY_FILE),
            provider,
            model,
            window,
            doc_cap_bytes,
        }
    }

    /// The long-term memory document, capped to the configured byte
    /// budget (most recent bytes kept — oldest material is the first
    /// to be consolidated away anyway).
    pub async fn read_document(&self) -> Result<String> {
        match tokio::fs::read_to_string(&self.memory_path).await {
            Ok(content) => Ok(cap_to_bytes(&content, self.doc_cap_bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(ConductorError::Other(e.into())),
        }
    }

    pub async fn append(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.memory_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConductorError::Other(e.into()))?;
        }
        use tokio::io::AsyncWriteExt;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.memory_path)
            .await
            .map_err(|e| ConductorError::Other(e.into()))?;
        file.write_all(text.as_bytes())
            .await
            .map_err(|e| ConductorError::Other(e.into()))?;
        file.write_all(b"\n\n")
            .await
            .map_err(|e| ConductorError::Other(e.into()))?;
        Ok(())
    }

    /// Whether `records.len()` has grown past the configured window —
    /// the trigger condition for consolidation.
    pub fn needs_consolidation(&self, records: &[TurnRecord]) -> bool {
        records.len() > self.window
    }

    /// The configured `memory_window` record count (§4.8: context
    /// assembly caps history to the most recent N records).
    pub fn window(&self) -> usize {
        self.window
    }

    /// Summarizes the oldest `records.len() - window` records,
    /// appends the summary to the long-term document, and rewrites
    /// the session keeping only the most recent `window` records.
    ///
    /// Callers must only invoke this when no turn lock is held for
    /// `owner_key` — consolidation racing an in-flight turn could
    /// rewrite history out from under it.
    pub async fn consolidate(&self, sessions: &SessionManager, owner_key: &str) -> Result<()> {
        let session = sessions.load(owner_key).await?;
        if !self.needs_consolidation(&session.records) {
            return Ok(());
        }

        let split = session.records.len() - self.window;
        let (old, recent) = session.records.split_at(split);
        let transcript = render_transcript(old);

        match self.summarize(&transcript).await {
            Ok(summary) if !summary.trim().is_empty() => {
                self.append(&format!("## Consolidated — {owner_key}\n\n{summary}")).await?;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("memory consolidation summarization failed for {}: {}", owner_key, e);
            }
        }

        sessions.rewrite_keeping_recent(owner_key, recent.to_vec()).await?;
        Ok(())
    }

    async fn summarize(&self, transcript: &str) -> Result<String> {
        let prompt = CONSOLIDATION_PROMPT.replace("{transcript}", transcript);
        let response = self
            .provider
            .chat(vec![Message::user(prompt)], None, self.model.as_deref(), 800, 0.3)
            .await
            .map_err(ConductorError::Other)?;
        Ok(response.content.unwrap_or_default())
    }
}

fn render_transcript(records: &[TurnRecord]) -> String {
    records
        .iter()
        .map(|record| match record {
            TurnRecord::User { content, .. } => format!("user: {content}"),
            TurnRecord::Assistant { content, .. } => format!("assistant: {content}"),
            TurnRecord::ToolCallRequest { tool_name, arguments, .. } => {
                format!("tool_call: {tool_name}({arguments})")
            }
            TurnRecord::ToolCallResult { status, content, .. } => {
                format!("tool_result[{status}]: {content}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keeps the most recent `cap` bytes, trimming forward until the
/// result is valid UTF-8 (a byte-offset cap can land mid-codepoint).
fn cap_to_bytes(content: &str, cap: usize) -> String {
    if content.len() <= cap {
        return content.to_string();
    }
    let mut bytes = content.as_bytes()[content.len() - cap..].to_vec();
    while !bytes.is_empty() && std::str::from_utf8(&bytes).is_err() {
        bytes.remove(0);
    }
    String::from_utf8(bytes).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::providers::base::{LLMResponse, ToolDefinition};

    struct StubProvider;

    #[async_trait]
    impl LLMProvider for StubProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Option<Vec<ToolDefinition>>,
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LLMResponse> {
            Ok(LLMResponse {
                content: Some("a concise summary".to_string()),
                tool_calls: vec![],
            })
        }
        fn default_model(&self) -> &str {
            "stub"
        }
    }

    fn user(content: &str, at_ms: i64) -> TurnRecord {
        TurnRecord::User { content: content.to_string(), media_attachments: vec![], at_ms }
    }

    #[test]
    fn cap_to_bytes_keeps_most_recent_and_valid_utf8() {
        let content = "hello world, this is a longer message";
        let capped = cap_to_bytes(content, 11);
        assert!(content.ends_with(&capped));
        assert!(capped.len() <= 11);
    }

    #[test]
    fn needs_consolidation_respects_window() {
        let dir = tempfile::tempdir().unwrap();
        let manager = MemoryManager::new(dir.path(), Arc::new(StubProvider), None, 3, 1024);
        let few = vec![user("a", 0), user("b", 1)];
        let many = vec![user("a", 0), user("b", 1), user("c", 2), user("d", 3)];
        assert!(!manager.needs_consolidation(&few));
        assert!(manager.needs_consolidation(&many));
    }

    #[tokio::test]
    async fn consolidate_rewrites_session_and_appends_summary() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionManager::new(dir.path().join("sessions"));
        for i in 0..5 {
            sessions
                .append("cli:u1", user(&format!("msg{i}"), i))
                .await
                .unwrap();
        }
        let manager = MemoryManager::new(dir.path(), Arc::new(StubProvider), None, 2, 1024);
        manager.consolidate(&sessions, "cli:u1").await.unwrap();

        let session = sessions.load("cli:u1").await.unwrap();
        assert_eq!(session.records.len(), 2);

        let doc = manager.read_document().await.unwrap();
        assert!(doc.contains("a concise summary"));
    }

    #[tokio::test]
    async fn consolidate_is_noop_under_window() {
        let dir = tempfile::tempdir().unwrap();
        let sessions = SessionManager::new(dir.path().join("sessions"));
        sessions.append("cli:u1", user("hi", 0)).await.unwrap();
        let manager = MemoryManager::new(dir.path(), Arc::new(StubProvider), None, 10, 1024);
        manager.consolidate(&sessions, "cli:u1").await.unwrap();
        let session = sessions.load("cli:u1").await.unwrap();
        assert_eq!(session.records.len(), 1);
    }
}
