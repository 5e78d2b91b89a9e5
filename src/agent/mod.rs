//! Agent Loop (§4.9): the per-turn dispatcher sitting between the Bus
//! and the Provider/Registry. Claims one inbound message at a time per
//! owner, builds the request via the Context Builder, and iterates
//! tool calls until a final assistant message or an iteration limit.
//!
//! Grounded on `agent/loop/mod.rs` for the overall async wiring and
//! iteration shape; the teacher serializes every turn behind one
//! global lock, this loop instead keys a lock per ownerKey (§5
//! requires per-owner isolation only, not a single global turn at a
//! time across the whole process).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::context::ContextBuilder;
use crate::errors::ConductorError;
use crate::memory::MemoryManager;
use crate::providers::base::{LLMProvider, Message, ToolDefinition as ProviderToolDef};
use crate::session::{SessionManager, TurnRecord};
use crate::tools::{SubagentRunner, ToolRegistry, ToolResult, BACKGROUND_EXCLUDED_TOOLS};

const DEFAULT_MAX_TOOL_ITERATIONS: usize = 20;
const DEFAULT_MAX_TOKENS: u32 = 4096;
const TEMPERATURE: f32 = 0.7;
/// Subagent turns never recurse into another `spawn` call — the
/// registry view they see additionally excludes `spawn` on top of the
/// owning turn's own exclusions.
const SUBAGENT_EXCLUDED_TOOLS: &[&str] = &["spawn"];

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wires the Bus, Session Store, Context Builder, Registry, and
/// Provider together and runs the dispatch loop.
pub struct AgentLoop {
    bus: Arc<MessageBus>,
    sessions: Arc<SessionManager>,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn LLMProvider>,
    context: Mutex<ContextBuilder>,
    memory: Arc<MemoryManager>,
    model: Option<String>,
    max_iterations: usize,
    turn_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        sessions: Arc<SessionManager>,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn LLMProvider>,
        context: ContextBuilder,
        memory: Arc<MemoryManager>,
        model: Option<String>,
        max_iterations: usize,
    ) -> Self {
        Self {
            bus,
            sessions,
            registry,
            provider,
            context: Mutex::new(context),
            memory,
            model,
            max_iterations: if max_iterations == 0 {
                DEFAULT_MAX_TOOL_ITERATIONS
            } else {
                max_iterations
            },
            turn_locks: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
        }
    }

    /// Drains the bus forever, spawning one task per inbound message
    /// so turns for distinct owners run concurrently; turns sharing an
    /// owner still serialize via the per-owner lock acquired inside
    /// `process_message`.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            tokio::select! {
                msg = self.bus.recv_inbound() => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.process_message(msg).await;
                    });
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("agent loop dispatcher stopping: shutdown requested");
                        break;
                    }
                }
            }
        }
    }

    /// Signals the cancel flag for `owner_key`, checked between
    /// iterations and around the provider call (§4.9 point 7,
    /// cooperative — an in-flight tool or provider call finishes).
    pub async fn cancel(&self, owner_key: &str) {
        let flags = self.cancel_flags.lock().await;
        if let Some(flag) = flags.get(owner_key) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    async fn lock_for(&self, owner_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.turn_locks.lock().await;
        locks.entry(owner_key.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    async fn cancel_flag_for(&self, owner_key: &str) -> Arc<AtomicBool> {
        let mut flags = self.cancel_flags.lock().await;
        flags.entry(owner_key.to_string()).or_insert_with(|| Arc::new(AtomicBool::new(false))).clone()
    }

    pub async fn process_message(&self, msg: InboundMessage) {
        let owner_key = msg.session_key();
        let lock = self.lock_for(&owner_key).await;
        let _guard = lock.lock().await;

        let cancel_flag = self.cancel_flag_for(&owner_key).await;
        cancel_flag.store(false, Ordering::SeqCst);

        if let Err(e) = self.process_message_locked(msg, &owner_key, &cancel_flag).await {
            error!(owner_key, error = %e, "turn failed outside the normal error path");
        }
    }

    async fn process_message_locked(
        &self,
        msg: InboundMessage,
        owner_key: &str,
        cancel_flag: &Arc<AtomicBool>,
    ) -> crate::errors::Result<()> {
        let is_background = msg.is_background();

        self.sessions
            .append(
                owner_key,
                TurnRecord::User {
                    content: msg.content.clone(),
                    media_attachments: msg.media_attachments.clone(),
                    at_ms: msg.received_at_ms,
                },
            )
            .await?;

        let session = self.sessions.load(owner_key).await?;
        let mut messages = if is_background {
            let mut ctx = self.context.lock().await;
            ctx.build_background_messages(&msg.content)
        } else {
            let mut ctx = self.context.lock().await;
            ctx.build_messages(
                &session.records,
                &msg.content,
                &msg.media_attachments,
                &msg.channel,
                &msg.chat_id,
            )
            .await?
        };

        let exclude: &[&str] = if is_background { BACKGROUND_EXCLUDED_TOOLS } else { &[] };
        let tool_defs = self.registry.definitions(exclude).await;
        let provider_tools = to_provider_tools(tool_defs);

        let outcome = self
            .run_iterations(owner_key, &mut messages, &provider_tools, cancel_flag)
            .await;

        match outcome {
            Ok(Some(final_text)) => {
                self.sessions
                    .append(owner_key, TurnRecord::Assistant { content: final_text.clone(), at_ms: now_ms() })
                    .await?;
                if !is_background {
                    self.bus
                        .publish_outbound(OutboundMessage {
                            channel: msg.channel.clone(),
                            chat_id: msg.chat_id.clone(),
                            content: final_text,
                            media_attachments: vec![],
                            reply_to: None,
                        })
                        .await;
                }
            }
            Ok(None) => {
                // Cancelled between iterations; nothing further to publish.
            }
            Err(e) => {
                let friendly = "Something went wrong handling that; please try again.".to_string();
                self.sessions
                    .append(
                        owner_key,
                        TurnRecord::Assistant { content: format!("[error] {e}"), at_ms: now_ms() },
                    )
                    .await?;
                if !is_background {
                    self.bus
                        .publish_outbound(OutboundMessage {
                            channel: msg.channel,
                            chat_id: msg.chat_id,
                            content: friendly,
                            media_attachments: vec![],
                            reply_to: None,
                        })
                        .await;
                }
            }
        }

        self.maybe_spawn_consolidation(owner_key).await;
        Ok(())
    }

    /// Runs the tool-call loop. Returns `Ok(Some(text))` on a final
    /// assistant message, `Ok(None)` if cancelled, `Err` on a provider
    /// failure (surfaced to the caller as a friendly message; no retry
    /// within a turn per §4.9 point 6).
    async fn run_iterations(
        &self,
        owner_key: &str,
        messages: &mut Vec<Message>,
        tools: &[ProviderToolDef],
        cancel_flag: &Arc<AtomicBool>,
    ) -> crate::errors::Result<Option<String>> {
        for _iteration in 0..self.max_iterations {
            if cancel_flag.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let response = self
                .provider
                .chat(messages.clone(), Some(tools.to_vec()), self.model.as_deref(), DEFAULT_MAX_TOKENS, TEMPERATURE)
                .await
                .map_err(classify_provider_error)?;

            if cancel_flag.load(Ordering::SeqCst) {
                return Ok(None);
            }

            if !response.has_tool_calls() {
                return Ok(Some(response.content.unwrap_or_default()));
            }

            messages.push(Message::assistant(response.content.as_deref().unwrap_or(""), Some(response.tool_calls.clone())));

            for call in &response.tool_calls {
                self.sessions
                    .append(
                        owner_key,
                        TurnRecord::ToolCallRequest {
                            call_id: call.id.clone(),
                            tool_name: call.name.clone(),
                            arguments: call.arguments.clone(),
                            at_ms: now_ms(),
                        },
                    )
                    .await?;

                let mut args = call.arguments.clone();
                // The model's `ownerKey` is never trusted as a security
                // boundary: every in-turn cron call is tagged with the
                // real session owner, overriding whatever (if anything)
                // the model supplied.
                if call.name == "cron" {
                    if let Some(obj) = args.as_object_mut() {
                        obj.insert("ownerKey".to_string(), serde_json::Value::String(owner_key.to_string()));
                    }
                }

                let result = self.registry.execute(&call.name, args, owner_key).await;
                let (status, content) = match &result {
                    ToolResult::Success(s) => ("success", s.clone()),
                    ToolResult::Error(s) => ("error", s.clone()),
                    ToolResult::AccessDenied(s) => ("access_denied", s.clone()),
                };

                self.sessions
                    .append(
                        owner_key,
                        TurnRecord::ToolCallResult {
                            call_id: call.id.clone(),
                            status: status.to_string(),
                            content: content.clone(),
                            at_ms: now_ms(),
                        },
                    )
                    .await?;

                messages.push(Message::tool_result(call.id.clone(), content, status != "success"));
            }

        }

        Ok(Some("tool iteration limit reached".to_string()))
    }

    async fn maybe_spawn_consolidation(&self, owner_key: &str) {
        let Ok(session) = self.sessions.load(owner_key).await else { return };
        if !self.memory.needs_consolidation(&session.records) {
            return;
        }
        let memory = self.memory.clone();
        let sessions = self.sessions.clone();
        let owner_key = owner_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = memory.consolidate(&sessions, &owner_key).await {
                warn!(owner_key, error = %e, "memory consolidation failed");
            }
        });
    }

    /// Runs a detached, non-persisted turn to completion and returns
    /// its final text — the `spawn` tool's backend. A fresh session
    /// key per call means subagent turns never collide with, or
    /// inherit history from, the owning turn's session.
    async fn run_subagent_turn(&self, prompt: &str) -> Result<String, String> {
        let owner_key = format!("subagent:{}", uuid::Uuid::new_v4());
        let mut messages = vec![
            Message::system(
                "You are a subagent carrying out a single delegated task. \
Reply with your final result as plain text; you cannot spawn further subagents.",
            ),
            Message::user(prompt),
        ];
        let tool_defs = self.registry.definitions(SUBAGENT_EXCLUDED_TOOLS).await;
        let provider_tools = to_provider_tools(tool_defs);
        let cancel_flag = Arc::new(AtomicBool::new(false));

        match self.run_iterations(&owner_key, &mut messages, &provider_tools, &cancel_flag).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) => Err("subagent turn cancelled".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }
}

#[async_trait]
impl SubagentRunner for AgentLoop {
    async fn run_subagent(&self, prompt: &str) -> Result<String, String> {
        self.run_subagent_turn(prompt).await
    }
}

fn to_provider_tools(defs: Vec<crate::tools::ToolDefinition>) -> Vec<ProviderToolDef> {
    defs.into_iter()
        .map(|d| ProviderToolDef {
            name: d.function.name,
            description: d.function.description,
            parameters: d.function.parameters,
        })
        .collect()
}

fn classify_provider_error(e: anyhow::Error) -> ConductorError {
    match e.downcast::<ConductorError>() {
        Ok(conductor_err) => conductor_err,
        Err(other) => ConductorError::FatalToTurn(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::providers::base::{LLMResponse, ToolCallRequest};
    use crate::scheduler::Scheduler;

    struct ScriptedProvider {
        responses: Mutex<Vec<LLMResponse>>,
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn chat(
            &self,
            _messages: Vec<Message>,
            _tools: Option<Vec<ProviderToolDef>>,
            _model: Option<&str>,
            _max_tokens: u32,
            _temperature: f32,
        ) -> anyhow::Result<LLMResponse> {
            let mut responses = self.responses.lock().await;
            if responses.is_empty() {
                anyhow::bail!("no more scripted responses");
            }
            Ok(responses.remove(0))
        }
        fn default_model(&self) -> &str {
            "scripted"
        }
    }

    fn text_response(s: &str) -> LLMResponse {
        LLMResponse { content: Some(s.to_string()), tool_calls: vec![] }
    }

    fn tool_call_response(name: &str, args: serde_json::Value) -> LLMResponse {
        LLMResponse {
            content: None,
            tool_calls: vec![ToolCallRequest { id: "call_1".to_string(), name: name.to_string(), arguments: args }],
        }
    }

    async fn build_loop(
        dir: &std::path::Path,
        responses: Vec<LLMResponse>,
    ) -> (Arc<AgentLoop>, Arc<MessageBus>) {
        let bus = Arc::new(MessageBus::new());
        let sessions = Arc::new(SessionManager::new(dir.join("sessions")));
        let registry = Arc::new(ToolRegistry::new(&crate::config::ToolsConfig::default()));
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider { responses: Mutex::new(responses) });
        let memory = Arc::new(MemoryManager::new(dir, provider.clone(), None, 40, 8192));
        let context = ContextBuilder::new(dir, memory.clone());
        let agent_loop = Arc::new(AgentLoop::new(
            bus.clone(),
            sessions,
            registry,
            provider,
            context,
            memory,
            None,
            5,
        ));
        (agent_loop, bus)
    }

    fn inbound(channel: &str, chat_id: &str, sender: &str, content: &str) -> InboundMessage {
        InboundMessage {
            channel: channel.to_string(),
            chat_id: chat_id.to_string(),
            sender_id: sender.to_string(),
            content: content.to_string(),
            media_attachments: vec![],
            received_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn final_assistant_text_is_published_for_foreground_turn() {
        let dir = tempfile::tempdir().unwrap();
        let (agent_loop, bus) = build_loop(dir.path(), vec![text_response("hi there")]).await;
        let mut rx = bus.subscribe_outbound(|_| true);

        agent_loop.process_message(inbound("cli", "u1", "u1", "hello")).await;

        let out = rx.recv().await.unwrap();
        assert_eq!(out.content, "hi there");
    }

    #[tokio::test]
    async fn background_turn_does_not_auto_publish() {
        let dir = tempfile::tempdir().unwrap();
        let (agent_loop, bus) = build_loop(dir.path(), vec![text_response("background done")]).await;
        let mut rx = bus.subscribe_outbound(|_| true);

        agent_loop.process_message(inbound("system", "u1", "cron:job-1", "ping")).await;

        // No publish should have happened; confirm the channel is still empty
        // by racing a short timeout against recv.
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "background turn should not auto-publish");
    }

    #[tokio::test]
    async fn tool_call_then_final_text_round_trips_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (agent_loop, bus) = build_loop(
            dir.path(),
            vec![tool_call_response("nonexistent_tool", serde_json::json!({})), text_response("done")],
        )
        .await;
        let mut rx = bus.subscribe_outbound(|_| true);

        agent_loop.process_message(inbound("cli", "u1", "u1", "do something")).await;

        let out = rx.recv().await.unwrap();
        assert_eq!(out.content, "done");
    }

    #[tokio::test]
    async fn exceeding_max_iterations_emits_overflow_message() {
        let dir = tempfile::tempdir().unwrap();
        let loop_responses: Vec<LLMResponse> =
            (0..10).map(|_| tool_call_response("nonexistent_tool", serde_json::json!({}))).collect();
        let (agent_loop, bus) = build_loop(dir.path(), loop_responses).await;
        let mut rx = bus.subscribe_outbound(|_| true);

        agent_loop.process_message(inbound("cli", "u1", "u1", "loop forever")).await;

        let out = rx.recv().await.unwrap();
        assert_eq!(out.content, "tool iteration limit reached");
    }

    #[tokio::test]
    async fn provider_failure_is_surfaced_as_friendly_message() {
        let dir = tempfile::tempdir().unwrap();
        let (agent_loop, bus) = build_loop(dir.path(), vec![]).await;
        let mut rx = bus.subscribe_outbound(|_| true);

        agent_loop.process_message(inbound("cli", "u1", "u1", "hello")).await;

        let out = rx.recv().await.unwrap();
        assert!(out.content.contains("went wrong"));
    }

    #[tokio::test]
    async fn cron_tool_call_ownerkey_is_overridden_by_real_session_owner() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new());
        let sessions = Arc::new(SessionManager::new(dir.path().join("sessions")));
        let registry = Arc::new(ToolRegistry::new(&crate::config::ToolsConfig::default()));
        let scheduler = Scheduler::load(dir.path().join("cron.json"), bus.clone()).await.unwrap();
        registry.register(Arc::new(crate::tools::CronTool::new(scheduler.clone()))).await;

        let responses = vec![
            tool_call_response(
                "cron",
                serde_json::json!({
                    "action": "add",
                    "ownerKey": "attacker:evil",
                    "name": "task",
                    "schedule": {"every": 60000},
                    "payload": {"prompt": "ping"}
                }),
            ),
            text_response("scheduled"),
        ];
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider { responses: Mutex::new(responses) });
        let memory = Arc::new(MemoryManager::new(dir.path(), provider.clone(), None, 40, 8192));
        let context = ContextBuilder::new(dir.path(), memory.clone());
        let agent_loop =
            Arc::new(AgentLoop::new(bus.clone(), sessions, registry, provider, context, memory, None, 5));

        agent_loop.process_message(inbound("cli", "realuser", "realuser", "schedule a thing")).await;

        let jobs = scheduler.list_all().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].owner.as_deref(), Some("cli:realuser"));
    }

    #[tokio::test]
    async fn cancel_on_unknown_owner_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let (agent_loop, _bus) = build_loop(dir.path(), vec![]).await;
        agent_loop.cancel("never-seen-owner").await;
    }
}
