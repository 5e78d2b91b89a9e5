//! Process entry point: wires the Bus, Sandbox Executor, Tool
//! Registry, Provider, Scheduler, Context Builder, and Agent Loop
//! together and drives either the long-running dispatcher or a single
//! scheduler/cron subcommand (§6).
//!
//! Grounded on `main.rs`'s minimal-delegate pattern and
//! `gateway/mod.rs`'s shutdown-signal handling; the HTTP gateway and
//! channel adapters themselves have no counterpart here — this
//! component table has no Gateway/HTTP-API entry.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::agent::AgentLoop;
use crate::bus::{InboundMessage, MessageBus};
use crate::config::{self, Config, SandboxMode};
use crate::context::ContextBuilder;
use crate::mcp;
use crate::memory::MemoryManager;
use crate::providers::OpenAiProvider;
use crate::sandbox::SandboxExecutor;
use crate::scheduler::types::{CronJob, CronPayload, CronSchedule};
use crate::scheduler::Scheduler;
use crate::session::SessionManager;
use crate::tools::{
    CronTool, EditFileTool, ExecTool, ListDirTool, MessageTool, ReadFileTool, ShellMode,
    SpawnTool, ToolRegistry, WebFetchTool, WebSearchTool, WriteFileTool,
};

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Core orchestration engine for a tool-using conversational agent")]
struct Cli {
    #[arg(long, global = true, default_value = "./conductor.toml")]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatcher: drain the bus and process turns until shutdown.
    Run,
    /// Send a single direct message and print the reply.
    Chat {
        #[arg(short, long)]
        message: String,
        #[arg(long, default_value = "default")]
        session: String,
    },
    /// Manage scheduled background turns.
    Cron {
        #[command(subcommand)]
        cmd: CronCommands,
    },
}

#[derive(Subcommand)]
enum CronCommands {
    /// List all jobs (CLI-side operations are unrestricted by owner, §4.11).
    List,
    /// Show a single job.
    Show { id: String },
    /// Add a new job.
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        every: Option<u64>,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        at: Option<String>,
    },
    /// Replace an existing job's definition.
    Update {
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        message: String,
        #[arg(long)]
        every: Option<u64>,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        at: Option<String>,
    },
    /// Remove a job.
    Remove { id: String },
    /// Enable a disabled job.
    Enable { id: String },
    /// Disable a job without removing it.
    Disable { id: String },
    /// Fire a job immediately, outside its schedule.
    Run {
        id: String,
        #[arg(long)]
        force: bool,
    },
    /// Remove every job.
    Clear,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run => run_dispatcher(&cli.config).await,
        Commands::Chat { message, session } => run_chat(&cli.config, &message, &session).await,
        Commands::Cron { cmd } => run_cron_command(&cli.config, cmd).await,
    }
}

struct Runtime {
    bus: Arc<MessageBus>,
    agent: Arc<AgentLoop>,
    scheduler: Arc<Scheduler>,
}

async fn build_runtime(config_path: &std::path::Path) -> Result<Runtime> {
    let config = config::load_config(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(workspace = %config.workspace.display(), "configuration loaded");
    warn_if_no_api_key(&config);

    let bus = Arc::new(MessageBus::new());
    let sessions = Arc::new(SessionManager::new(config.workspace.join("sessions")));

    let executor = build_executor(&config).await?;
    let executor = Arc::new(Mutex::new(executor));

    let registry = Arc::new(ToolRegistry::new(&config.tools));
    let shell_mode = match config.sandbox_mode {
        SandboxMode::None => ShellMode::FullShell,
        _ => ShellMode::Simple,
    };
    let sandboxed = config.sandbox_mode != SandboxMode::None;
    registry
        .register(Arc::new(ExecTool::new(
            executor.clone(),
            config.workspace.clone(),
            sandboxed,
            shell_mode,
        )?))
        .await;
    registry.register(Arc::new(ReadFileTool::new(executor.clone()))).await;
    registry.register(Arc::new(WriteFileTool::new(executor.clone()))).await;
    registry.register(Arc::new(EditFileTool::new(executor.clone()))).await;
    registry.register(Arc::new(ListDirTool::new(executor.clone()))).await;
    registry.register(Arc::new(MessageTool::new(bus.clone()))).await;
    registry
        .register(Arc::new(WebFetchTool::new(
            config.tools.web_fetch_max_chars,
            config.tools.web_fetch_timeout_secs,
        )))
        .await;
    registry
        .register(Arc::new(WebSearchTool::new(config.tools.web_search_api_key.clone())))
        .await;

    let store_path = config
        .scheduler
        .store_path
        .clone()
        .unwrap_or_else(|| config.workspace.join("cron").join("jobs.json"));
    let scheduler = Scheduler::load(store_path, bus.clone()).await?;
    registry.register(Arc::new(CronTool::new(scheduler.clone()))).await;

    mcp::discover_servers(config.mcp_servers.clone(), registry.clone());

    let provider = Arc::new(OpenAiProvider::new(
        config.provider.api_key.clone().unwrap_or_default(),
        config.provider.base_url.clone(),
        config.provider.default_model.clone(),
        config.provider.request_timeout_secs,
    ));

    let memory = Arc::new(MemoryManager::new(
        &config.workspace,
        provider.clone(),
        None,
        config.memory.window,
        config.memory.doc_cap_bytes,
    ));
    let context = ContextBuilder::new(&config.workspace, memory.clone());

    let agent = Arc::new(AgentLoop::new(
        bus.clone(),
        sessions.clone(),
        registry.clone(),
        provider,
        context,
        memory,
        None,
        config.max_tool_iterations,
    ));
    registry.register(Arc::new(SpawnTool::new(agent.clone()))).await;

    Ok(Runtime { bus, agent, scheduler })
}

async fn build_executor(config: &Config) -> Result<SandboxExecutor> {
    match config.sandbox_mode {
        SandboxMode::None => Ok(SandboxExecutor::direct(config.workspace.clone())),
        SandboxMode::Landlock | SandboxMode::Seatbelt => {
            Ok(SandboxExecutor::one_shot(config.workspace.clone(), true))
        }
        SandboxMode::Helper => SandboxExecutor::persistent(config.workspace.clone(), true)
            .await
            .context("starting sandbox helper"),
    }
}

/// Drains the bus forever, processing one turn per owner at a time,
/// until `SIGINT`/`SIGTERM` requests a graceful stop.
async fn run_dispatcher(config_path: &std::path::Path) -> Result<()> {
    let runtime = build_runtime(config_path).await?;
    runtime.scheduler.start();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let dispatcher = tokio::spawn(runtime.agent.clone().run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown requested; stopping scheduler and dispatcher");
    runtime.scheduler.stop();
    let _ = shutdown_tx.send(true);
    let _ = dispatcher.await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Sends one message through the agent loop directly (bypassing the
/// bus) and prints the reply — used for scripted or interactive use
/// outside a running dispatcher.
async fn run_chat(config_path: &std::path::Path, message: &str, session: &str) -> Result<()> {
    let runtime = build_runtime(config_path).await?;

    let mut rx = subscribe_reply(&runtime.bus, "cli", session);
    runtime.bus.publish_inbound(InboundMessage {
        channel: "cli".to_string(),
        chat_id: session.to_string(),
        sender_id: session.to_string(),
        content: message.to_string(),
        media_attachments: vec![],
        received_at_ms: chrono::Utc::now().timestamp_millis(),
    });

    let inbound = runtime.bus.recv_inbound().await;
    runtime.agent.process_message(inbound).await;

    match rx.recv().await {
        Some(out) => println!("{}", out.content),
        None => println!("(no reply published this turn)"),
    }
    Ok(())
}

fn subscribe_reply(
    bus: &Arc<MessageBus>,
    channel: &str,
    chat_id: &str,
) -> tokio::sync::mpsc::Receiver<crate::bus::OutboundMessage> {
    let channel = channel.to_string();
    let chat_id = chat_id.to_string();
    bus.subscribe_outbound(move |m| m.channel == channel && m.chat_id == chat_id)
}

async fn run_cron_command(config_path: &std::path::Path, cmd: CronCommands) -> Result<()> {
    let config = config::load_config(config_path)?;
    let bus = Arc::new(MessageBus::new());
    let store_path = config
        .scheduler
        .store_path
        .clone()
        .unwrap_or_else(|| config.workspace.join("cron").join("jobs.json"));
    let scheduler = Scheduler::load(store_path, bus).await?;

    match run_cron_command_inner(&scheduler, cmd).await {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_cron_command_inner(scheduler: &Arc<Scheduler>, cmd: CronCommands) -> Result<()> {
    match cmd {
        CronCommands::List => {
            let jobs = scheduler.list_all().await;
            if jobs.is_empty() {
                println!("No cron jobs found.");
            }
            for job in jobs {
                let status = if job.enabled { "enabled" } else { "disabled" };
                println!("[{}] {} ({}) owner={:?}", job.id, job.name, status, job.owner);
            }
        }
        CronCommands::Show { id } => {
            let job = scheduler
                .show_any(&id)
                .await
                .ok_or_else(|| anyhow::anyhow!("no such job: {id}"))?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        CronCommands::Add { name, message, every, cron, at } => {
            let schedule = parse_schedule_args(every, cron, at)?;
            let job = new_job(name, message, schedule);
            let added = crate::tools::CronBackend::add(&**scheduler, None, job).await.map_err(anyhow::Error::msg)?;
            println!("Added job {}", added.id);
        }
        CronCommands::Update { id, name, message, every, cron, at } => {
            let schedule = parse_schedule_args(every, cron, at)?;
            let mut job = new_job(name, message, schedule);
            job.id = id.clone();
            let updated = crate::tools::CronBackend::update(&**scheduler, None, &id, job)
                .await
                .map_err(anyhow::Error::msg)?;
            println!("Updated job {}", updated.id);
        }
        CronCommands::Remove { id } => {
            scheduler.remove_any(&id).await?;
            println!("Removed {id}");
        }
        CronCommands::Enable { id } => {
            scheduler.set_enabled(&id, true).await?;
            println!("Enabled {id}");
        }
        CronCommands::Disable { id } => {
            scheduler.set_enabled(&id, false).await?;
            println!("Disabled {id}");
        }
        CronCommands::Run { id, force } => {
            scheduler.run_now(&id, force).await?;
            println!("Fired {id}");
        }
        CronCommands::Clear => {
            scheduler.clear_all().await?;
            println!("Cleared all jobs");
        }
    }
    Ok(())
}

fn parse_schedule_args(
    every: Option<u64>,
    cron: Option<String>,
    at: Option<String>,
) -> Result<CronSchedule> {
    match (every, cron, at) {
        (Some(secs), None, None) => Ok(CronSchedule::Every { ms: (secs as i64).saturating_mul(1000) }),
        (None, Some(expr), None) => {
            crate::scheduler::expr::normalize(&expr).map_err(anyhow::Error::msg)?;
            Ok(CronSchedule::Cron { expr })
        }
        (None, None, Some(at_str)) => {
            let dt = chrono::DateTime::parse_from_rfc3339(&at_str)
                .context("invalid --at timestamp; expected RFC 3339")?;
            Ok(CronSchedule::At { ms: dt.timestamp_millis() })
        }
        _ => anyhow::bail!("exactly one of --every, --cron, or --at is required"),
    }
}

fn new_job(name: String, message: String, schedule: CronSchedule) -> CronJob {
    let now = chrono::Utc::now().timestamp_millis();
    let delete_after_run = matches!(schedule, CronSchedule::At { .. });
    CronJob {
        id: uuid::Uuid::new_v4().to_string(),
        name,
        owner: None,
        schedule,
        payload: CronPayload { prompt: message, deliver: false, target_channel: None, target_chat_id: None },
        enabled: true,
        created_at_ms: now,
        next_fire_at_ms: now,
        last_fire_at_ms: None,
        delete_after_run,
    }
}

fn warn_if_no_api_key(config: &Config) {
    if config.provider.api_key.is_none() {
        warn!("no provider API key configured; set CONDUCTOR_PROVIDER_API_KEY or provider.api_key");
    }
}
