pub mod base;
pub mod cron;
pub mod filesystem;
pub mod image;
pub mod message;
pub mod rate_limit;
pub mod registry;
pub mod shell;
pub mod spawn;
pub mod web;

pub use base::{Tool, ToolDefinition, ToolResult};
pub use cron::{CronBackend, CronTool};
pub use filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
pub use image::ImageTool;
pub use message::MessageTool;
pub use registry::ToolRegistry;
pub use shell::{ExecTool, ShellMode};
pub use spawn::{SpawnTool, SubagentRunner};
pub use web::{WebFetchTool, WebSearchTool};

/// Tools excluded from the registry view handed to background/cron
/// turns (§4.9): subagents cannot be spawned from an unattended turn.
pub const BACKGROUND_EXCLUDED_TOOLS: &[&str] = &["spawn"];
