use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Redacts a secret-bearing field in a derived-looking `Debug` impl.
/// Declarative macro mirroring the teacher's credential-hiding
/// convention: logs and error messages should never leak API keys.
macro_rules! redact_debug {
    ($ty:ident { $($field:ident: $redact:expr),* $(,)? }) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut s = f.debug_struct(stringify!($ty));
                $(
                    if $redact {
                        s.field(stringify!($field), &"<redacted>");
                    } else {
                        s.field(stringify!($field), &self.$field);
                    }
                )*
                s.finish()
            }
        }
    };
}

#[derive(Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxMode {
    #[default]
    None,
    Landlock,
    Seatbelt,
    Helper,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub default_model: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    60
}

redact_debug!(ProviderConfig {
    base_url: false,
    api_key: true,
    default_model: false,
    request_timeout_secs: false,
});

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RateLimitOverride {
    pub per_minute: u32,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct ToolsConfig {
    #[serde(default)]
    pub rate_limits: HashMap<String, RateLimitOverride>,
    #[serde(default)]
    pub exec_allow_patterns: Vec<String>,
    #[serde(default)]
    pub exec_deny_patterns: Vec<String>,
    #[serde(default = "default_web_fetch_max_chars")]
    pub web_fetch_max_chars: usize,
    #[serde(default = "default_web_fetch_timeout_secs")]
    pub web_fetch_timeout_secs: u64,
    #[serde(default)]
    pub web_search_api_key: Option<String>,
}

redact_debug!(ToolsConfig {
    rate_limits: false,
    exec_allow_patterns: false,
    exec_deny_patterns: false,
    web_fetch_max_chars: false,
    web_fetch_timeout_secs: false,
    web_search_api_key: true,
});

fn default_web_fetch_max_chars() -> usize {
    20_000
}

fn default_web_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub allowlist: Vec<String>,
}

redact_debug!(McpServerConfig {
    name: false,
    command: false,
    args: false,
    env: true,
    allowlist: false,
});

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    pub store_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_memory_window")]
    pub window: usize,
    #[serde(default = "default_memory_doc_cap_bytes")]
    pub doc_cap_bytes: usize,
}

fn default_memory_window() -> usize {
    40
}

fn default_memory_doc_cap_bytes() -> usize {
    8 * 1024
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window: default_memory_window(),
            doc_cap_bytes: default_memory_doc_cap_bytes(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    pub workspace: PathBuf,
    #[serde(default)]
    pub sandbox_mode: SandboxMode,
    pub provider: ProviderConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_tool_iterations() -> usize {
    20
}

redact_debug!(Config {
    workspace: false,
    sandbox_mode: false,
    provider: false,
    tools: false,
    mcp_servers: false,
    scheduler: false,
    memory: false,
    log_level: false,
    max_tool_iterations: false,
});

impl Config {
    /// Fails construction (rather than at first use) when the
    /// configuration is internally inconsistent.
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.provider.base_url.trim().is_empty() {
            return Err(crate::errors::ConductorError::configuration(
                "provider.base_url must not be empty",
            ));
        }
        if self.memory.window == 0 {
            return Err(crate::errors::ConductorError::configuration(
                "memory.window must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_redacts_api_key() {
        let cfg = ProviderConfig {
            base_url: "https://api.example.com".into(),
            api_key: Some("sk-super-secret".into()),
            default_model: "gpt".into(),
            request_timeout_secs: 30,
        };
        let rendered = format!("{:?}", cfg);
        assert!(!rendered.contains("sk-super-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn validate_rejects_empty_base_url() {
        let cfg = Config {
            workspace: PathBuf::from("/tmp/ws"),
            sandbox_mode: SandboxMode::None,
            provider: ProviderConfig {
                base_url: String::new(),
                api_key: None,
                default_model: "m".into(),
                request_timeout_secs: 30,
            },
            tools: ToolsConfig::default(),
            mcp_servers: vec![],
            scheduler: SchedulerConfig::default(),
            memory: MemoryConfig::default(),
            log_level: "info".into(),
            max_tool_iterations: 20,
        };
        assert!(cfg.validate().is_err());
    }
}
