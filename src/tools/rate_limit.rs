use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Mutex;

use governor::state::keyed::DefaultKeyedStateStore;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};

use crate::config::ToolsConfig;

const DEFAULT_GLOBAL_PER_MINUTE: u32 = 100;
const DEFAULT_PER_SESSION_TOOL_PER_MINUTE: u32 = 30;

fn default_per_tool_per_minute(tool: &str) -> u32 {
    match tool {
        "exec" => 10,
        "web_fetch" => 20,
        "web_search" => 10,
        _ => DEFAULT_GLOBAL_PER_MINUTE,
    }
}

type Direct = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type Keyed = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

fn limiter(per_minute: u32) -> Direct {
    let quota = Quota::per_minute(NonZeroU32::new(per_minute.max(1)).expect("nonzero"));
    RateLimiter::direct(quota)
}

/// Three layered limits checked in order: global, per-tool-global,
/// per-session-per-tool. A rejection at any layer is the final
/// answer — the remaining layers are not consulted.
pub struct ToolRateLimiter {
    global: Direct,
    per_tool: Mutex<HashMap<String, Direct>>,
    per_tool_quota: HashMap<String, u32>,
    per_session_tool: Keyed,
    per_session_tool_quota: u32,
}

impl ToolRateLimiter {
    pub fn new(config: &ToolsConfig) -> Self {
        let per_session_tool_quota = config
            .rate_limits
            .get("__per_session_tool__")
            .map(|o| o.per_minute)
            .unwrap_or(DEFAULT_PER_SESSION_TOOL_PER_MINUTE);
        let global_quota = config
            .rate_limits
            .get("__global__")
            .map(|o| o.per_minute)
            .unwrap_or(DEFAULT_GLOBAL_PER_MINUTE);

        Self {
            global: limiter(global_quota),
            per_tool: Mutex::new(HashMap::new()),
            per_tool_quota: config
                .rate_limits
                .iter()
                .map(|(k, v)| (k.clone(), v.per_minute))
                .collect(),
            per_session_tool: RateLimiter::keyed(Quota::per_minute(
                NonZeroU32::new(per_session_tool_quota.max(1)).expect("nonzero"),
            )),
            per_session_tool_quota,
        }
    }

    /// Checks and, if accepted, consumes one permit at every layer.
    /// Returns `Err` with a model-visible message on the first layer
    /// that rejects.
    pub fn check(&self, tool: &str, session_key: &str) -> Result<(), String> {
        if self.global.check().is_err() {
            return Err("Rate limit exceeded (global)".to_string());
        }

        let quota = self
            .per_tool_quota
            .get(tool)
            .copied()
            .unwrap_or_else(|| default_per_tool_per_minute(tool));
        {
            let mut per_tool = self.per_tool.lock().expect("rate limiter mutex poisoned");
            let entry = per_tool.entry(tool.to_string()).or_insert_with(|| limiter(quota));
            if entry.check().is_err() {
                return Err(format!("Rate limit exceeded for tool '{tool}'"));
            }
        }

        let key = format!("{session_key}:{tool}");
        if self.per_session_tool.check_key(&key).is_err() {
            return Err(format!(
                "Rate limit exceeded for '{tool}' in this session"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_up_to_quota_then_rejects() {
        let mut config = ToolsConfig::default();
        config
            .rate_limits
            .insert("exec".to_string(), crate::config::schema::RateLimitOverride { per_minute: 2 });
        let limiter = ToolRateLimiter::new(&config);
        assert!(limiter.check("exec", "cli:u1").is_ok());
        assert!(limiter.check("exec", "cli:u1").is_ok());
        assert!(limiter.check("exec", "cli:u1").is_err());
    }

    #[test]
    fn per_session_limit_is_independent_per_session() {
        let config = ToolsConfig::default();
        let limiter = ToolRateLimiter::new(&config);
        for _ in 0..DEFAULT_PER_SESSION_TOOL_PER_MINUTE {
            assert!(limiter.check("read_file", "cli:u1").is_ok());
        }
        assert!(limiter.check("read_file", "cli:u1").is_err());
        // A different session is unaffected.
        assert!(limiter.check("read_file", "cli:u2").is_ok());
    }
}
