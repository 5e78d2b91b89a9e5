use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::config::ToolsConfig;

use super::base::{Tool, ToolDefinition, ToolResult};
use super::rate_limit::ToolRateLimiter;

const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(120);
const CACHE_CAPACITY: usize = 256;
const CACHE_TTL: Duration = Duration::from_secs(30);
/// Tools whose result is a pure function of their params and safe to
/// memoize briefly; mutating tools are never cached.
const CACHEABLE_TOOLS: &[&str] = &["read_file", "list_dir", "web_search", "web_fetch"];
const MAX_RESULT_BYTES: usize = 64 * 1024;

struct CacheEntry {
    result: ToolResult,
    expires_at: Instant,
}

/// `name → Tool`, with a rate limiter, a small read-through cache, and
/// truncation/logging applied uniformly around every invocation.
pub struct ToolRegistry {
    tools: Mutex<HashMap<String, Arc<dyn Tool>>>,
    rate_limiter: ToolRateLimiter,
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl ToolRegistry {
    pub fn new(tools_config: &ToolsConfig) -> Self {
        Self {
            tools: Mutex::new(HashMap::new()),
            rate_limiter: ToolRateLimiter::new(tools_config),
            cache: Mutex::new(LruCache::new(
                std::num::NonZeroUsize::new(CACHE_CAPACITY).expect("nonzero"),
            )),
        }
    }

    /// Last `register` with a given name wins; the prior `Arc` is
    /// dropped once nothing else references it.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let mut tools = self.tools.lock().await;
        tools.insert(tool.name().to_string(), tool);
    }

    pub async fn unregister(&self, name: &str) {
        let mut tools = self.tools.lock().await;
        tools.remove(name);
    }

    /// Definitions in function-calling shape, optionally excluding
    /// named tools (used to strip `spawn` from background/cron turns).
    pub async fn definitions(&self, exclude: &[&str]) -> Vec<ToolDefinition> {
        let tools = self.tools.lock().await;
        tools
            .values()
            .filter(|t| !exclude.contains(&t.name()))
            .map(|t| {
                super::base::ToolFunctionDefinition {
                    name: t.name().to_string(),
                    description: t.description().to_string(),
                    parameters: t.parameters(),
                }
                .into_definition()
            })
            .collect()
    }

    pub async fn execute(&self, name: &str, params: Value, session_key: &str) -> ToolResult {
        let tool = {
            let tools = self.tools.lock().await;
            tools.get(name).cloned()
        };
        let Some(tool) = tool else {
            return ToolResult::error(format!("Tool not found: {name}"));
        };

        if let Err(msg) = self.rate_limiter.check(name, session_key) {
            warn!(tool = name, session_key, "rate limit rejected tool call");
            return ToolResult::error(msg);
        }

        let schema = tool.parameters();
        if let Err(msg) = validate_params(&schema, &params) {
            return ToolResult::error(msg);
        }

        let cache_key = if CACHEABLE_TOOLS.contains(&name) {
            Some(canonical_json(name, &params))
        } else {
            None
        };
        if let Some(key) = &cache_key {
            let mut cache = self.cache.lock().await;
            if let Some(entry) = cache.get(key) {
                if entry.expires_at > Instant::now() {
                    debug!(tool = name, "tool cache hit");
                    return entry.result.clone();
                }
            }
        }

        let result = execute_with_guards(tool, params).await;
        let result = truncate_result(result);

        match &result {
            ToolResult::Success(_) => debug!(tool = name, session_key, "tool call succeeded"),
            ToolResult::Error(msg) => warn!(tool = name, session_key, error = msg, "tool call errored"),
            ToolResult::AccessDenied(msg) => {
                error!(tool = name, session_key, reason = msg, "tool call denied")
            }
        }

        if let (Some(key), ToolResult::Success(_)) = (&cache_key, &result) {
            let mut cache = self.cache.lock().await;
            cache.put(
                key.clone(),
                CacheEntry {
                    result: result.clone(),
                    expires_at: Instant::now() + CACHE_TTL,
                },
            );
        }

        result
    }
}

async fn execute_with_guards(tool: Arc<dyn Tool>, params: Value) -> ToolResult {
    let name = tool.name().to_string();
    let fut = tokio::task::spawn(async move { tool.execute(params).await });
    match tokio::time::timeout(DEFAULT_TOOL_TIMEOUT, fut).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => {
            if join_err.is_panic() {
                error!(tool = name, "tool panicked");
            }
            ToolResult::error(format!("Error executing {name}"))
        }
        Err(_) => ToolResult::error(format!("Tool '{name}' timed out")),
    }
}

fn truncate_result(result: ToolResult) -> ToolResult {
    let truncate = |s: String| -> String {
        if s.len() <= MAX_RESULT_BYTES {
            return s;
        }
        let mut bytes = s.into_bytes();
        bytes.truncate(MAX_RESULT_BYTES);
        while std::str::from_utf8(&bytes).is_err() {
            bytes.pop();
        }
        let mut out = String::from_utf8(bytes).unwrap_or_default();
        out.push_str(&format!(
            "\n... (output truncated at {MAX_RESULT_BYTES} bytes)"
        ));
        out
    };
    match result {
        ToolResult::Success(s) => ToolResult::Success(truncate(s)),
        ToolResult::Error(s) => ToolResult::Error(truncate(s)),
        ToolResult::AccessDenied(s) => ToolResult::AccessDenied(truncate(s)),
    }
}

/// Stable cache key: sorts object keys recursively so semantically
/// identical params always hash the same regardless of field order.
fn canonical_json(tool: &str, params: &Value) -> String {
    format!("{tool}:{}", canonical_value(params))
}

fn canonical_value(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let parts: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{k:?}:{}", canonical_value(v)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_value).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

/// Validates `params` against the declared JSON-schema subset
/// (required keys, string length/enum, numeric range, array items,
/// nested objects). Not a full JSON Schema implementation — only the
/// subset tool authors are expected to declare.
fn validate_params(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(required) = schema.get("required").and_then(Value::as_array) else {
        return validate_properties(schema, params);
    };
    for key in required {
        let Some(key) = key.as_str() else { continue };
        if params.get(key).is_none() {
            return Err(format!("Missing required parameter: {key}"));
        }
    }
    validate_properties(schema, params)
}

fn validate_properties(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    let Some(params_obj) = params.as_object() else {
        return Err("Expected an object of parameters".to_string());
    };
    for (key, prop_schema) in properties {
        if let Some(value) = params_obj.get(key) {
            validate_value(key, prop_schema, value)?;
        }
    }
    Ok(())
}

fn validate_value(key: &str, schema: &Value, value: &Value) -> Result<(), String> {
    let ty = schema.get("type").and_then(Value::as_str);
    match ty {
        Some("string") => {
            let Some(s) = value.as_str() else {
                return Err(format!("Parameter '{key}' must be a string"));
            };
            if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
                if (s.len() as u64) < min {
                    return Err(format!("Parameter '{key}' shorter than minLength {min}"));
                }
            }
            if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
                if (s.len() as u64) > max {
                    return Err(format!("Parameter '{key}' longer than maxLength {max}"));
                }
            }
            if let Some(enum_values) = schema.get("enum").and_then(Value::as_array) {
                if !enum_values.iter().any(|v| v.as_str() == Some(s)) {
                    return Err(format!("Parameter '{key}' not one of the allowed values"));
                }
            }
            Ok(())
        }
        Some("integer") | Some("number") => {
            let Some(n) = value.as_f64() else {
                return Err(format!("Parameter '{key}' must be a number"));
            };
            if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
                if n < min {
                    return Err(format!("Parameter '{key}' below minimum {min}"));
                }
            }
            if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
                if n > max {
                    return Err(format!("Parameter '{key}' above maximum {max}"));
                }
            }
            Ok(())
        }
        Some("boolean") => {
            if value.as_bool().is_none() {
                return Err(format!("Parameter '{key}' must be a boolean"));
            }
            Ok(())
        }
        Some("array") => {
            let Some(items) = value.as_array() else {
                return Err(format!("Parameter '{key}' must be an array"));
            };
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    validate_value(&format!("{key}[{i}]"), item_schema, item)?;
                }
            }
            Ok(())
        }
        Some("object") => validate_properties(schema, value),
        _ => Ok(()),
    }
}
