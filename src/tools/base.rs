use async_trait::async_trait;
use serde_json::Value;

/// Every tool advertises this capability set. Proxy tools (MCP) and
/// built-ins are constructed differently but are all `dyn Tool` once
/// registered — there is no separate type for "external" tools.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema (the declared subset: string/integer/number/boolean/
    /// array/object with optional length/range/enum constraints).
    fn parameters(&self) -> Value;

    async fn execute(&self, params: Value) -> ToolResult;
}

/// Model-visible result. `AccessDenied` is reserved for policy and
/// security denials; everything else that fails is `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolResult {
    Success(String),
    Error(String),
    AccessDenied(String),
}

impl ToolResult {
    pub fn is_error(&self) -> bool {
        !matches!(self, ToolResult::Success(_))
    }

    /// The string handed back to the model, regardless of variant.
    pub fn content(&self) -> &str {
        match self {
            ToolResult::Success(s) | ToolResult::Error(s) | ToolResult::AccessDenied(s) => s,
        }
    }

    pub fn success(s: impl Into<String>) -> Self {
        ToolResult::Success(s.into())
    }

    pub fn error(s: impl Into<String>) -> Self {
        ToolResult::Error(s.into())
    }

    pub fn access_denied(s: impl Into<String>) -> Self {
        ToolResult::AccessDenied(s.into())
    }
}

/// One entry of the registry's definitions view, in OpenAI/Anthropic
/// function-calling shape.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub function: ToolFunctionDefinition,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolFunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolFunctionDefinition {
    pub fn into_definition(self) -> ToolDefinition {
        ToolDefinition {
            kind: "function",
            function: self,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_returns_inner_string_for_every_variant() {
        assert_eq!(ToolResult::success("ok").content(), "ok");
        assert_eq!(ToolResult::error("bad").content(), "bad");
        assert_eq!(ToolResult::access_denied("no").content(), "no");
    }

    #[test]
    fn only_success_is_non_error() {
        assert!(!ToolResult::success("ok").is_error());
        assert!(ToolResult::error("bad").is_error());
        assert!(ToolResult::access_denied("no").is_error());
    }
}
