//! Shared error taxonomy. Behavioral categories, not exception types —
//! see the propagation policy: tools convert everything to a
//! [`crate::tools::ToolResult`]; the registry never panics out; the
//! agent loop turns provider failures into a user-visible message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConductorError {
    /// Fatal at startup: bad config, missing provider, unsupported
    /// sandbox primitive for the requested mode.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Tool-visible security denial: workspace escape, denied command
    /// pattern, SSRF block, `.env` access, owner mismatch.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// Tool-visible input problem: missing/mistyped params, invalid
    /// cron expression, `at` in the past, etc.
    #[error("validation error: {0}")]
    Validation(String),

    /// Tool-visible rate limit rejection.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// Retry candidate: provider 5xx, sandbox socket I/O error, MCP
    /// subprocess crash. Only the sandbox reconnect retries silently;
    /// provider/MCP callers must decide for themselves.
    #[error("transient error: {0}")]
    Transient(String),

    /// Surfaced to the user as-is: provider auth failure, tool
    /// iteration overflow, unrecoverable sandbox failure.
    #[error("fatal to turn: {0}")]
    FatalToTurn(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ConductorError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ConductorError::Transient(_))
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        ConductorError::Configuration(msg.into())
    }

    pub fn access_denied(msg: impl Into<String>) -> Self {
        ConductorError::AccessDenied(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        ConductorError::Validation(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;
