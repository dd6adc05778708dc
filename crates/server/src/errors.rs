//! Structured error responses for the gateway meta-tools.
//!
//! Every error that crosses the meta-tool boundary is shaped into the
//! same JSON envelope: `{"error": <message>, "code": <identifier>,
//! "details": {..}}`. Internal errors are logged with full context but
//! only the envelope reaches the client.

use rmcp::model::{CallToolResult, Content};
use serde::Serialize;
use serde_json::Value;

/// Stable machine-readable error codes.
pub mod codes {
    pub const TOOL_NOT_FOUND: &str = "tool_not_found";
    pub const DOMAIN_NOT_FOUND: &str = "domain_not_found";
    pub const GROUP_NOT_FOUND: &str = "group_not_found";
    pub const EXECUTION_ERROR: &str = "execution_error";
    pub const UPSTREAM_ERROR: &str = "upstream_error";
    pub const REFRESH_ERROR: &str = "refresh_error";
    pub const FORBIDDEN: &str = "forbidden";
}

/// Machine-parseable error returned by gateway meta-tools.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayError {
    /// Human-readable error message.
    pub error: String,
    /// Machine-readable code such as `"tool_not_found"`.
    pub code: String,
    /// Optional structured context (suggestions, valid domain names, etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl GatewayError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Render this error as a tool result with `is_error` set.
    pub fn into_result(self) -> CallToolResult {
        let value = serde_json::to_value(&self).unwrap_or_else(|_| {
            serde_json::json!({"error": self.error, "code": self.code})
        });
        let text = value.to_string();
        CallToolResult {
            content: vec![Content::text(text)],
            is_error: Some(true),
            structured_content: Some(value),
            meta: None,
        }
    }
}

/// Errors raised by the upstream connection manager.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("'{0}' is not a registered upstream")]
    UnknownDomain(String),

    #[error("failed to connect to upstream '{domain}': {source}")]
    Connect {
        domain: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("upstream '{domain}' call failed: {source}")]
    Call {
        domain: String,
        #[source]
        source: anyhow::Error,
    },
}
