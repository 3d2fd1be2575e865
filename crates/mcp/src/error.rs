//! Error types for the protocol engine.

use crate::protocol::JsonRpcError;
use toolgate_core::RateLimitError;

pub type McpResult<T> = Result<T, McpError>;

/// Protocol-level failures surfaced to the immediate caller.
///
/// Tool-level failures (bad arguments, a file that does not exist) are not
/// errors here: tools report those as a `CallToolResult` with `is_error`.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Registration with an empty name or without a handler.
    #[error("invalid tool: {0}")]
    InvalidTool(String),

    /// Registration collides with an existing tool.
    #[error("tool {0:?} already registered")]
    DuplicateName(String),

    /// Invocation or lookup of an unregistered tool.
    #[error("unknown tool: {0}")]
    ToolNotFound(String),

    /// `notify_list_changed` with an identifier outside the four list kinds.
    #[error("unsupported list change notification: {0}")]
    UnsupportedNotification(String),

    /// A rate limit wait failed or was cancelled.
    #[error("rate limited: {0}")]
    RateLimited(#[from] RateLimitError),

    /// The tool handler itself failed.
    #[error("tool {tool} failed: {source}")]
    HandlerFailure {
        tool: String,
        #[source]
        source: anyhow::Error,
    },

    /// A notification subscriber failed; later subscribers were skipped.
    #[error("notification handler for {method} failed: {source}")]
    SubscriberFailure {
        method: String,
        #[source]
        source: anyhow::Error,
    },

    /// No such RPC method.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Request params could not be decoded.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl McpError {
    /// JSON-RPC error object for this failure
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            Self::ToolNotFound(_) | Self::InvalidParams(_) => {
                JsonRpcError::invalid_params(self.to_string())
            }
            Self::MethodNotFound(method) => JsonRpcError::method_not_found(method),
            Self::RateLimited(reason) => {
                JsonRpcError::custom(JsonRpcError::RATE_LIMITED, self.to_string())
                    .with_data(serde_json::json!({ "reason": rate_limit_reason(reason) }))
            }
            _ => JsonRpcError::internal_error(self.to_string()),
        }
    }
}

fn rate_limit_reason(err: &RateLimitError) -> &'static str {
    match err {
        RateLimitError::Cancelled => "cancelled",
        RateLimitError::DeadlineExceeded { .. } => "deadline_exceeded",
        RateLimitError::Exhausted => "exhausted",
        RateLimitError::InvalidLimit { .. } => "invalid_limit",
    }
}

impl From<McpError> for JsonRpcError {
    fn from(err: McpError) -> Self {
        err.to_rpc_error()
    }
}
