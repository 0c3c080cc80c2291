use thiserror::Error;

/// Error taxonomy for the query pipeline.
///
/// Only `AllBackendsFailed` and `InvalidInput` are ever user-visible;
/// everything else is handled locally by dropping the failing item or task.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Missing or contradictory configuration at startup. Fatal.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A single LLM or retriever call failed or timed out. The failing
    /// item is dropped; siblings proceed.
    #[error("external call to {target} failed: {reason}")]
    ExternalCall { target: String, reason: String },

    /// Every selected retrieval backend failed for one search.
    /// Surfaced to the caller as an `error` message.
    #[error("all {attempted} retrieval backends failed")]
    AllBackendsFailed { attempted: usize },

    /// A tool handler raised; the caller falls back to plain search
    /// unless plain search was already running.
    #[error("tool handler '{tool}' failed: {reason}")]
    ToolHandler { tool: String, reason: String },

    /// Missing `query` or malformed parameters. Rejected with a 400
    /// before the pipeline starts.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Caller disconnected mid-stream. Not an error: emission becomes a
    /// no-op and tasks drain.
    #[error("client connection lost")]
    ConnectionLost,
}

impl GatewayError {
    pub fn external(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        GatewayError::ExternalCall {
            target: target.into(),
            reason: err.to_string(),
        }
    }

    /// True for failures that must never abort sibling tasks.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            GatewayError::ExternalCall { .. } | GatewayError::ConnectionLost
        )
    }
}
