use thiserror::Error;

/// Errors surfaced by the aggregator (spec §7 `tool_transport_failure`,
/// `tool_timeout`).
#[derive(Debug, Error)]
pub enum AggregatorError {
    #[error("unknown qualified tool name: {0}")]
    UnknownTool(String),

    #[error("server '{server_id}' unavailable: {reason}")]
    ServerUnavailable { server_id: String, reason: String },

    #[error("tool call timed out after {0}s")]
    Timeout(u64),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed tool result: {0}")]
    MalformedResult(String),

    #[error("config error: {0}")]
    Config(String),
}

impl AggregatorError {
    /// Whether a retry of the same call might succeed (spec §7 `transient`).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AggregatorError::Timeout(_) | AggregatorError::Transport(_) | AggregatorError::ServerUnavailable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, AggregatorError>;

/// Lifts an aggregator failure into the umbrella error taxonomy for a given
/// qualified tool name (spec §4.3 "return a structured error result to the
/// orchestrator with `{kind: tool_failure, reason, transient}`").
pub fn to_tool_failure(tool: &str, err: &AggregatorError) -> gateway_core::GatewayError {
    gateway_core::GatewayError::ToolFailure {
        tool: tool.to_string(),
        reason: err.to_string(),
        transient: err.is_transient(),
    }
}
