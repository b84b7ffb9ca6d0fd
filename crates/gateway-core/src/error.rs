use thiserror::Error;

/// Umbrella error taxonomy for the gateway (spec §7).
///
/// Each variant maps to one row of the error-kind table in the spec: the
/// `code()` method is what callers put in a terminal SSE `data:` frame or an
/// HTTP error body, so it must stay stable once shipped.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("provider error: {0}")]
    ProviderTransient(String),

    #[error("provider error: {0}")]
    ProviderFatal(String),

    #[error("tool loop exhausted after {iterations} iterations")]
    ToolLoopExhausted { iterations: usize },

    #[error("tool '{tool}' failed: {reason}")]
    ToolFailure {
        tool: String,
        reason: String,
        transient: bool,
    },

    #[error("attachment rejected: {0}")]
    AttachmentValidation(String),

    #[error("config write failed: {0}")]
    ConfigAtomicWrite(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Short error code surfaced to clients — in terminal SSE frames and in
    /// HTTP error bodies. Never change an existing mapping; add new variants
    /// instead.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::SessionNotFound { .. } => "session_not_found",
            GatewayError::ProviderTransient(_) => "provider_transient",
            GatewayError::ProviderFatal(_) => "provider_fatal",
            GatewayError::ToolLoopExhausted { .. } => "tool_loop_exhausted",
            GatewayError::ToolFailure { .. } => "tool_failure",
            GatewayError::AttachmentValidation(_) => "attachment_validation",
            GatewayError::ConfigAtomicWrite(_) => "config_atomic_write_failure",
            GatewayError::Database(_) => "database_error",
            GatewayError::Serialization(_) => "serialization_error",
            GatewayError::Io(_) => "io_error",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Internal(_) => "internal_error",
        }
    }

    /// Whether retrying the same request might succeed without operator
    /// intervention.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::ProviderTransient(_)
                | GatewayError::ToolFailure {
                    transient: true,
                    ..
                }
        )
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
