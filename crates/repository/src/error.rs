use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("session not found: {id}")]
    SessionNotFound { id: String },

    #[error("attachment not found: {id}")]
    AttachmentNotFound { id: String },

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid title source: {0}")]
    InvalidTitleSource(String),

    #[error("invalid message role: {0}")]
    InvalidRole(String),
}

impl From<RepositoryError> for gateway_core::GatewayError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::SessionNotFound { id } => gateway_core::GatewayError::SessionNotFound { id },
            other => gateway_core::GatewayError::Database(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RepositoryError>;
