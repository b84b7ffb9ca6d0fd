use thiserror::Error;

pub type Result<T> = std::result::Result<T, AttachmentError>;

/// Attachment-service error taxonomy (spec §4.5, §7 `attachment_validation`).
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("unsupported mime type: {0}")]
    UnsupportedMimeType(String),

    #[error("attachment too large: {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("attachment not found: {0}")]
    NotFound(String),

    #[error("object store error: {0}")]
    Store(#[from] object_store::Error),

    #[error("repository error: {0}")]
    Repository(#[from] repository::RepositoryError),
}

impl From<AttachmentError> for gateway_core::GatewayError {
    fn from(err: AttachmentError) -> Self {
        match err {
            AttachmentError::Repository(e) => e.into(),
            AttachmentError::NotFound(id) => gateway_core::GatewayError::AttachmentValidation(format!(
                "attachment not found: {id}"
            )),
            other => gateway_core::GatewayError::AttachmentValidation(other.to_string()),
        }
    }
}
