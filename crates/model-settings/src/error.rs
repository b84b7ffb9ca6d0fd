use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelSettingsError {
    #[error("preset not found: {0}")]
    PresetNotFound(String),

    #[error("atomic write failed: {0}")]
    AtomicWrite(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("title generation failed: {0}")]
    TitleGeneration(String),
}

pub type Result<T> = std::result::Result<T, ModelSettingsError>;

impl From<ModelSettingsError> for gateway_core::GatewayError {
    fn from(err: ModelSettingsError) -> Self {
        match err {
            ModelSettingsError::AtomicWrite(reason) => gateway_core::GatewayError::ConfigAtomicWrite(reason),
            ModelSettingsError::Serialization(e) => gateway_core::GatewayError::Serialization(e),
            ModelSettingsError::Io(e) => gateway_core::GatewayError::Io(e),
            other => gateway_core::GatewayError::Internal(other.to_string()),
        }
    }
}
