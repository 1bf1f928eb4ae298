use quill_providers::ProviderError;

/// Failure of one orchestrated request. Never crosses into other sessions.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<ProviderError> for EngineError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::MissingApiKey => EngineError::Configuration(err.to_string()),
            ProviderError::Http(_) | ProviderError::Status { .. } => {
                EngineError::Transport(err.to_string())
            }
            ProviderError::Protocol(_) => EngineError::Protocol(err.to_string()),
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "configuration",
            EngineError::Transport(_) => "transport",
            EngineError::Protocol(_) => "protocol",
            EngineError::Storage(_) => "storage",
        }
    }
}
