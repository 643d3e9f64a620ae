use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Media error: {0}")]
    MediaError(String),

    #[error("Signaling error: {0}")]
    SignalingError(String),

    #[error("Negotiation error: {0}")]
    NegotiationError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Chat error: {0}")]
    ChatError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, AppError>;
