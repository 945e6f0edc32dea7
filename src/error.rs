use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Media acquisition failed: {0}")]
    MediaAcquisition(String),

    #[error("No call with ID: {0}")]
    CallNotFound(String),

    #[error("Call already answered: {0}")]
    CallAlreadyAnswered(String),

    #[error("A call is already in progress")]
    CallActive,

    #[error("Call attempt cancelled")]
    Cancelled,

    #[error("Signaling write failed: {0}")]
    SignalingWrite(String),

    #[error("Signaling read failed: {0}")]
    SignalingRead(String),

    #[error("Teardown incomplete: {failed} of {attempted} deletions failed")]
    Teardown { failed: usize, attempted: usize },

    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias used across the crate
pub type Result<T> = std::result::Result<T, AppError>;
