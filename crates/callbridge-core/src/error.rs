use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Session not found: {0}")]
    NotFound(String),

    #[error("Session already exists: {0}")]
    DuplicateSession(String),

    #[error("Remote command failed: {0}")]
    RemoteCommand(String),

    #[error("Conversation stream unavailable: {0}")]
    StreamUnavailable(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Short, stable label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::DuplicateSession(_) => "duplicate_session",
            Self::RemoteCommand(_) => "remote_command",
            Self::StreamUnavailable(_) => "stream_unavailable",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
