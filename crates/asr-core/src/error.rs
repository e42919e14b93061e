use thiserror::Error;

/// Errors produced by the relay protocol layer.
#[derive(Debug, Error)]
pub enum AsrError {
    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("upstream error {code}: {message}")]
    Upstream { code: u32, message: String },

    #[error("timeout")]
    Timeout,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type AsrResult<T> = Result<T, AsrError>;
