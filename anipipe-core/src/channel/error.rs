use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("display name has no usable characters")]
    EmptyName,
    #[error("channel creation failed: {0}")]
    Creation(String),
    #[error("handle {handle} is already taken")]
    HandleOccupied { handle: String },
    #[error("platform rejected request ({status}): {message}")]
    Platform { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid platform response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
}

impl ChannelError {
    /// Transient failures worth another attempt: network trouble, rate limits
    /// and server-side errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Network(_) => true,
            ChannelError::Platform { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => ChannelError::Platform {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => ChannelError::Network(err.to_string()),
        }
    }
}

pub type ChannelResult<T> = Result<T, ChannelError>;
