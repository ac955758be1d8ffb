use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{tool} not found, install it and add it to PATH")]
    ToolMissing { tool: String },
    #[error("metadata extraction failed: {0}")]
    Extraction(String),
    #[error("invalid extractor output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{title} does not look like an English dub")]
    NotDub { title: String },
    #[error("{stage} exited with status {status:?}: {stderr}")]
    Failed {
        stage: &'static str,
        status: Option<i32>,
        stderr: String,
    },
    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[error("download finished but no video file was found for {stem}")]
    NoOutput { stem: String },
    #[error("{path} already holds another download of this episode")]
    EpisodeExists { path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
}

impl DownloadError {
    /// Missing tools, rejected content and taken episode names fail the same
    /// way on every attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DownloadError::ToolMissing { .. }
                | DownloadError::NotDub { .. }
                | DownloadError::EpisodeExists { .. }
        )
    }
}

pub type DownloadResult<T> = Result<T, DownloadError>;
