use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::process::ProcessError;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error("{tool} not found, install it and add it to PATH")]
    ToolMissing { tool: String },
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
    #[error("{path} already exists and is not part of this pair")]
    Occupied { path: PathBuf },
    #[error("muxed output {path} is missing or empty")]
    EmptyOutput { path: PathBuf },
    #[error("io error at {path}: {source}")]
    Io {
        source: std::io::Error,
        path: PathBuf,
    },
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
}

pub type MuxResult<T> = Result<T, MuxError>;
