use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum DownloadError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Unexpected HTTP status {0}")]
    UnexpectedStatus(u16),

    #[error("URL refers to an empty file")]
    MediaIsEmpty,

    #[error("Response body too large: {size} bytes (limit {limit})")]
    BodyTooLarge { size: u64, limit: usize },

    #[error("No free connections to host {0}")]
    NoFreeConnections(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Only per-host connection exhaustion is worth another attempt; every
    /// other failure drops the URL.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::NoFreeConnections(_))
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout(timeout)
        } else if err.is_builder() {
            DownloadError::InvalidUrl(err.to_string())
        } else {
            DownloadError::Transport(err.to_string())
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CountError {
    #[error("Image could not be decoded: {0}")]
    Decode(String),

    #[error("Image has no pixels")]
    EmptyImage,

    #[error("Counting task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Error)]
pub enum OutputError {
    #[error("IO error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for OutputError {
    fn from(err: std::io::Error) -> Self {
        OutputError::IoError(err.to_string())
    }
}

#[derive(Debug, Clone, Error)]
pub enum InputError {
    #[error("Failed to open input {path}: {message}")]
    Open { path: PathBuf, message: String },

    #[error("Input already started")]
    AlreadyStarted,
}

#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read config file: {0}")]
    Read(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// Errors that stop the whole pipeline. Per-URL and per-image failures never
/// surface here; they are logged by the stage that hit them.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Input error: {0}")]
    Input(#[from] InputError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("HTTP client error: {0}")]
    HttpClient(String),
}
