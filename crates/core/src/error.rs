use std::path::PathBuf;

use thiserror::Error;

/// Failure of one external transcode run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to start {binary}: {reason}")]
    Spawn { binary: String, reason: String },

    #[error("ffmpeg exited with {status}: {stderr_tail}")]
    Failed { status: String, stderr_tail: String },

    #[error("ffmpeg reported \"{marker}\": {stderr_tail}")]
    MarkedFailure {
        marker: &'static str,
        stderr_tail: String,
    },

    #[error("output file was not produced: {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("output file is empty: {}", .0.display())]
    EmptyOutput(PathBuf),

    #[error("media probe failed: {0}")]
    Probe(String),

    #[error("transcode worker aborted: {0}")]
    Aborted(String),
}

/// Request-level error taxonomy shared by the service and the HTTP surface.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    TooLarge(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{0}")]
    Internal(String),
}

impl EditError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }
}

impl From<std::io::Error> for EditError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}
