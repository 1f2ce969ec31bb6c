#![forbid(unsafe_code)]

//! Error taxonomy shared by the controller, the progress reporter and the HTTP
//! layer. Every variant maps to a stable [`ErrorKind`] code so clients can
//! branch on it without parsing messages.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[serde(rename = "validation_error")]
    Validation,
    ToolUnavailable,
    ExtractionFailed,
    DownloadFailed,
    Timeout,
    Cancelled,
    NotFound,
    NotReady,
    AlreadyDelivered,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::ToolUnavailable => "tool_unavailable",
            Self::ExtractionFailed => "extraction_failed",
            Self::DownloadFailed => "download_failed",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::NotFound => "not_found",
            Self::NotReady => "not_ready",
            Self::AlreadyDelivered => "already_delivered",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("{0}")]
    Validation(String),

    #[error(
        "the extractor tool is not installed or not runnable on this host; install yt-dlp or configure SIMPLYT_TOOLS_FILE"
    )]
    ToolUnavailable,

    #[error("extraction failed: {0}")]
    ExtractionFailed(String),

    #[error("{0}")]
    DownloadFailed(String),

    #[error("the extractor did not finish within {secs}s and was stopped")]
    Timeout { secs: u64 },

    #[error("download cancelled")]
    Cancelled,

    #[error("job not found")]
    NotFound,

    #[error("job is not ready: {0}")]
    NotReady(String),

    #[error("artifact already delivered")]
    AlreadyDelivered,

    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::ToolUnavailable => ErrorKind::ToolUnavailable,
            Self::ExtractionFailed(_) => ErrorKind::ExtractionFailed,
            Self::DownloadFailed(_) => ErrorKind::DownloadFailed,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::NotFound => ErrorKind::NotFound,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::AlreadyDelivered => ErrorKind::AlreadyDelivered,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Failure recorded on a job once it reaches `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&JobError> for JobFailure {
    fn from(err: &JobError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

pub type JobResult<T> = Result<T, JobError>;
