//! Closed error taxonomy returned to clients, plus the orchestrator-facing
//! operation errors that wrap it.

use thiserror::Error;

/// Stable, client-visible error identifiers.
///
/// Every variant's `Display` message is safe to show to an end user: no raw
/// stack traces, no internal paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidInput,
    NotFound,
    IllegalTransition,
    VideoUnavailable,
    NetworkError,
    FormatError,
    AuthRequired,
    NoImagesFound,
    TweetUnavailable,
    UserNotFound,
    InvalidUrl,
    WatchdogStall,
    Timeout,
    DiskFull,
    InternalError,
}

impl ErrorCode {
    /// Whether the Broker should schedule a retry for a failure carrying
    /// this code, subject to the attempt counter.
    pub fn retry_eligible(self) -> bool {
        matches!(
            self,
            ErrorCode::NetworkError
                | ErrorCode::WatchdogStall
                | ErrorCode::DiskFull
                | ErrorCode::InternalError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::IllegalTransition => "ILLEGAL_TRANSITION",
            ErrorCode::VideoUnavailable => "VIDEO_UNAVAILABLE",
            ErrorCode::NetworkError => "NETWORK_ERROR",
            ErrorCode::FormatError => "FORMAT_ERROR",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::NoImagesFound => "NO_IMAGES_FOUND",
            ErrorCode::TweetUnavailable => "TWEET_UNAVAILABLE",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::InvalidUrl => "INVALID_URL",
            ErrorCode::WatchdogStall => "WATCHDOG_STALL",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::DiskFull => "DISK_FULL",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure carrying both the stable code and a display message.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl JobFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Errors surfaced synchronously to callers of the Orchestrator's public
/// operations (§4.6). Distinct from [`ErrorCode`], which is the taxonomy for
/// job-run failures; these are operation-level rejections.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("job not found")]
    NotFound,
    #[error("operation not valid for current status")]
    IllegalTransition,
    #[error("store conflict: id already exists")]
    Conflict,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
