//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Malformed request (missing title, empty path, bad argument).
    Validation(String),
    /// Unknown session ID, title, or process handle.
    NotFound(String),
    /// Operation is not valid for the session's current status.
    Precondition(String),
    /// Workspace or process backend failure, with its cause.
    ExternalService(String),
    /// Session store I/O failure.
    Persistence(String),
    /// Deadline exceeded; the external process was terminated.
    Timeout(String),
    /// Cancelled while waiting for an execution slot.
    ConcurrencyLimit(String),
    /// Configuration parsing or validation failure.
    Config(String),
    /// Local I/O failure outside the external services.
    Io(String),
}

impl AppError {
    /// Wrap an external service failure with a short context prefix.
    #[must_use]
    pub fn external(context: &str, cause: impl Display) -> Self {
        Self::ExternalService(format!("{context}: {cause}"))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Precondition(msg) => write!(f, "precondition failed: {msg}"),
            Self::ExternalService(msg) => write!(f, "external service: {msg}"),
            Self::Persistence(msg) => write!(f, "persistence: {msg}"),
            Self::Timeout(msg) => write!(f, "timeout: {msg}"),
            Self::ConcurrencyLimit(msg) => write!(f, "concurrency limit: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(err.to_string())
    }
}
