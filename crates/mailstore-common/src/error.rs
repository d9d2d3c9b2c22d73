//! Error types for mailstore

use thiserror::Error;

/// Main error type for mailstore
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backing store unreachable or a query failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The session's cached mailbox view disagrees with storage.
    #[error("Mailbox out of sync: {0}")]
    Sync(String),

    /// Malformed or empty search, sort or rights expression.
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A storage, auth or sort driver could not be set up at startup.
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailstore
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Storage(_) => "STORAGE_ERROR",
            Error::Sync(_) => "SYNC_ERROR",
            Error::InvalidQuery(_) => "INVALID_QUERY",
            Error::Auth(_) => "UNAUTHORIZED",
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::PermissionDenied(_) => "FORBIDDEN",
            Error::Backend(_) => "BACKEND_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the client may retry the same request later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Sync(_))
    }

    /// Whether the process cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Backend(_) | Error::Config(_))
    }

    /// Wrap any displayable storage failure.
    pub fn storage(e: impl std::fmt::Display) -> Self {
        Error::Storage(e.to_string())
    }
}
