//! Centralized error types for Repowatch.
//!
//! Remote, storage and configuration failures each get their own enum so
//! the sync layer can decide per kind whether a failure is surfaced or
//! hidden behind cached data. Use `user_message()` for UI-facing text.

use thiserror::Error;

/// Top-level application error type.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Returns a user-friendly message suitable for display in the UI.
    pub fn user_message(&self) -> &'static str {
        match self {
            AppError::Sync(e) => e.user_message(),
            AppError::Remote(e) => e.user_message(),
            AppError::Database(e) => e.user_message(),
            AppError::Config(e) => e.user_message(),
            AppError::Io(_) => "A file operation failed. Please try again.",
            AppError::Other(_) => "An unexpected error occurred. Please try again.",
        }
    }
}

/// Failures talking to the remote repository API.
///
/// Cloneable so that one failed refresh can be handed to every subscriber
/// waiting on the same scope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The host could not be reached, the connection dropped or timed out.
    #[error("Network error: {0}")]
    Network(String),

    /// Non-2xx response other than 404.
    #[error("Remote error: {status} - {message}")]
    Remote { status: u16, message: String },

    /// 404 on a lookup.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The payload did not match the expected shape.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Rejected before any request was sent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl RemoteError {
    pub fn user_message(&self) -> &'static str {
        match self {
            RemoteError::Network(_) => "Unable to connect. Check your internet connection.",
            RemoteError::Remote { status, .. } if *status >= 500 => {
                "GitHub is experiencing issues. Please try again later."
            }
            RemoteError::Remote { status: 403, .. } | RemoteError::Remote { status: 429, .. } => {
                "GitHub rate limit exceeded. Please wait and try again."
            }
            RemoteError::Remote { .. } => "GitHub request failed. Please try again.",
            RemoteError::NotFound(_) => "Not found. Check the name and try again.",
            RemoteError::Decode(_) => "Received an unexpected response. Please try again.",
            RemoteError::InvalidRequest(_) => "Invalid request. Check the name and try again.",
        }
    }
}

/// Database/storage errors (SQLite cache).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Data corruption detected: {0}")]
    Corruption(String),
}

impl DatabaseError {
    pub fn user_message(&self) -> &'static str {
        match self {
            DatabaseError::ConnectionFailed(_) => {
                "Unable to access local data. Try restarting the app."
            }
            DatabaseError::QueryFailed(_) => "A data operation failed. Please try again.",
            DatabaseError::Corruption(_) => {
                "Local data may be corrupted. Consider clearing the cache."
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Configuration parse error: {0}")]
    ParseError(String),
}

impl ConfigError {
    pub fn user_message(&self) -> &'static str {
        match self {
            ConfigError::Invalid(_) => "Invalid configuration. Check your settings.",
            ConfigError::ParseError(_) => "Configuration file is malformed. Check your settings.",
        }
    }
}

/// Error carried by a load stream when no cached fallback exists.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Cache(#[from] DatabaseError),
}

impl SyncError {
    pub fn user_message(&self) -> &'static str {
        match self {
            SyncError::Remote(e) => e.user_message(),
            SyncError::Cache(e) => e.user_message(),
        }
    }
}

/// Extension trait for converting reqwest errors to our error types.
pub trait ReqwestErrorExt {
    fn into_remote_error(self) -> RemoteError;
}

impl ReqwestErrorExt for reqwest::Error {
    fn into_remote_error(self) -> RemoteError {
        if self.is_decode() {
            RemoteError::Decode(self.to_string())
        } else if let Some(status) = self.status() {
            if status == reqwest::StatusCode::NOT_FOUND {
                RemoteError::NotFound(self.to_string())
            } else {
                RemoteError::Remote {
                    status: status.as_u16(),
                    message: self.to_string(),
                }
            }
        } else {
            // Timeouts, refused connections, resets and body read failures.
            RemoteError::Network(self.to_string())
        }
    }
}

/// Extension trait for converting rusqlite errors to our error types.
pub trait RusqliteErrorExt {
    fn into_database_error(self) -> DatabaseError;
}

impl RusqliteErrorExt for rusqlite::Error {
    fn into_database_error(self) -> DatabaseError {
        match &self {
            rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("corrupt") => {
                DatabaseError::Corruption(self.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::CannotOpen =>
            {
                DatabaseError::ConnectionFailed(self.to_string())
            }
            _ => DatabaseError::QueryFailed(self.to_string()),
        }
    }
}
