//! Error types for rdbcoord

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Store Errors ===
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    #[error("Store busy: {0}")]
    StoreBusy(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Coordination Errors ===
    #[error("Leadership held by {holder} (term {term})")]
    StateConflict { holder: String, term: i64 },

    #[error("Operation cancelled by shutdown")]
    Cancelled,

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Is this a transient store error worth retrying?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout(_) | Error::ConnectionFailed(_) | Error::StoreBusy(_)
        )
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Error::StoreBusy(e.to_string())
            }
            rusqlite::Error::SqliteFailure(err, _)
                if matches!(err.code, rusqlite::ErrorCode::CannotOpen) =>
            {
                Error::ConnectionFailed(e.to_string())
            }
            _ => Error::Sqlite(e),
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}
