//! Error types for the watermark store

use thiserror::Error;

/// Result type for watermark operations
pub type WatermarkResult<T> = Result<T, WatermarkError>;

/// Errors that can occur while reading or advancing watermarks
#[derive(Error, Debug)]
pub enum WatermarkError {
    /// Database operation failed (connection, query execution, etc.)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Topic validation failed (empty, too long)
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    /// Offsets are non-negative
    #[error("Invalid offset: {0}")]
    InvalidOffset(i64),

    /// Schema name is not a plain SQL identifier
    #[error("Invalid schema name: {0:?}")]
    InvalidSchema(String),
}

impl WatermarkError {
    /// Check if error is transient (the connection, not the request, is at fault)
    pub fn is_transient(&self) -> bool {
        match self {
            WatermarkError::Database(sqlx_err) => matches!(
                sqlx_err,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}
