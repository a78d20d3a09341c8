//! Common error types for EODD

use thiserror::Error;

/// Common result type for EODD operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across EODD crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Guarded state transition lost (row no longer in the expected state)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error means the record store itself is unusable
    ///
    /// Connectivity and I/O failures of the store abort a whole run; every
    /// other variant is scoped to a single record or sensor.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_))
    }
}
