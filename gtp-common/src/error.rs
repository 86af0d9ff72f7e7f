//! Common error types for GTP

use thiserror::Error;

/// Common result type for GTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across GTP modules
///
/// The four caller-facing kinds are `Validation`, `Conflict`, `NotFound`,
/// and the infrastructure kinds (`Database`, `Io`, `Config`, `Internal`).
/// An undefined computation (expected value outside the target series,
/// division by zero in percentage variance) is NOT an error: it is an
/// `Option::None` result and must never be conflated with zero.
#[derive(Error, Debug)]
pub enum Error {
    /// Structurally invalid input; rejected before any state change
    #[error("Validation error: {0}")]
    Validation(String),

    /// Violates a uniqueness or current-state invariant
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Requested link or data point does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map a sqlx error from an INSERT/UPDATE to `Conflict` when the
    /// underlying cause is a unique-index violation, passing everything
    /// else through as `Database`.
    ///
    /// The goal-level, strategy-level, and single-primary invariants are
    /// enforced by partial unique indexes, so the storage layer is the
    /// authority; this translates its verdict into the domain taxonomy.
    pub fn conflict_on_unique(e: sqlx::Error, msg: &str) -> Error {
        if let sqlx::Error::Database(ref db) = e {
            if db.is_unique_violation() {
                return Error::Conflict(msg.to_string());
            }
        }
        Error::Database(e)
    }
}
