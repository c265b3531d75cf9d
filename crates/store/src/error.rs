use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A compare-and-swap write lost the race: the stored version moved on.
    #[error("Concurrency conflict for {key}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: Version,
        actual: Version,
    },

    /// An insert targeted a key that is already stored.
    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    /// A write targeted a key that is not stored.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// The backing store could not be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
