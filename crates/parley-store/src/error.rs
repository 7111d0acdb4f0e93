use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error from the persistent backend.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An update targeted a document that does not exist.
    #[error("Document not found: {0}")]
    NotFound(String),

    /// A create-only write found an existing document.
    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    /// The remote store cannot be reached.
    #[error("Remote store unavailable")]
    Unavailable,

    #[error("Batch too large: {size} operations (max {max})")]
    BatchTooLarge { size: usize, max: usize },

    #[error("Invalid document path: {0}")]
    InvalidPath(String),

    #[error("Invalid update: {0}")]
    InvalidUpdate(String),

    /// Stored document data is not a JSON object.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A live query could not be re-evaluated.
    #[error("Subscription error: {0}")]
    Subscription(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
