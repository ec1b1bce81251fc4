use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Creating the database directory failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No message, outbox entry or key matched the lookup.
    #[error("Record not found")]
    NotFound,

    #[error("Migration error: {0}")]
    Migration(String),

    /// A stored event or attachment column did not hold valid JSON.
    #[error("Corrupt JSON column: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
