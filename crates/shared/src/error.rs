//! Store error type shared by every persistence backend

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A row held a value that does not map onto a domain type
    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: &'static str, message: String },

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        StoreError::CorruptRow {
            table,
            message: message.into(),
        }
    }
}
