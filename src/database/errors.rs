use thiserror::Error;

/// Errors raised by [`super::BatchStore`] implementations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Corrupt {table} record {id}: {reason}")]
    CorruptRecord {
        table: &'static str,
        id: String,
        reason: String,
    },
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn corrupt(table: &'static str, id: impl ToString, reason: impl Into<String>) -> StoreError {
    StoreError::CorruptRecord {
        table,
        id: id.to_string(),
        reason: reason.into(),
    }
}
