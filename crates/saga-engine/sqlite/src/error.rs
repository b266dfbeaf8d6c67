//! Errors from the SQLite adapters.

use saga_engine_core::error::{Error, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(#[from] sqlx::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value could not be read back.
    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl SqliteStoreError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidData(message.into())
    }
}

impl From<SqliteStoreError> for Error {
    fn from(err: SqliteStoreError) -> Self {
        let kind = match &err {
            SqliteStoreError::Backend(_) => ErrorKind::Persistence,
            SqliteStoreError::Serialization(_) | SqliteStoreError::InvalidData(_) => {
                ErrorKind::Codec
            }
        };
        Error::from_source(err.to_string(), kind, err)
    }
}
