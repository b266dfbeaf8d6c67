//! SnapshotStore port trait definition.

use crate::error::{Error, ErrorKind};
use crate::event::SagaId;
use crate::snapshot::Snapshot;

/// Errors returned by snapshot stores.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotStoreError<E> {
    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(E),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl<E> From<E> for SnapshotStoreError<E> {
    fn from(err: E) -> Self {
        SnapshotStoreError::Backend(err)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<SnapshotStoreError<E>> for Error {
    fn from(err: SnapshotStoreError<E>) -> Self {
        Error::from_source(err.to_string(), ErrorKind::Snapshot, err)
    }
}

/// Storage for the latest [`Snapshot`] of each saga stream.
///
/// Only the most recent snapshot matters; `save_snapshot` replaces it.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The error type for this implementation.
    type Error: std::error::Error + Send + Sync + 'static;

    async fn get_snapshot(
        &self,
        saga_id: &SagaId,
    ) -> Result<Option<Snapshot>, SnapshotStoreError<Self::Error>>;

    async fn save_snapshot(&self, snapshot: &Snapshot)
    -> Result<(), SnapshotStoreError<Self::Error>>;
}
