//! In-memory implementation of SnapshotStore for testing.

use async_trait::async_trait;
use parking_lot::RwLock;
use saga_engine_core::event::SagaId;
use saga_engine_core::port::snapshot_store::{SnapshotStore, SnapshotStoreError};
use saga_engine_core::snapshot::Snapshot;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One snapshot per saga, replaced on every save.
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<SagaId, Snapshot>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored snapshot, without going through the port.
    pub fn snapshot(&self, saga_id: &SagaId) -> Option<Snapshot> {
        self.snapshots.read().get(saga_id).cloned()
    }

    /// Overwrite a stored snapshot, e.g. to corrupt or age it.
    pub fn put(&self, snapshot: Snapshot) {
        self.snapshots
            .write()
            .insert(snapshot.saga_id.clone(), snapshot);
    }

    pub fn remove(&self, saga_id: &SagaId) -> Option<Snapshot> {
        self.snapshots.write().remove(saga_id)
    }

    pub fn clear(&self) {
        self.snapshots.write().clear();
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.read().is_empty()
    }

    /// Successful `save_snapshot` calls.
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make every save fail until turned off again.
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    type Error = InMemorySnapshotStoreError;

    async fn get_snapshot(
        &self,
        saga_id: &SagaId,
    ) -> Result<Option<Snapshot>, SnapshotStoreError<Self::Error>> {
        Ok(self.snapshots.read().get(saga_id).cloned())
    }

    async fn save_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), SnapshotStoreError<Self::Error>> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(InMemorySnapshotStoreError::Unavailable.into());
        }
        self.snapshots
            .write()
            .insert(snapshot.saga_id.clone(), snapshot.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Error type for InMemorySnapshotStore operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemorySnapshotStoreError {
    #[error("Snapshot store unavailable")]
    Unavailable,
}
