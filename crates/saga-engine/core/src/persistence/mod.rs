//! # Saga Persistence
//!
//! Durable storage of saga instances. Two strategies exist:
//!
//! - [`EventSourcedPersistence`]: append-only event stream with checkpoint
//!   events and snapshots, built on the [`EventStore`] and [`SnapshotStore`]
//!   ports.
//! - A relational row store, provided by the `saga-engine-sqlite` crate.
//!
//! Persistence assumes a single writer per saga instance.
//!
//! [`EventStore`]: crate::port::EventStore
//! [`SnapshotStore`]: crate::port::SnapshotStore

pub mod event_sourced;

pub use event_sourced::EventSourcedPersistence;

use crate::error::Result;
use crate::event::SagaId;
use crate::saga::{SagaInstance, SagaStatus};
use async_trait::async_trait;

/// Storage for saga instances.
#[async_trait]
pub trait SagaPersistence: Send + Sync {
    /// Persist the current state of `instance`.
    async fn save(&self, instance: &SagaInstance) -> Result<()>;

    /// Rebuild an instance. Fails with `NotFound` for unknown ids and with
    /// `DefinitionNotFound` when its definition is not registered.
    async fn load(&self, saga_id: &SagaId) -> Result<SagaInstance>;

    async fn get_status(&self, saga_id: &SagaId) -> Result<SagaStatus>;
}
