//! # saga-engine-testing
//!
//! Testing utilities for saga-engine with in-memory implementations of every
//! port: [`InMemoryEventStore`] (with read instrumentation),
//! [`InMemorySnapshotStore`], [`InMemoryEventBus`], [`InMemoryCommandBus`],
//! plus step and participant doubles and the [`SagaHarness`].

pub mod fixtures;
pub mod memory_command_bus;
pub mod memory_event_bus;
pub mod memory_event_store;
pub mod memory_snapshot_store;

pub use fixtures::{MemoryPersistence, RecordingStep, SagaHarness, StepLog, TestParticipant};
pub use memory_command_bus::InMemoryCommandBus;
pub use memory_event_bus::InMemoryEventBus;
pub use memory_event_store::{InMemoryEventStore, InMemoryEventStoreError};
pub use memory_snapshot_store::{InMemorySnapshotStore, InMemorySnapshotStoreError};
