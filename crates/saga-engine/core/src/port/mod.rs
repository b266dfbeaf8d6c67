//! Ports for saga engine infrastructure adapters.
//!
//! This module defines the trait abstractions (ports) the saga engine uses
//! to interact with infrastructure. Each port can have multiple
//! implementations (SQLite, in-memory, mock, etc.).

pub mod command_bus;
pub mod event_bus;
pub mod event_store;
pub mod snapshot_store;
pub mod two_phase_commit;

pub use command_bus::{Command, CommandBus, CommandBusError, CommandEnvelope};
pub use event_bus::{EventBus, EventBusError, EventHandler, SubscriptionId};
pub use event_store::{EventStore, EventStoreError};
pub use snapshot_store::{SnapshotStore, SnapshotStoreError};
pub use two_phase_commit::{Participant, TwoPhaseCommitCoordinator};
