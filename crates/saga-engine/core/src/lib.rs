//! # saga-engine-core
//!
//! Saga orchestration engine with zero infrastructure dependencies.
//!
//! A saga is a business transaction split into steps, each paired with a
//! compensating action. Steps run in order; when one fails for good, the
//! already committed steps are compensated in reverse order.
//!
//! ## Architecture
//!
//! This crate defines the engine and the ports (traits) it needs from
//! infrastructure. Adapters live in other crates: in-memory doubles in
//! `saga-engine-testing`, SQLite in `saga-engine-sqlite`.
//!
//! ## Modules
//!
//! - [`saga`]: [`SagaDefinition`], [`SagaInstance`], [`SagaRegistry`] and the status types
//! - [`step`]: [`SagaStep`] and its variants (sequential, parallel, conditional, 2PC, command)
//! - [`orchestrator`]: [`SagaOrchestrator`], running-set tracking and recovery
//! - [`persistence`]: [`SagaPersistence`] and the event-sourced strategy
//! - [`port`]: EventStore, SnapshotStore, EventBus, CommandBus, two-phase commit
//! - [`context`], [`retry`], [`snapshot`], [`codec`], [`config`], [`telemetry`], [`error`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use saga_engine_core::{SagaContext, SagaDefinition, SagaOrchestrator, SequentialStep};
//!
//! let saga = SagaDefinition::builder("order")
//!     .step(
//!         SequentialStep::builder("reserve_inventory")
//!             .execute(|ctx| async move { ctx.set("reserved", true); Ok(()) })
//!             .compensate(|ctx| async move { ctx.set("reserved", false); Ok(()) })
//!             .build()?,
//!     )
//!     .build()?;
//!
//! orchestrator.register_saga(saga);
//! orchestrator.start_saga("order", SagaContext::new())?.wait().await?;
//! ```

pub mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod orchestrator;
pub mod persistence;
pub mod port;
pub mod retry;
pub mod saga;
pub mod snapshot;
pub mod step;
pub mod telemetry;

pub use codec::{CodecError, JsonCodec, StateCodec};
pub use config::{EnvConfig, SagaEngineConfig, SqliteConfig};
pub use context::{ContextValue, SagaContext, SagaMetadata};
pub use error::{Error, ErrorKind, Result, StructuredError};
pub use event::{EventType, SagaEvent, SagaEventType, SagaId, StoredEvent};
pub use orchestrator::{SagaHandle, SagaOrchestrator};
pub use persistence::{EventSourcedPersistence, SagaPersistence};
pub use port::{
    Command, CommandBus, CommandBusError, CommandEnvelope, EventBus, EventBusError, EventHandler,
    EventStore, EventStoreError, Participant, SnapshotStore, SnapshotStoreError, SubscriptionId,
    TwoPhaseCommitCoordinator,
};
pub use retry::{RetryPolicy, RetryPolicyBuilder};
pub use saga::{
    HistoryEntry, SagaDefinition, SagaDefinitionBuilder, SagaInstance, SagaRegistry, SagaRuntime,
    SagaState, SagaStatus, StateMachine, StepStatus,
};
pub use snapshot::{Snapshot, SnapshotChecksum, SnapshotConfig};
pub use step::{
    CommandStep, ConditionalStep, LocalTwoPhaseCoordinator, ParallelStep, SagaStep,
    SequentialStep, StepConfig, TwoPhaseCommitStep,
};
pub use telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
