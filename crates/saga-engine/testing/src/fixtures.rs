//! # Saga test fixtures
//!
//! Recording steps, a two-phase participant double and [`SagaHarness`],
//! which wires an orchestrator to in-memory adapters.
//!
//! ```rust,ignore
//! let log = StepLog::new();
//! let harness = SagaHarness::new();
//! harness.register(
//!     SagaDefinition::builder("order")
//!         .step(RecordingStep::new("reserve_inventory", &log))
//!         .step(RecordingStep::new("charge_payment", &log).failing())
//!         .build()?,
//! );
//!
//! let saga = harness.orchestrator.create_instance("order", SagaContext::new())?;
//! assert!(harness.orchestrator.execute(&saga).await.is_err());
//! assert_eq!(log.entries(), vec![
//!     "execute:reserve_inventory",
//!     "execute:charge_payment",
//!     "compensate:reserve_inventory",
//! ]);
//! ```

use crate::{InMemoryEventBus, InMemoryEventStore, InMemorySnapshotStore};
use async_trait::async_trait;
use parking_lot::Mutex;
use saga_engine_core::context::SagaContext;
use saga_engine_core::error::{Error, Result};
use saga_engine_core::persistence::EventSourcedPersistence;
use saga_engine_core::port::Participant;
use saga_engine_core::retry::RetryPolicy;
use saga_engine_core::saga::{SagaDefinition, SagaRegistry};
use saga_engine_core::snapshot::SnapshotConfig;
use saga_engine_core::step::SagaStep;
use saga_engine_core::{SagaOrchestrator, SagaPersistence};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared, ordered record of step calls: `"execute:<name>"`,
/// `"compensate:<name>"`.
#[derive(Debug, Clone, Default)]
pub struct StepLog(Arc<Mutex<Vec<String>>>);

impl StepLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, action: &str, step: &str) {
        self.0.lock().push(format!("{}:{}", action, step));
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, action: &str, step: &str) -> usize {
        let entry = format!("{}:{}", action, step);
        self.0.lock().iter().filter(|e| **e == entry).count()
    }

    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

/// Step that records its calls and writes `<name> = true` to the context on
/// execute, `false` on compensate.
#[derive(Debug)]
pub struct RecordingStep {
    name: String,
    log: StepLog,
    failures: usize,
    fail_compensation: bool,
    delay: Option<Duration>,
    timeout: Option<Duration>,
    retry_policy: Option<RetryPolicy>,
    attempts: AtomicUsize,
}

impl RecordingStep {
    pub fn new(name: impl Into<String>, log: &StepLog) -> Self {
        Self {
            name: name.into(),
            log: log.clone(),
            failures: 0,
            fail_compensation: false,
            delay: None,
            timeout: None,
            retry_policy: None,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fail every attempt.
    pub fn failing(self) -> Self {
        self.failing_times(usize::MAX)
    }

    /// Fail the first `n` attempts, then succeed.
    pub fn failing_times(mut self, n: usize) -> Self {
        self.failures = n;
        self
    }

    pub fn failing_compensation(mut self) -> Self {
        self.fail_compensation = true;
        self
    }

    /// Sleep before finishing; the sleep stops early on cancellation.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SagaStep for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &SagaContext, cancel: &CancellationToken) -> Result<()> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.log.record("execute", &self.name);

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Error::cancelled(format!("step '{}' cancelled", self.name)));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        if attempt < self.failures {
            return Err(Error::step_execution(format!(
                "step '{}' failed on attempt {}",
                self.name,
                attempt + 1
            )));
        }
        ctx.set(self.name.clone(), true);
        Ok(())
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<()> {
        self.log.record("compensate", &self.name);
        if self.fail_compensation {
            return Err(Error::compensation(format!(
                "compensation of '{}' failed",
                self.name
            )));
        }
        ctx.set(self.name.clone(), false);
        Ok(())
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }
}

/// Two-phase commit participant recording `prepare`/`commit`/`abort` calls.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    name: String,
    fail_prepare: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl TestParticipant {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_prepare: false,
            calls: Arc::default(),
        }
    }

    /// Vote "no" on prepare.
    pub fn rejecting(mut self) -> Self {
        self.fail_prepare = true;
        self
    }

    /// Share one call log between several participants.
    pub fn with_calls(mut self, calls: Arc<Mutex<Vec<String>>>) -> Self {
        self.calls = calls;
        self
    }

    /// Calls as `"<phase>:<participant>"`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn record(&self, phase: &str) {
        self.calls.lock().push(format!("{}:{}", phase, self.name));
    }
}

#[async_trait]
impl Participant for TestParticipant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn prepare(&self, _transaction_id: &str) -> Result<()> {
        self.record("prepare");
        if self.fail_prepare {
            return Err(Error::step_execution(format!(
                "participant '{}' voted no",
                self.name
            )));
        }
        Ok(())
    }

    async fn commit(&self, _transaction_id: &str) -> Result<()> {
        self.record("commit");
        Ok(())
    }

    async fn abort(&self, _transaction_id: &str) -> Result<()> {
        self.record("abort");
        Ok(())
    }
}

pub type MemoryPersistence = EventSourcedPersistence<InMemoryEventStore, InMemorySnapshotStore>;

/// Orchestrator over event-sourced persistence and in-memory adapters.
pub struct SagaHarness {
    pub registry: Arc<SagaRegistry>,
    pub events: Arc<InMemoryEventStore>,
    pub snapshots: Arc<InMemorySnapshotStore>,
    pub event_bus: Arc<InMemoryEventBus>,
    pub persistence: Arc<MemoryPersistence>,
    pub orchestrator: Arc<SagaOrchestrator>,
}

impl Default for SagaHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl SagaHarness {
    pub fn new() -> Self {
        Self::with_snapshot_config(SnapshotConfig::default())
    }

    pub fn with_snapshot_config(config: SnapshotConfig) -> Self {
        let registry = Arc::new(SagaRegistry::new());
        let events = Arc::new(InMemoryEventStore::new());
        let snapshots = Arc::new(InMemorySnapshotStore::new());
        let event_bus = Arc::new(InMemoryEventBus::new());
        let persistence = Arc::new(
            EventSourcedPersistence::new(events.clone(), snapshots.clone(), registry.clone())
                .with_config(config),
        );
        let dyn_persistence: Arc<dyn SagaPersistence> = persistence.clone();
        let orchestrator = Arc::new(
            SagaOrchestrator::new(registry.clone(), dyn_persistence)
                .with_event_bus(event_bus.clone()),
        );
        Self {
            registry,
            events,
            snapshots,
            event_bus,
            persistence,
            orchestrator,
        }
    }

    pub fn register(&self, definition: SagaDefinition) -> Arc<SagaDefinition> {
        self.orchestrator.register_saga(definition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_step_fails_then_succeeds() {
        let log = StepLog::new();
        let step = RecordingStep::new("charge", &log).failing_times(1);
        let ctx = SagaContext::new();
        let token = CancellationToken::new();

        assert!(step.execute(&ctx, &token).await.is_err());
        step.execute(&ctx, &token).await.unwrap();
        assert_eq!(step.attempts(), 2);
        assert_eq!(ctx.get_bool("charge"), Some(true));

        step.compensate(&ctx).await.unwrap();
        assert_eq!(ctx.get_bool("charge"), Some(false));
        assert_eq!(log.count("execute", "charge"), 2);
        assert_eq!(log.count("compensate", "charge"), 1);
    }

    #[tokio::test]
    async fn test_delay_stops_on_cancel() {
        let log = StepLog::new();
        let step = RecordingStep::new("slow", &log).with_delay(Duration::from_secs(30));
        let token = CancellationToken::new();
        token.cancel();

        let err = step.execute(&SagaContext::new(), &token).await.unwrap_err();
        assert_eq!(err.kind(), saga_engine_core::ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_participant_records_calls() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let ok = TestParticipant::new("db").with_calls(calls.clone());
        let no = TestParticipant::new("mq").rejecting().with_calls(calls.clone());

        ok.prepare("tx").await.unwrap();
        assert!(no.prepare("tx").await.is_err());
        ok.abort("tx").await.unwrap();

        assert_eq!(ok.calls(), vec!["prepare:db", "prepare:mq", "abort:db"]);
    }
}
