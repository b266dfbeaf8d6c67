//! # Saga Orchestrator
//!
//! Entry point for running sagas: resolves definitions through the
//! [`SagaRegistry`], tracks running instances with a cancellation token
//! each, publishes the saga-level lifecycle events and recovers persisted
//! instances.
//!
//! ```ignore
//! let orchestrator = Arc::new(SagaOrchestrator::new(registry, persistence));
//! orchestrator.register_saga(order_saga);
//!
//! let handle = orchestrator.start_saga("order", SagaContext::new())?;
//! handle.wait().await?;
//! ```

use crate::context::SagaContext;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{SagaEventType, SagaId};
use crate::persistence::SagaPersistence;
use crate::port::EventBus;
use crate::saga::{SagaDefinition, SagaInstance, SagaRegistry, SagaRuntime, SagaStatus};
use crate::telemetry::saga_span;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Execute,
    Resume,
}

impl RunMode {
    fn as_str(&self) -> &'static str {
        match self {
            RunMode::Execute => "execute",
            RunMode::Resume => "resume",
        }
    }
}

/// One tracked run. The generation tells runs of the same saga apart.
#[derive(Debug, Clone)]
struct RunningSaga {
    generation: u64,
    token: CancellationToken,
}

/// Drives saga instances and keeps track of the running ones.
pub struct SagaOrchestrator {
    registry: Arc<SagaRegistry>,
    persistence: Arc<dyn SagaPersistence>,
    event_bus: Option<Arc<dyn EventBus>>,
    running: Mutex<HashMap<SagaId, RunningSaga>>,
    generations: AtomicU64,
}

impl std::fmt::Debug for SagaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaOrchestrator")
            .field("definitions", &self.registry.names())
            .field("running", &self.running_count())
            .field("event_bus", &self.event_bus.is_some())
            .finish()
    }
}

impl SagaOrchestrator {
    pub fn new(registry: Arc<SagaRegistry>, persistence: Arc<dyn SagaPersistence>) -> Self {
        Self {
            registry,
            persistence,
            event_bus: None,
            running: Mutex::new(HashMap::new()),
            generations: AtomicU64::new(0),
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn registry(&self) -> &Arc<SagaRegistry> {
        &self.registry
    }

    /// Register a definition under its own name.
    pub fn register_saga(&self, definition: SagaDefinition) -> Arc<SagaDefinition> {
        info!(saga = %definition.name(), steps = definition.len(), "Saga definition registered");
        self.registry.register(definition)
    }

    /// Build a `pending` instance of a registered definition.
    pub fn create_instance(&self, name: &str, context: SagaContext) -> Result<SagaInstance> {
        let definition = self
            .registry
            .get(name)
            .ok_or_else(|| Error::definition_not_found(name))?;
        Ok(SagaInstance::new(definition, context))
    }

    /// Create an instance and execute it on a background task.
    ///
    /// The instance is tracked as running before this returns, so it can be
    /// cancelled right away.
    pub fn start_saga(self: &Arc<Self>, name: &str, context: SagaContext) -> Result<SagaHandle> {
        let instance = Arc::new(self.create_instance(name, context)?);
        let run = self.track(instance.id())?;

        let orchestrator = Arc::clone(self);
        let task_instance = Arc::clone(&instance);
        let join = tokio::spawn(async move {
            orchestrator
                .run_tracked(&task_instance, run, RunMode::Execute)
                .await
        });

        info!(saga_id = %instance.id(), saga = %name, "Saga started in background");
        Ok(SagaHandle { instance, join })
    }

    /// Execute a `pending` instance to its end.
    pub async fn execute(&self, instance: &SagaInstance) -> Result<()> {
        let status = instance.status();
        if status != SagaStatus::Pending {
            return Err(Error::invalid_state(format!(
                "cannot execute saga {} in status {}",
                instance.id(),
                status
            ))
            .with_context("saga_id", instance.id().to_string()));
        }
        let run = self.track(instance.id())?;
        self.run_tracked(instance, run, RunMode::Execute).await
    }

    /// Compensate every committed step of an instance out of band.
    ///
    /// Refused while the instance is executing here; cancel it first.
    pub async fn compensate(&self, instance: &SagaInstance) -> Result<()> {
        if self.is_running(instance.id()) {
            return Err(Error::invalid_state(format!(
                "saga {} is running; cancel it before compensating",
                instance.id()
            ))
            .with_context("saga_id", instance.id().to_string()));
        }
        let rt = self.runtime(CancellationToken::new());
        let result = instance.compensate(&rt).await;
        match &result {
            Ok(()) => info!(saga_id = %instance.id(), "Manual compensation finished"),
            Err(e) => error!(saga_id = %instance.id(), error = %e, "Manual compensation failed"),
        }
        result
    }

    /// Load a persisted instance and run it again from its first step.
    pub async fn resume(&self, saga_id: &SagaId) -> Result<()> {
        let instance = self.persistence.load(saga_id).await?;
        let status = instance.status();
        if !matches!(status, SagaStatus::Pending | SagaStatus::Running) {
            return Err(Error::invalid_state(format!(
                "cannot resume saga {} in status {}",
                saga_id, status
            ))
            .with_context("saga_id", saga_id.to_string()));
        }
        let run = self.track(saga_id)?;
        self.run_tracked(&instance, run, RunMode::Resume).await
    }

    pub async fn get_status(&self, saga_id: &SagaId) -> Result<SagaStatus> {
        self.persistence.get_status(saga_id).await
    }

    /// Stop a running saga. The in-flight step fails with a cancellation
    /// error and the instance compensates as usual.
    pub fn cancel(&self, saga_id: &SagaId) -> Result<()> {
        let run = self.running.lock().remove(saga_id).ok_or_else(|| {
            Error::invalid_state(format!("saga {} is not running", saga_id))
                .with_context("saga_id", saga_id.to_string())
        })?;
        run.token.cancel();
        info!(saga_id = %saga_id, "Saga cancelled");
        Ok(())
    }

    pub fn is_running(&self, saga_id: &SagaId) -> bool {
        self.running.lock().contains_key(saga_id)
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    fn track(&self, saga_id: &SagaId) -> Result<RunningSaga> {
        let mut running = self.running.lock();
        if running.contains_key(saga_id) {
            return Err(Error::invalid_state(format!("saga {} is already running", saga_id))
                .with_context("saga_id", saga_id.to_string()));
        }
        let run = RunningSaga {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            token: CancellationToken::new(),
        };
        running.insert(saga_id.clone(), run.clone());
        Ok(run)
    }

    fn runtime(&self, token: CancellationToken) -> SagaRuntime {
        let rt = SagaRuntime::new()
            .with_persistence(Arc::clone(&self.persistence))
            .with_cancellation(token);
        match &self.event_bus {
            Some(bus) => rt.with_event_bus(Arc::clone(bus)),
            None => rt,
        }
    }

    async fn run_tracked(
        &self,
        instance: &SagaInstance,
        run: RunningSaga,
        mode: RunMode,
    ) -> Result<()> {
        let _tracked = Tracked {
            running: &self.running,
            saga_id: instance.id(),
            generation: run.generation,
        };
        let span = saga_span(instance.definition().name(), instance.id(), mode.as_str());
        self.run(instance, run.token, mode).instrument(span).await
    }

    async fn run(
        &self,
        instance: &SagaInstance,
        token: CancellationToken,
        mode: RunMode,
    ) -> Result<()> {
        let rt = self.runtime(token);
        let started = Utc::now();

        if mode == RunMode::Execute {
            instance
                .publish(&rt, instance.event(SagaEventType::SagaStarted))
                .await?;
        }

        let result = match mode {
            RunMode::Execute => instance.execute(&rt).await,
            RunMode::Resume => instance.resume(&rt).await,
        };
        let duration = (Utc::now() - started).to_std().unwrap_or_default();

        let terminal = match &result {
            Ok(()) => instance
                .event(SagaEventType::SagaCompleted)
                .with_duration(duration),
            Err(e) => instance
                .event(SagaEventType::SagaFailed)
                .with_duration(duration)
                .with_error(e),
        };
        let published = instance.publish(&rt, terminal).await;

        let status = instance.status();
        if !status.is_terminal()
            && let Err(e) = self.persistence.save(instance).await
        {
            warn!(saga_id = %instance.id(), status = %status, error = %e, "Final state save failed");
        }

        match result {
            Ok(()) => {
                info!(
                    saga_id = %instance.id(),
                    saga = %instance.definition().name(),
                    duration_ms = duration.as_millis() as u64,
                    "Saga finished"
                );
                published
            }
            Err(e) => {
                if let Err(bus) = published {
                    warn!(saga_id = %instance.id(), error = %bus, "SagaFailed event not published");
                }
                error!(
                    saga_id = %instance.id(),
                    saga = %instance.definition().name(),
                    status = %status,
                    error = %e,
                    "Saga failed"
                );
                Err(e)
            }
        }
    }
}

/// Removes an instance from the running set when its run ends, unless a
/// newer run of the same saga has taken its place.
struct Tracked<'a> {
    running: &'a Mutex<HashMap<SagaId, RunningSaga>>,
    saga_id: &'a SagaId,
    generation: u64,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        let mut running = self.running.lock();
        if running
            .get(self.saga_id)
            .is_some_and(|run| run.generation == self.generation)
        {
            running.remove(self.saga_id);
        }
    }
}

/// A saga executing on a background task.
#[derive(Debug)]
pub struct SagaHandle {
    instance: Arc<SagaInstance>,
    join: JoinHandle<Result<()>>,
}

impl SagaHandle {
    pub fn id(&self) -> &SagaId {
        self.instance.id()
    }

    pub fn instance(&self) -> &Arc<SagaInstance> {
        &self.instance
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to end and return its outcome.
    pub async fn wait(self) -> Result<()> {
        self.join.await.map_err(|e| {
            Error::from_source(format!("saga task failed: {}", e), ErrorKind::Unknown, e)
                .with_context("saga_id", self.instance.id().to_string())
        })?
    }
}
