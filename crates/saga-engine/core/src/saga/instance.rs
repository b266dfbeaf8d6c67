//! # Saga Instance
//!
//! The runtime of one saga: drives the definition's steps in order, retries
//! failed attempts per policy, compensates committed steps in reverse on
//! failure, and persists after every transition.
//!
//! Mutable fields live behind a single reader/writer lock. The lock is never
//! held across an await point.

use super::{HistoryEntry, SagaDefinition, SagaState, SagaStatus, StateMachine, StepStatus};
use crate::context::SagaContext;
use crate::error::{Error, ErrorKind, Result};
use crate::event::{SagaEvent, SagaEventType, SagaId};
use crate::persistence::SagaPersistence;
use crate::port::EventBus;
use crate::retry::RetryPolicy;
use crate::step::SagaStep;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators of one execution.
///
/// Without persistence or an event bus the instance runs purely in memory.
#[derive(Clone, Default)]
pub struct SagaRuntime {
    pub persistence: Option<Arc<dyn SagaPersistence>>,
    pub event_bus: Option<Arc<dyn EventBus>>,
    pub cancel: CancellationToken,
}

impl std::fmt::Debug for SagaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaRuntime")
            .field("persistence", &self.persistence.is_some())
            .field("event_bus", &self.event_bus.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl SagaRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn SagaPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[derive(Debug, Clone)]
struct InstanceState {
    status: SagaStatus,
    current_step: usize,
    fsm_state: String,
    history: Vec<HistoryEntry>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

enum StepOutcome {
    Completed,
    Failed(Error),
}

pub struct SagaInstance {
    id: SagaId,
    definition: Arc<SagaDefinition>,
    context: SagaContext,
    created_at: DateTime<Utc>,
    state: RwLock<InstanceState>,
}

impl std::fmt::Debug for SagaInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("SagaInstance")
            .field("id", &self.id)
            .field("definition", &self.definition.name())
            .field("status", &state.status)
            .field("current_step", &state.current_step)
            .field("history_len", &state.history.len())
            .finish()
    }
}

impl SagaInstance {
    pub fn new(definition: Arc<SagaDefinition>, context: SagaContext) -> Self {
        Self::with_id(SagaId::new(), definition, context)
    }

    pub fn with_id(id: SagaId, definition: Arc<SagaDefinition>, context: SagaContext) -> Self {
        Self {
            id,
            definition,
            context,
            created_at: Utc::now(),
            state: RwLock::new(InstanceState {
                status: SagaStatus::Pending,
                current_step: 0,
                fsm_state: super::definition::INITIAL_STATE.to_string(),
                history: Vec::new(),
                started_at: None,
                completed_at: None,
            }),
        }
    }

    /// Rebuild from a persisted image.
    pub fn from_state(state: SagaState, definition: Arc<SagaDefinition>) -> Result<Self> {
        if state.definition_name != definition.name() {
            return Err(Error::validation(
                "definition_name",
                &format!(
                    "state references definition '{}', got '{}'",
                    state.definition_name,
                    definition.name()
                ),
            )
            .with_context("saga_id", state.id.to_string()));
        }
        let context = SagaContext::from_map(&state.context)
            .map_err(|e| e.with_context("saga_id", state.id.to_string()))?;

        Ok(Self {
            id: state.id,
            definition,
            context,
            created_at: state.created_at,
            state: RwLock::new(InstanceState {
                status: state.status,
                current_step: state.current_step,
                fsm_state: super::definition::INITIAL_STATE.to_string(),
                history: state.history,
                started_at: state.started_at,
                completed_at: state.completed_at,
            }),
        })
    }

    pub fn to_state(&self) -> SagaState {
        let state = self.state.read();
        SagaState {
            id: self.id.clone(),
            definition_name: self.definition.name().to_string(),
            status: state.status,
            current_step: state.current_step,
            context: self.context.to_map(),
            history: state.history.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
        }
    }

    pub fn id(&self) -> &SagaId {
        &self.id
    }

    pub fn definition(&self) -> &Arc<SagaDefinition> {
        &self.definition
    }

    pub fn context(&self) -> &SagaContext {
        &self.context
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> SagaStatus {
        self.state.read().status
    }

    pub fn current_step(&self) -> usize {
        self.state.read().current_step
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.state.read().history.clone()
    }

    pub fn history_len(&self) -> usize {
        self.state.read().history.len()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().completed_at
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run every step from a `pending` instance.
    pub async fn execute(&self, rt: &SagaRuntime) -> Result<()> {
        {
            let mut state = self.state.write();
            if state.status != SagaStatus::Pending {
                return Err(self.invalid_status("execute", state.status));
            }
            self.apply_transition(&mut state, SagaStatus::Running)?;
            state.started_at = Some(Utc::now());
        }
        info!(
            saga_id = %self.id,
            saga = %self.definition.name(),
            steps = self.definition.len(),
            "Saga execution started"
        );
        self.persist(rt).await?;
        self.run_steps(rt).await
    }

    /// Continue a `pending` or `running` instance.
    ///
    /// The whole step sequence runs again from the first step, so steps must
    /// be idempotent.
    pub async fn resume(&self, rt: &SagaRuntime) -> Result<()> {
        match self.status() {
            SagaStatus::Pending => self.execute(rt).await,
            SagaStatus::Running => {
                info!(saga_id = %self.id, "Resuming saga from the first step");
                self.run_steps(rt).await
            }
            other => Err(self.invalid_status("resume", other)),
        }
    }

    /// Compensate every committed step, out of band.
    ///
    /// Legal from `running` or `completed`.
    pub async fn compensate(&self, rt: &SagaRuntime) -> Result<()> {
        let status = self.status();
        if !matches!(status, SagaStatus::Running | SagaStatus::Completed) {
            return Err(self.invalid_status("compensate", status));
        }
        info!(saga_id = %self.id, from = %status, "Manual compensation requested");
        self.begin_compensation(rt, None).await?;
        self.compensate_steps(self.definition.len().saturating_sub(1), rt, false)
            .await
    }

    async fn run_steps(&self, rt: &SagaRuntime) -> Result<()> {
        {
            let mut state = self.state.write();
            state.fsm_state = self.definition.state_machine().initial_state().to_string();
            state.current_step = 0;
        }

        let deadline = self
            .context
            .timeout()
            .and_then(|budget| Instant::now().checked_add(budget));

        for (index, step) in self.definition.steps().iter().enumerate() {
            match self.run_step(index, step.as_ref(), rt, deadline).await? {
                StepOutcome::Completed => {}
                StepOutcome::Failed(cause) => {
                    return self.fail_and_compensate(index, step.name(), cause, rt).await;
                }
            }
        }

        {
            let mut state = self.state.write();
            self.apply_transition(&mut state, SagaStatus::Completed)?;
        }
        self.persist(rt).await?;
        info!(saga_id = %self.id, saga = %self.definition.name(), "Saga completed");
        Ok(())
    }

    /// Outer error: the saga cannot continue (persistence, bus, FSM).
    /// `StepOutcome::Failed`: the step failed and compensation is due.
    async fn run_step(
        &self,
        index: usize,
        step: &dyn SagaStep,
        rt: &SagaRuntime,
        deadline: Option<Instant>,
    ) -> Result<StepOutcome> {
        let name = step.name();
        let started_at = Utc::now();
        {
            let mut state = self.state.write();
            let next = self
                .definition
                .state_machine()
                .fire(&state.fsm_state, &StateMachine::event_for(name))
                .map_err(|e| e.with_context("saga_id", self.id.to_string()))?
                .to_string();
            state.fsm_state = next;
            state.current_step = index;
            state
                .history
                .push(HistoryEntry::new(name, StepStatus::Running, started_at));
        }
        debug!(saga_id = %self.id, step = name, index, "Step started");
        self.persist(rt).await?;
        self.publish(rt, self.event(SagaEventType::StepStarted).with_step(name))
            .await?;

        let (result, retry_attempt) = if step.can_execute(&self.context).await {
            self.run_with_retries(step, rt, deadline).await
        } else {
            warn!(saga_id = %self.id, step = name, "Step guard rejected execution");
            (Err(Error::guard_rejected(name)), 0)
        };

        let finished_at = Utc::now();
        let error_text = result.as_ref().err().map(ToString::to_string);
        {
            let mut state = self.state.write();
            if let Some(entry) = state
                .history
                .iter_mut()
                .rev()
                .find(|e| e.step_name == name && e.started_at == started_at)
            {
                entry.status = if result.is_ok() {
                    StepStatus::Completed
                } else {
                    StepStatus::Failed
                };
                entry.completed_at = Some(finished_at);
                entry.error = error_text.clone();
                entry.retry_attempt = retry_attempt;
            }
        }
        self.persist(rt).await?;

        let duration = (finished_at - started_at).to_std().unwrap_or_default();
        match result {
            Ok(()) => {
                info!(
                    saga_id = %self.id,
                    step = name,
                    duration_ms = duration.as_millis() as u64,
                    retry_attempt,
                    "Step completed"
                );
                self.publish(
                    rt,
                    self.event(SagaEventType::StepCompleted)
                        .with_step(name)
                        .with_duration(duration)
                        .with_retry_attempt(retry_attempt),
                )
                .await?;
                Ok(StepOutcome::Completed)
            }
            Err(e) => {
                warn!(saga_id = %self.id, step = name, retry_attempt, error = %e, "Step failed");
                self.publish(
                    rt,
                    self.event(SagaEventType::StepFailed)
                        .with_step(name)
                        .with_duration(duration)
                        .with_error(&e)
                        .with_retry_attempt(retry_attempt),
                )
                .await?;
                Ok(StepOutcome::Failed(e))
            }
        }
    }

    /// Returns the final result and the index of the last attempt.
    async fn run_with_retries(
        &self,
        step: &dyn SagaStep,
        rt: &SagaRuntime,
        deadline: Option<Instant>,
    ) -> (Result<()>, u32) {
        let policy = self.policy_for(step);
        let mut attempt = 0u32;

        loop {
            let error = match self.run_attempt(step, rt, deadline).await {
                Ok(()) => return (Ok(()), attempt),
                Err(e) => e,
            };

            let budget_left = deadline.is_none_or(|d| Instant::now() < d);
            if rt.cancel.is_cancelled() || !budget_left || !policy.should_retry(&error, attempt) {
                return (Err(error), attempt);
            }

            let delay = policy.calculate_delay(attempt);
            warn!(
                saga_id = %self.id,
                step = step.name(),
                attempt = attempt + 1,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Step attempt failed, retrying"
            );

            tokio::select! {
                biased;
                _ = rt.cancel.cancelled() => {
                    return (Err(self.cancelled_in(step.name())), attempt);
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn run_attempt(
        &self,
        step: &dyn SagaStep,
        rt: &SagaRuntime,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let step_limit = step.timeout().or(self.definition.default_step_timeout());
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if remaining == Some(Duration::ZERO) {
            return Err(Error::timeout(format!(
                "saga {} exceeded its timeout before step '{}'",
                self.id,
                step.name()
            ))
            .with_context("step", step.name()));
        }
        let limit = match (step_limit, remaining) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        // Released when the attempt ends, whatever the outcome.
        let token = rt.cancel.child_token();
        let _release = token.clone().drop_guard();

        let execution = async {
            let fut = step.execute(&self.context, &token);
            match limit {
                Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                    Err(Error::timeout(format!(
                        "step '{}' timed out after {:?}",
                        step.name(),
                        limit
                    ))
                    .with_context("step", step.name()))
                }),
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = rt.cancel.cancelled() => Err(self.cancelled_in(step.name())),
            result = execution => result,
        }
    }

    /// Step policy, then context metadata, then definition, then one attempt.
    fn policy_for(&self, step: &dyn SagaStep) -> RetryPolicy {
        step.retry_policy()
            .cloned()
            .or_else(|| self.context.retry_policy())
            .or_else(|| self.definition.retry_policy().cloned())
            .unwrap_or_else(RetryPolicy::no_retry)
    }

    // ------------------------------------------------------------------
    // Compensation
    // ------------------------------------------------------------------

    async fn fail_and_compensate(
        &self,
        index: usize,
        step_name: &str,
        cause: Error,
        rt: &SagaRuntime,
    ) -> Result<()> {
        let step_error = Error::from_source(
            format!("step '{}' failed: {}", step_name, cause),
            cause.kind(),
            cause,
        )
        .with_context("saga_id", self.id.to_string())
        .with_context("step", step_name);

        self.begin_compensation(rt, Some(&step_error)).await?;

        // The step could not undo its own partial work.
        let effects_left = step_error.is(ErrorKind::Compensation);
        match self.compensate_steps(index, rt, effects_left).await {
            Ok(()) => Err(step_error),
            Err(comp) if comp.is(ErrorKind::Compensation) => Err(Error::from_source(
                format!("{}; {}", step_error, comp),
                ErrorKind::Compensation,
                comp,
            )
            .with_context("saga_id", self.id.to_string())
            .with_context("step", step_name)),
            Err(other) => Err(other),
        }
    }

    async fn begin_compensation(&self, rt: &SagaRuntime, cause: Option<&Error>) -> Result<()> {
        {
            let mut state = self.state.write();
            self.apply_transition(&mut state, SagaStatus::Compensating)?;
        }
        self.persist(rt).await?;
        let mut event = self.event(SagaEventType::SagaCompensating);
        if let Some(cause) = cause {
            event = event.with_error(cause);
        }
        self.publish(rt, event).await
    }

    /// Walk steps `upto..=0`, compensating each committed step once.
    ///
    /// The first compensation failure ends the pass with status `failed`.
    /// With `effects_left`, a clean pass still ends `failed`.
    async fn compensate_steps(
        &self,
        upto: usize,
        rt: &SagaRuntime,
        effects_left: bool,
    ) -> Result<()> {
        let steps = self.definition.steps();
        let upto = upto.min(steps.len().saturating_sub(1));

        for index in (0..=upto).rev() {
            let step = &steps[index];
            let name = step.name();
            if !self.needs_compensation(name) {
                continue;
            }

            let started_at = Utc::now();
            self.state.write().history.push(HistoryEntry::new(
                name,
                StepStatus::Compensating,
                started_at,
            ));
            info!(saga_id = %self.id, step = name, "Compensating step");
            self.publish(rt, self.event(SagaEventType::StepCompensating).with_step(name))
                .await?;

            let result = step.compensate(&self.context).await;
            let finished_at = strictly_after(started_at);
            let duration = (finished_at - started_at).to_std().unwrap_or_default();

            match result {
                Ok(()) => {
                    self.state
                        .write()
                        .history
                        .push(finished_entry(name, StepStatus::Compensated, finished_at, None));
                    self.persist(rt).await?;
                    self.publish(
                        rt,
                        self.event(SagaEventType::StepCompensated)
                            .with_step(name)
                            .with_duration(duration),
                    )
                    .await?;
                }
                Err(e) => {
                    error!(saga_id = %self.id, step = name, error = %e, "Compensation failed");
                    {
                        let mut state = self.state.write();
                        state.history.push(finished_entry(
                            name,
                            StepStatus::Failed,
                            finished_at,
                            Some(e.to_string()),
                        ));
                        self.apply_transition(&mut state, SagaStatus::Failed)?;
                    }
                    self.persist(rt).await?;
                    self.publish(
                        rt,
                        self.event(SagaEventType::StepFailed)
                            .with_step(name)
                            .with_duration(duration)
                            .with_error(&e),
                    )
                    .await?;
                    return Err(Error::from_source(
                        format!("compensation of step '{}' failed: {}", name, e),
                        ErrorKind::Compensation,
                        e,
                    )
                    .with_context("saga_id", self.id.to_string())
                    .with_context("step", name));
                }
            }
        }

        if effects_left {
            {
                let mut state = self.state.write();
                self.apply_transition(&mut state, SagaStatus::Failed)?;
            }
            self.persist(rt).await?;
            error!(saga_id = %self.id, "Saga failed with step effects left in place");
            return Ok(());
        }

        {
            let mut state = self.state.write();
            self.apply_transition(&mut state, SagaStatus::Compensated)?;
        }
        self.persist(rt).await?;
        info!(saga_id = %self.id, "Saga compensated");
        self.publish(rt, self.event(SagaEventType::SagaCompensated))
            .await
    }

    /// Committed and not yet compensated.
    fn needs_compensation(&self, step_name: &str) -> bool {
        let state = self.state.read();
        let mut completed = false;
        for entry in state.history.iter().filter(|e| e.step_name == step_name) {
            match entry.status {
                StepStatus::Compensated => return false,
                StepStatus::Completed => completed = true,
                _ => {}
            }
        }
        completed
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn apply_transition(&self, state: &mut InstanceState, next: SagaStatus) -> Result<()> {
        if !state.status.can_transition_to(next) {
            return Err(Error::invalid_state(format!(
                "invalid saga transition {} -> {}",
                state.status, next
            ))
            .with_context("saga_id", self.id.to_string()));
        }
        debug!(saga_id = %self.id, from = %state.status, to = %next, "Saga status transition");
        state.status = next;
        state.completed_at = next.is_terminal().then(Utc::now);
        Ok(())
    }

    fn invalid_status(&self, operation: &str, status: SagaStatus) -> Error {
        Error::invalid_state(format!(
            "cannot {} saga {} in status '{}'",
            operation, self.id, status
        ))
        .with_context("saga_id", self.id.to_string())
        .with_context("status", status.as_str())
    }

    fn cancelled_in(&self, step_name: &str) -> Error {
        Error::cancelled(format!(
            "saga {} cancelled during step '{}'",
            self.id, step_name
        ))
        .with_context("saga_id", self.id.to_string())
        .with_context("step", step_name)
    }

    pub(crate) fn event(&self, event_type: SagaEventType) -> SagaEvent {
        SagaEvent::new(
            event_type,
            self.id.clone(),
            self.context.correlation_id(),
            self.definition.name(),
        )
    }

    async fn persist(&self, rt: &SagaRuntime) -> Result<()> {
        match &rt.persistence {
            Some(persistence) => persistence
                .save(self)
                .await
                .map_err(|e| e.with_context("saga_id", self.id.to_string())),
            None => Ok(()),
        }
    }

    pub(crate) async fn publish(&self, rt: &SagaRuntime, event: SagaEvent) -> Result<()> {
        match &rt.event_bus {
            Some(bus) => bus.publish(event).await.map_err(|e| {
                Error::from(e).with_context("saga_id", self.id.to_string())
            }),
            None => Ok(()),
        }
    }
}

fn finished_entry(
    step_name: &str,
    status: StepStatus,
    at: DateTime<Utc>,
    error: Option<String>,
) -> HistoryEntry {
    let mut entry = HistoryEntry::new(step_name, status, at);
    entry.completed_at = Some(at);
    entry.error = error;
    entry
}

// History entries are keyed by (step, started_at); keep outcome keys distinct.
fn strictly_after(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + chrono::Duration::microseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::SequentialStep;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    type Log = Arc<Mutex<Vec<String>>>;

    fn recording_step(name: &str, fail: bool, log: Log) -> SequentialStep {
        let exec_log = log.clone();
        let exec_name = name.to_string();
        let comp_name = name.to_string();
        SequentialStep::builder(name)
            .execute(move |ctx| {
                let log = exec_log.clone();
                let name = exec_name.clone();
                async move {
                    log.lock().push(format!("exec:{}", name));
                    if fail {
                        return Err(Error::step_execution(format!("{} failed", name)));
                    }
                    ctx.set(format!("{}_done", name), true);
                    Ok(())
                }
            })
            .compensate(move |ctx| {
                let log = log.clone();
                let name = comp_name.clone();
                async move {
                    log.lock().push(format!("comp:{}", name));
                    ctx.remove(&format!("{}_done", name));
                    Ok(())
                }
            })
            .build()
            .unwrap()
    }

    fn instance(steps: Vec<SequentialStep>) -> SagaInstance {
        let mut builder = SagaDefinition::builder("test_saga");
        for step in steps {
            builder = builder.step(step);
        }
        SagaInstance::new(Arc::new(builder.build().unwrap()), SagaContext::new())
    }

    #[tokio::test]
    async fn test_all_steps_succeed() {
        let log = Log::default();
        let saga = instance(vec![
            recording_step("a", false, log.clone()),
            recording_step("b", false, log.clone()),
            recording_step("c", false, log.clone()),
        ]);

        saga.execute(&SagaRuntime::new()).await.unwrap();

        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.current_step(), 2);
        let history = saga.history();
        assert_eq!(history.len(), 3);
        for entry in &history {
            assert_eq!(entry.status, StepStatus::Completed);
            assert!(entry.completed_at.unwrap() >= entry.started_at);
        }
        assert!(saga.completed_at().is_some());
    }

    #[tokio::test]
    async fn test_failure_compensates_in_reverse() {
        let log = Log::default();
        let saga = instance(vec![
            recording_step("a", false, log.clone()),
            recording_step("b", false, log.clone()),
            recording_step("c", true, log.clone()),
        ]);

        let err = saga.execute(&SagaRuntime::new()).await.unwrap_err();

        assert!(err.to_string().contains("step 'c' failed"));
        assert_eq!(err.get_context("step"), Some("c"));
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(
            *log.lock(),
            vec!["exec:a", "exec:b", "exec:c", "comp:b", "comp:a"]
        );
        assert!(!saga.context().contains("a_done"));
        assert!(!saga.context().contains("b_done"));
    }

    #[tokio::test]
    async fn test_compensation_failure_stops_the_pass() {
        let log = Log::default();
        let broken = SequentialStep::builder("b")
            .execute(|_| async { Ok(()) })
            .compensate(|_| async { Err(Error::compensation("refund service down")) })
            .build()
            .unwrap();
        let saga = instance(vec![
            recording_step("a", false, log.clone()),
            broken,
            recording_step("c", true, log.clone()),
        ]);

        let err = saga.execute(&SagaRuntime::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Compensation);
        assert!(err.to_string().contains("step 'c' failed"));
        assert!(err.to_string().contains("refund service down"));
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(!log.lock().contains(&"comp:a".to_string()));
    }

    #[tokio::test]
    async fn test_step_leaving_effects_fails_the_saga() {
        let log = Log::default();
        let partial = SequentialStep::builder("b")
            .execute(|_| async { Err(Error::compensation("rollback of child failed")) })
            .build()
            .unwrap();
        let saga = instance(vec![recording_step("a", false, log.clone()), partial]);

        let err = saga.execute(&SagaRuntime::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Compensation);
        assert_eq!(saga.status(), SagaStatus::Failed);
        assert!(log.lock().contains(&"comp:a".to_string()));
    }

    #[tokio::test]
    async fn test_guard_rejection_compensates() {
        let log = Log::default();
        let guarded = SequentialStep::builder("ship")
            .execute(|_| async { Ok(()) })
            .guard(|ctx| ctx.get_bool("paid").unwrap_or(false))
            .build()
            .unwrap();
        let saga = instance(vec![recording_step("a", false, log.clone()), guarded]);

        let err = saga.execute(&SagaRuntime::new()).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::GuardRejected);
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(*log.lock(), vec!["exec:a", "comp:a"]);
        let history = saga.history();
        let ship = history.iter().find(|e| e.step_name == "ship").unwrap();
        assert_eq!(ship.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let flaky = SequentialStep::builder("flaky")
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::step_execution("transient"))
                    } else {
                        Ok(())
                    }
                }
            })
            .retry_policy(RetryPolicy::new(3, Duration::from_millis(1), 1.0))
            .build()
            .unwrap();
        let saga = instance(vec![flaky]);

        saga.execute(&SagaRuntime::new()).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let history = saga.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, StepStatus::Completed);
        assert_eq!(history[0].retry_attempt, 2);
    }

    #[tokio::test]
    async fn test_no_policy_means_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let failing = SequentialStep::builder("once")
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::step_execution("nope"))
                }
            })
            .build()
            .unwrap();
        let saga = instance(vec![failing]);

        assert!(saga.execute(&SagaRuntime::new()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_retry_policy_applies() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let failing = SequentialStep::builder("always_fails")
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(Error::step_execution("nope"))
                }
            })
            .build()
            .unwrap();
        let saga = instance(vec![failing]);
        saga.context()
            .set_retry_policy(Some(RetryPolicy::new(4, Duration::from_millis(1), 1.0)));

        assert!(saga.execute(&SagaRuntime::new()).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_step_timeout_fails_the_step() {
        let slow = SequentialStep::builder("slow")
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let saga = instance(vec![slow]);

        let err = saga.execute(&SagaRuntime::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(saga.status(), SagaStatus::Compensated);
    }

    #[tokio::test]
    async fn test_cancellation_stops_in_flight_step() {
        let log = Log::default();
        let slow = SequentialStep::builder("slow")
            .execute(|_| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .build()
            .unwrap();
        let saga = instance(vec![recording_step("a", false, log.clone()), slow]);
        let rt = SagaRuntime::new();
        let cancel = rt.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel.cancel();
        });

        let err = saga.execute(&rt).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(*log.lock(), vec!["exec:a", "comp:a"]);
    }

    #[tokio::test]
    async fn test_execute_only_from_pending() {
        let saga = instance(vec![recording_step("a", false, Log::default())]);
        saga.execute(&SagaRuntime::new()).await.unwrap();

        let err = saga.execute(&SagaRuntime::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_manual_compensation_of_completed_saga() {
        let log = Log::default();
        let saga = instance(vec![
            recording_step("a", false, log.clone()),
            recording_step("b", false, log.clone()),
        ]);
        saga.execute(&SagaRuntime::new()).await.unwrap();

        saga.compensate(&SagaRuntime::new()).await.unwrap();

        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(*log.lock(), vec!["exec:a", "exec:b", "comp:b", "comp:a"]);
        let compensated = saga
            .history()
            .iter()
            .filter(|e| e.status == StepStatus::Compensated)
            .count();
        assert_eq!(compensated, 2);

        let err = saga.compensate(&SagaRuntime::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let saga = instance(vec![recording_step("a", false, Log::default())]);
        saga.context().set("order_id", "o-1");
        saga.execute(&SagaRuntime::new()).await.unwrap();

        let state = saga.to_state();
        let restored = SagaInstance::from_state(state.clone(), saga.definition().clone()).unwrap();

        assert_eq!(restored.to_state(), state);
        assert_eq!(restored.context().get_string("order_id").as_deref(), Some("o-1"));
    }
}
