//! # Saga Steps
//!
//! A [`SagaStep`] is the unit of work of a saga: a forward action, an
//! optional compensating action, a guard, and optional timeout and retry
//! policy overrides.
//!
//! Variants compose a shared [`StepConfig`] (name, timeout, retry policy,
//! guard) instead of inheriting from a base step:
//!
//! - [`SequentialStep`]: closures for execute/compensate
//! - [`ParallelStep`]: fan-out over child steps
//! - [`ConditionalStep`]: runs an inner step only when a predicate holds
//! - [`TwoPhaseCommitStep`]: delegates to a [`TwoPhaseCommitCoordinator`]
//! - [`CommandStep`]: dispatches commands through a [`CommandBus`]
//!
//! [`TwoPhaseCommitCoordinator`]: crate::port::TwoPhaseCommitCoordinator
//! [`CommandBus`]: crate::port::CommandBus

pub mod command;
pub mod conditional;
pub mod parallel;
pub mod two_phase;

pub use command::{CommandStep, CommandStepBuilder};
pub use conditional::ConditionalStep;
pub use parallel::ParallelStep;
pub use two_phase::{LocalTwoPhaseCoordinator, TwoPhaseCommitStep};

use crate::context::SagaContext;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Boxed async action over the saga context.
pub type StepAction = Arc<dyn Fn(SagaContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Synchronous predicate over the saga context.
pub type StepGuard = Arc<dyn Fn(&SagaContext) -> bool + Send + Sync>;

/// Unit of work in a saga.
///
/// `execute` must be idempotent: resume re-runs every step of a saga.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Unique name within a definition.
    fn name(&self) -> &str;

    /// Forward action. `cancel` fires when the saga is cancelled or the
    /// attempt deadline expires.
    async fn execute(&self, ctx: &SagaContext, cancel: &CancellationToken) -> Result<()>;

    /// Rollback action. No-op by default.
    async fn compensate(&self, _ctx: &SagaContext) -> Result<()> {
        Ok(())
    }

    /// Guard evaluated before execution. `false` fails the saga without
    /// running the step.
    async fn can_execute(&self, _ctx: &SagaContext) -> bool {
        true
    }

    fn timeout(&self) -> Option<Duration> {
        None
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        None
    }
}

/// Configuration shared by every step variant.
#[derive(Clone)]
pub struct StepConfig {
    pub name: String,
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    pub guard: Option<StepGuard>,
}

impl std::fmt::Debug for StepConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepConfig")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .field("retry_policy", &self.retry_policy)
            .field("guard", &self.guard.is_some())
            .finish()
    }
}

impl StepConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timeout: None,
            retry_policy: None,
            guard: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_guard<G>(mut self, guard: G) -> Self
    where
        G: Fn(&SagaContext) -> bool + Send + Sync + 'static,
    {
        self.guard = Some(Arc::new(guard));
        self
    }

    /// Evaluate the guard; no guard means allowed.
    pub fn allows(&self, ctx: &SagaContext) -> bool {
        self.guard.as_ref().is_none_or(|guard| guard(ctx))
    }
}

/// Wrap an async closure into a [`StepAction`].
pub fn action<F, Fut>(f: F) -> StepAction
where
    F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |ctx| -> BoxFuture<'static, Result<()>> { Box::pin(f(ctx)) })
}

// ============================================================================
// SequentialStep
// ============================================================================

/// Plain step backed by closures.
#[derive(Clone)]
pub struct SequentialStep {
    config: StepConfig,
    execute: StepAction,
    compensate: Option<StepAction>,
}

impl std::fmt::Debug for SequentialStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialStep")
            .field("config", &self.config)
            .field("has_compensation", &self.compensate.is_some())
            .finish()
    }
}

impl SequentialStep {
    pub fn builder(name: impl Into<String>) -> SequentialStepBuilder {
        SequentialStepBuilder {
            config: StepConfig::new(name),
            execute: None,
            compensate: None,
        }
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    pub fn has_compensation(&self) -> bool {
        self.compensate.is_some()
    }
}

#[async_trait]
impl SagaStep for SequentialStep {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn execute(&self, ctx: &SagaContext, _cancel: &CancellationToken) -> Result<()> {
        (self.execute)(ctx.clone()).await
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<()> {
        match &self.compensate {
            Some(compensate) => compensate(ctx.clone()).await,
            None => Ok(()),
        }
    }

    async fn can_execute(&self, ctx: &SagaContext) -> bool {
        self.config.allows(ctx)
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.config.retry_policy.as_ref()
    }
}

/// Builder for [`SequentialStep`].
pub struct SequentialStepBuilder {
    config: StepConfig,
    execute: Option<StepAction>,
    compensate: Option<StepAction>,
}

impl SequentialStepBuilder {
    pub fn execute<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.execute = Some(action(f));
        self
    }

    pub fn compensate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(SagaContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.compensate = Some(action(f));
        self
    }

    pub fn guard<G>(mut self, guard: G) -> Self
    where
        G: Fn(&SagaContext) -> bool + Send + Sync + 'static,
    {
        self.config = self.config.with_guard(guard);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<SequentialStep> {
        if self.config.name.trim().is_empty() {
            return Err(Error::validation("name", "step name must not be empty"));
        }
        let execute = self.execute.ok_or_else(|| {
            Error::validation("execute", "step requires an execute action")
                .with_context("step", self.config.name.clone())
        })?;
        Ok(SequentialStep {
            config: self.config,
            execute,
            compensate: self.compensate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_sequential_step_runs_closures() {
        let step = SequentialStep::builder("reserve")
            .execute(|ctx| async move {
                ctx.set("reserved", true);
                Ok(())
            })
            .compensate(|ctx| async move {
                ctx.set("reserved", false);
                Ok(())
            })
            .build()
            .unwrap();

        let ctx = SagaContext::new();
        let token = CancellationToken::new();

        step.execute(&ctx, &token).await.unwrap();
        assert_eq!(ctx.get_bool("reserved"), Some(true));

        step.compensate(&ctx).await.unwrap();
        assert_eq!(ctx.get_bool("reserved"), Some(false));
        assert!(step.has_compensation());
    }

    #[tokio::test]
    async fn test_missing_compensation_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let step = SequentialStep::builder("notify")
            .execute(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .build()
            .unwrap();

        assert!(step.compensate(&SagaContext::new()).await.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_guard_and_overrides() {
        let step = SequentialStep::builder("ship")
            .execute(|_| async { Ok(()) })
            .guard(|ctx| ctx.get_bool("paid").unwrap_or(false))
            .timeout(Duration::from_secs(2))
            .retry_policy(RetryPolicy::new(5, Duration::from_millis(1), 1.0))
            .build()
            .unwrap();

        let ctx = SagaContext::new();
        assert!(!step.can_execute(&ctx).await);
        ctx.set("paid", true);
        assert!(step.can_execute(&ctx).await);

        assert_eq!(step.timeout(), Some(Duration::from_secs(2)));
        assert_eq!(step.retry_policy().map(|p| p.max_attempts), Some(5));
    }

    #[test]
    fn test_builder_validation() {
        assert!(SequentialStep::builder("").execute(|_| async { Ok(()) }).build().is_err());
        assert!(SequentialStep::builder("no_action").build().is_err());
    }
}
