//! Conditional step: runs an inner step only when a predicate holds.
//!
//! A false predicate is a skip, not a failure. The skip is recorded in the
//! context so that compensation of a skipped step is a no-op.

use super::{SagaStep, StepConfig, StepGuard};
use crate::context::SagaContext;
use crate::error::Result;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub struct ConditionalStep {
    config: StepConfig,
    condition: StepGuard,
    inner: Arc<dyn SagaStep>,
}

impl std::fmt::Debug for ConditionalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalStep")
            .field("config", &self.config)
            .field("inner", &self.inner.name())
            .finish()
    }
}

impl ConditionalStep {
    /// The step takes its name from `inner`.
    pub fn new<C>(inner: Arc<dyn SagaStep>, condition: C) -> Self
    where
        C: Fn(&SagaContext) -> bool + Send + Sync + 'static,
    {
        let mut config = StepConfig::new(inner.name());
        config.timeout = inner.timeout();
        config.retry_policy = inner.retry_policy().cloned();
        Self {
            config,
            condition: Arc::new(condition),
            inner,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    pub fn inner(&self) -> &Arc<dyn SagaStep> {
        &self.inner
    }

    pub fn skipped_key(&self) -> String {
        format!("_conditional:{}:skipped", self.config.name)
    }

    pub fn was_skipped(&self, ctx: &SagaContext) -> bool {
        ctx.get_bool(&self.skipped_key()).unwrap_or(false)
    }
}

#[async_trait]
impl SagaStep for ConditionalStep {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn execute(&self, ctx: &SagaContext, cancel: &CancellationToken) -> Result<()> {
        if !(self.condition)(ctx) {
            tracing::info!(step = %self.config.name, "Condition not met, skipping step");
            ctx.set(self.skipped_key(), true);
            return Ok(());
        }
        ctx.set(self.skipped_key(), false);
        self.inner.execute(ctx, cancel).await
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<()> {
        if self.was_skipped(ctx) {
            return Ok(());
        }
        self.inner.compensate(ctx).await
    }

    async fn can_execute(&self, ctx: &SagaContext) -> bool {
        self.inner.can_execute(ctx).await
    }

    fn timeout(&self) -> Option<Duration> {
        self.config.timeout
    }

    fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.config.retry_policy.as_ref()
    }
}
