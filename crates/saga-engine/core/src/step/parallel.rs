//! Parallel fan-out step.
//!
//! Every child runs on its own task; results come back over a bounded
//! channel sized to the child count. All children run to completion even
//! when one fails, and the aggregate error names every failing child.
//! Each child is retried under its own retry policy; the parent's policy
//! retries the whole fan-out.
//!
//! When any child fails, the children that succeeded are compensated in
//! reverse order before the error is returned, so a failed parallel step
//! leaves nothing behind. A failing rollback stops there and is reported
//! as a compensation error.
//!
//! The names of children whose effects are in place are recorded in the
//! saga context under [`ParallelStep::succeeded_key`], so compensation only
//! targets them and survives a persist/load cycle.

use super::{SagaStep, StepConfig};
use crate::context::SagaContext;
use crate::error::{Error, ErrorKind, Result};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct ParallelStep {
    config: StepConfig,
    children: Vec<Arc<dyn SagaStep>>,
}

impl std::fmt::Debug for ParallelStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelStep")
            .field("config", &self.config)
            .field(
                "children",
                &self.children.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl ParallelStep {
    pub fn new(name: impl Into<String>, children: Vec<Arc<dyn SagaStep>>) -> Result<Self> {
        Self::with_config(StepConfig::new(name), children)
    }

    pub fn with_config(config: StepConfig, children: Vec<Arc<dyn SagaStep>>) -> Result<Self> {
        if children.is_empty() {
            return Err(Error::validation(
                "children",
                "parallel step requires at least one child",
            )
            .with_context("step", config.name.clone()));
        }
        let mut seen = HashSet::new();
        for child in &children {
            if !seen.insert(child.name().to_string()) {
                return Err(Error::validation(
                    "children",
                    &format!("duplicate child step name '{}'", child.name()),
                )
                .with_context("step", config.name.clone()));
            }
        }
        Ok(Self { config, children })
    }

    pub fn children(&self) -> &[Arc<dyn SagaStep>] {
        &self.children
    }

    /// Context key holding the names of children that executed successfully.
    pub fn succeeded_key(&self) -> String {
        format!("_parallel:{}:succeeded", self.config.name)
    }
}

async fn run_child(
    child: &dyn SagaStep,
    ctx: &SagaContext,
    cancel: &CancellationToken,
) -> Result<()> {
    if !child.can_execute(ctx).await {
        return Err(Error::guard_rejected(child.name()));
    }
    let policy = child
        .retry_policy()
        .cloned()
        .unwrap_or_else(RetryPolicy::no_retry);
    let mut attempt = 0u32;

    loop {
        let error = match attempt_child(child, ctx, cancel).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if cancel.is_cancelled() || !policy.should_retry(&error, attempt) {
            return Err(error);
        }

        let delay = policy.calculate_delay(attempt);
        tracing::warn!(
            step = child.name(),
            attempt = attempt + 1,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Parallel child attempt failed, retrying"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(child_cancelled(child)),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

async fn attempt_child(
    child: &dyn SagaStep,
    ctx: &SagaContext,
    cancel: &CancellationToken,
) -> Result<()> {
    let fut = child.execute(ctx, cancel);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(child_cancelled(child)),
        result = async {
            match child.timeout() {
                Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                    Err(Error::timeout(format!(
                        "step '{}' timed out after {:?}",
                        child.name(),
                        limit
                    )))
                }),
                None => fut.await,
            }
        } => result,
    }
}

fn child_cancelled(child: &dyn SagaStep) -> Error {
    Error::cancelled(format!("step '{}' cancelled", child.name()))
}

impl ParallelStep {
    /// Undo the children in `succeeded`, last child first.
    ///
    /// Stops at the first failure and returns the children still in place
    /// along with the error.
    async fn roll_back(
        &self,
        ctx: &SagaContext,
        succeeded: &[String],
    ) -> std::result::Result<(), (Vec<String>, Error)> {
        let mut remaining: Vec<String> = succeeded.to_vec();
        for child in self.children.iter().rev() {
            if !remaining.iter().any(|name| name == child.name()) {
                continue;
            }
            if let Err(e) = child.compensate(ctx).await {
                tracing::error!(
                    step = %self.config.name,
                    child = child.name(),
                    error = %e,
                    "Rollback of parallel child failed"
                );
                return Err((remaining, e));
            }
            remaining.retain(|name| name != child.name());
        }
        Ok(())
    }
}

#[async_trait]
impl SagaStep for ParallelStep {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn execute(&self, ctx: &SagaContext, cancel: &CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<(usize, Result<()>)>(self.children.len());
        let children_token = cancel.child_token();

        for (index, child) in self.children.iter().enumerate() {
            let child = Arc::clone(child);
            let ctx = ctx.clone();
            let token = children_token.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = run_child(child.as_ref(), &ctx, &token).await;
                let _ = tx.send((index, result)).await;
            });
        }
        drop(tx);

        let mut outcomes: Vec<Option<Result<()>>> = self.children.iter().map(|_| None).collect();
        while let Some((index, result)) = rx.recv().await {
            outcomes[index] = Some(result);
        }
        // All senders are gone; children that never reported panicked.
        children_token.cancel();

        let mut succeeded = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = false;
        for (child, outcome) in self.children.iter().zip(outcomes) {
            match outcome {
                Some(Ok(())) => succeeded.push(child.name().to_string()),
                Some(Err(e)) => {
                    cancelled |= e.is(ErrorKind::Cancelled);
                    failures.push(format!("{}: {}", child.name(), e));
                }
                None => failures.push(format!("{}: task panicked", child.name())),
            }
        }

        if failures.is_empty() {
            ctx.set(self.succeeded_key(), succeeded);
            return Ok(());
        }

        tracing::warn!(
            step = %self.config.name,
            failed = failures.len(),
            rolled_back = succeeded.len(),
            total = self.children.len(),
            "Parallel step had failing children, rolling back the rest"
        );
        let message = format!(
            "parallel step '{}' failed: {}",
            self.config.name,
            failures.join("; ")
        );

        if let Err((remaining, e)) = self.roll_back(ctx, &succeeded).await {
            let left = remaining.len();
            ctx.set(self.succeeded_key(), remaining);
            return Err(Error::from_source(
                format!("{}; rollback failed: {}", message, e),
                ErrorKind::Compensation,
                e,
            )
            .with_context("step", self.config.name.clone())
            .with_context("failed_children", failures.len().to_string())
            .with_context("children_in_place", left.to_string()));
        }
        ctx.set(self.succeeded_key(), Vec::<String>::new());

        let kind = if cancelled {
            ErrorKind::Cancelled
        } else {
            ErrorKind::StepExecution
        };
        Err(Error::new(message, kind)
            .with_context("step", self.config.name.clone())
            .with_context("failed_children", failures.len().to_string()))
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<()> {
        let succeeded: HashSet<String> = ctx
            .get_string_list(&self.succeeded_key())
            .unwrap_or_default()
            .into_iter()
            .collect();

        for child in self.children.iter().rev() {
            if !succeeded.contains(child.name()) {
                continue;
            }
            child.compensate(ctx).await.map_err(|e| {
                e.wrap(format!(
                    "compensation of child '{}' in parallel step '{}' failed",
                    child.name(),
                    self.config.name
                ))
            })?;
        }
        Ok(())
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
