//! Command-dispatching step.
//!
//! Builds a [`CommandEnvelope`] from the saga context and sends it through a
//! [`CommandBus`]. An optional second builder produces the compensating
//! command.

use super::{SagaStep, StepConfig};
use crate::context::SagaContext;
use crate::error::{Error, Result};
use crate::port::{Command, CommandBus, CommandBusError, CommandEnvelope};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Produces the envelope to send for a given context.
pub type CommandFactory =
    Arc<dyn Fn(&SagaContext) -> std::result::Result<CommandEnvelope, CommandBusError> + Send + Sync>;

pub struct CommandStep {
    config: StepConfig,
    bus: Arc<dyn CommandBus>,
    command: CommandFactory,
    compensation: Option<CommandFactory>,
}

impl std::fmt::Debug for CommandStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandStep")
            .field("config", &self.config)
            .field("has_compensation", &self.compensation.is_some())
            .finish()
    }
}

impl CommandStep {
    pub fn builder(name: impl Into<String>, bus: Arc<dyn CommandBus>) -> CommandStepBuilder {
        CommandStepBuilder {
            config: StepConfig::new(name),
            bus,
            command: None,
            compensation: None,
        }
    }

    async fn dispatch(
        &self,
        factory: &CommandFactory,
        ctx: &SagaContext,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let envelope = factory(ctx).map_err(|e| {
            Error::from(e).with_context("step", self.config.name.clone())
        })?;
        let command_type = envelope.command_type.clone();

        tracing::debug!(step = %self.config.name, command = %command_type, "Sending command");

        let send = self.bus.send(envelope);
        let result = match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(CommandBusError::Cancelled),
                result = send => result,
            },
            None => send.await,
        };

        result.map_err(|e| {
            Error::from(e)
                .with_context("step", self.config.name.clone())
                .with_context("command", command_type)
        })
    }
}

#[async_trait]
impl SagaStep for CommandStep {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn execute(&self, ctx: &SagaContext, cancel: &CancellationToken) -> Result<()> {
        self.dispatch(&self.command, ctx, Some(cancel)).await
    }

    async fn compensate(&self, ctx: &SagaContext) -> Result<()> {
        match &self.compensation {
            Some(factory) => self.dispatch(factory, ctx, None).await,
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

pub struct CommandStepBuilder {
    config: StepConfig,
    bus: Arc<dyn CommandBus>,
    command: Option<CommandFactory>,
    compensation: Option<CommandFactory>,
}

impl CommandStepBuilder {
    /// Typed command built from the context, correlated with the saga.
    pub fn command<C, F>(mut self, f: F) -> Self
    where
        C: Command,
        F: Fn(&SagaContext) -> C + Send + Sync + 'static,
    {
        self.command = Some(typed_factory(f));
        self
    }

    pub fn compensation<C, F>(mut self, f: F) -> Self
    where
        C: Command,
        F: Fn(&SagaContext) -> C + Send + Sync + 'static,
    {
        self.compensation = Some(typed_factory(f));
        self
    }

    /// Raw envelope factory for commands without a Rust type.
    pub fn envelope<F>(mut self, f: F) -> Self
    where
        F: Fn(&SagaContext) -> std::result::Result<CommandEnvelope, CommandBusError>
            + Send
            + Sync
            + 'static,
    {
        self.command = Some(Arc::new(f));
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

    pub fn build(self) -> Result<CommandStep> {
        if self.config.name.trim().is_empty() {
            return Err(Error::validation("name", "step name must not be empty"));
        }
        let command = self.command.ok_or_else(|| {
            Error::validation("command", "command step requires a command")
                .with_context("step", self.config.name.clone())
        })?;
        Ok(CommandStep {
            config: self.config,
            bus: self.bus,
            command,
            compensation: self.compensation,
        })
    }
}

fn typed_factory<C, F>(f: F) -> CommandFactory
where
    C: Command,
    F: Fn(&SagaContext) -> C + Send + Sync + 'static,
{
    Arc::new(move |ctx: &SagaContext| {
        CommandEnvelope::from_command(&f(ctx), ctx.correlation_id())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use parking_lot::Mutex;
    use serde::Serialize;

    #[derive(Default)]
    struct RecordingBus {
        sent: Mutex<Vec<CommandEnvelope>>,
        reject: Option<String>,
    }

    #[async_trait]
    impl CommandBus for RecordingBus {
        async fn send(&self, command: CommandEnvelope) -> std::result::Result<(), CommandBusError> {
            if self.reject.as_deref() == Some(command.command_type.as_str()) {
                return Err(CommandBusError::HandlerNotFound(command.command_type));
            }
            self.sent.lock().push(command);
            Ok(())
        }
    }

    #[derive(Serialize)]
    struct ReserveStock {
        sku: String,
        quantity: i64,
    }

    impl Command for ReserveStock {
        const TYPE_ID: &'static str = "inventory.reserve";
    }

    #[derive(Serialize)]
    struct ReleaseStock {
        sku: String,
    }

    impl Command for ReleaseStock {
        const TYPE_ID: &'static str = "inventory.release";
    }

    fn step(bus: Arc<RecordingBus>) -> CommandStep {
        CommandStep::builder("reserve_inventory", bus)
            .command(|ctx| ReserveStock {
                sku: ctx.get_string("sku").unwrap_or_default(),
                quantity: ctx.get_int("quantity").unwrap_or(1),
            })
            .compensation(|ctx| ReleaseStock {
                sku: ctx.get_string("sku").unwrap_or_default(),
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sends_command_built_from_context() {
        let bus = Arc::new(RecordingBus::default());
        let step = step(bus.clone());
        let ctx = SagaContext::with_correlation_id("order-42");
        ctx.set("sku", "SKU-1");
        ctx.set("quantity", 3);

        step.execute(&ctx, &CancellationToken::new()).await.unwrap();

        let sent = bus.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].command_type, "inventory.reserve");
        assert_eq!(sent[0].payload["quantity"], 3);
        assert_eq!(sent[0].correlation_id, "order-42");
    }

    #[tokio::test]
    async fn test_compensation_sends_compensating_command() {
        let bus = Arc::new(RecordingBus::default());
        let step = step(bus.clone());
        let ctx = SagaContext::new();
        ctx.set("sku", "SKU-1");

        step.compensate(&ctx).await.unwrap();
        assert_eq!(bus.sent.lock()[0].command_type, "inventory.release");
    }

    #[tokio::test]
    async fn test_bus_error_is_wrapped_with_step() {
        let bus = Arc::new(RecordingBus {
            reject: Some("inventory.reserve".into()),
            ..Default::default()
        });
        let step = step(bus);

        let err = step
            .execute(&SagaContext::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommandBus);
        assert_eq!(err.get_context("step"), Some("reserve_inventory"));
        assert_eq!(err.get_context("command"), Some("inventory.reserve"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_dispatch() {
        let bus = Arc::new(RecordingBus::default());
        let step = step(bus.clone());
        let token = CancellationToken::new();
        token.cancel();

        let err = step.execute(&SagaContext::new(), &token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(bus.sent.lock().is_empty());
    }

    #[test]
    fn test_build_requires_command() {
        let bus: Arc<dyn CommandBus> = Arc::new(RecordingBus::default());
        assert!(CommandStep::builder("empty", bus).build().is_err());
    }
}
