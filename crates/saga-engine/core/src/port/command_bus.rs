//! # CommandBus Port
//!
//! This module defines the [`CommandBus`] trait used by command-dispatching
//! steps. Commands express intent ("ReserveInventory") and travel as a
//! [`CommandEnvelope`]: a type name plus a JSON payload, so any transport can
//! carry them.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Serialize)]
//! struct ReserveInventory {
//!     sku: String,
//!     quantity: u32,
//! }
//!
//! impl Command for ReserveInventory {
//!     const TYPE_ID: &'static str = "inventory.reserve";
//! }
//!
//! let envelope = CommandEnvelope::from_command(&cmd, ctx.correlation_id())?;
//! command_bus.send(envelope).await?;
//! ```

use crate::error::{Error, ErrorKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Trait for command dispatching.
#[async_trait]
pub trait CommandBus: Send + Sync {
    /// Send a command to its handler.
    async fn send(&self, command: CommandEnvelope) -> Result<(), CommandBusError>;
}

/// Marker trait for commands.
///
/// Commands represent intent to perform an operation. Unlike events, they
/// are imperative.
pub trait Command: Serialize + Send {
    /// Unique type identifier for this command.
    const TYPE_ID: &'static str;
}

/// A serialized command ready for dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub command_type: String,
    pub payload: Value,
    pub correlation_id: String,
    pub issued_at: DateTime<Utc>,
}

impl CommandEnvelope {
    pub fn new(
        command_type: impl Into<String>,
        payload: Value,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            command_type: command_type.into(),
            payload,
            correlation_id: correlation_id.into(),
            issued_at: Utc::now(),
        }
    }

    /// Serialize a typed command.
    pub fn from_command<C: Command>(
        command: &C,
        correlation_id: impl Into<String>,
    ) -> Result<Self, CommandBusError> {
        let payload = serde_json::to_value(command)
            .map_err(|e| CommandBusError::SerializationError(e.to_string()))?;
        Ok(Self::new(C::TYPE_ID, payload, correlation_id))
    }
}

/// Errors that can occur when dispatching commands.
#[derive(Debug, Error)]
pub enum CommandBusError {
    /// Timeout waiting for command execution
    #[error("Timeout executing command: {0}")]
    Timeout(String),

    /// No handler registered for this command type
    #[error("Handler not found for command: {0}")]
    HandlerNotFound(String),

    /// Error during command execution
    #[error("Command execution error: {0}")]
    ExecutionError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Command cancelled
    #[error("Command was cancelled")]
    Cancelled,
}

impl From<CommandBusError> for Error {
    fn from(err: CommandBusError) -> Self {
        let kind = match &err {
            CommandBusError::Cancelled => ErrorKind::Cancelled,
            CommandBusError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::CommandBus,
        };
        Error::from_source(err.to_string(), kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize)]
    struct ChargeCard {
        amount_cents: u64,
    }

    impl Command for ChargeCard {
        const TYPE_ID: &'static str = "payment.charge";
    }

    #[tokio::test]
    async fn test_command_bus_error_variants() {
        let error = CommandBusError::Timeout("test".to_string());
        assert!(error.to_string().contains("Timeout"));

        let error = CommandBusError::HandlerNotFound("payment.charge".into());
        assert!(error.to_string().contains("Handler not found"));

        let error = CommandBusError::Cancelled;
        assert!(error.to_string().contains("cancelled"));
    }

    #[test]
    fn test_envelope_from_command() {
        let envelope =
            CommandEnvelope::from_command(&ChargeCard { amount_cents: 1250 }, "corr-1").unwrap();

        assert_eq!(envelope.command_type, "payment.charge");
        assert_eq!(envelope.payload["amount_cents"], 1250);
        assert_eq!(envelope.correlation_id, "corr-1");
    }

    #[test]
    fn test_error_kind_mapping() {
        let err: Error = CommandBusError::Cancelled.into();
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let err: Error = CommandBusError::ExecutionError("nope".into()).into();
        assert_eq!(err.kind(), ErrorKind::CommandBus);
    }
}
