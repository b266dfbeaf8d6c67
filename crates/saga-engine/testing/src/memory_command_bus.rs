//! In-memory implementation of CommandBus for testing.

use async_trait::async_trait;
use parking_lot::RwLock;
use saga_engine_core::port::command_bus::{CommandBus, CommandBusError, CommandEnvelope};
use std::collections::HashMap;

/// Records every command it receives.
///
/// Command types marked with [`fail_on`](Self::fail_on) are recorded and
/// then rejected with an execution error.
#[derive(Debug, Default)]
pub struct InMemoryCommandBus {
    sent: RwLock<Vec<CommandEnvelope>>,
    failures: RwLock<HashMap<String, String>>,
}

impl InMemoryCommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, command_type: impl Into<String>, message: impl Into<String>) {
        self.failures
            .write()
            .insert(command_type.into(), message.into());
    }

    pub fn stop_failing(&self, command_type: &str) {
        self.failures.write().remove(command_type);
    }

    pub fn sent(&self) -> Vec<CommandEnvelope> {
        self.sent.read().clone()
    }

    /// Command types received, in order.
    pub fn sent_types(&self) -> Vec<String> {
        self.sent
            .read()
            .iter()
            .map(|c| c.command_type.clone())
            .collect()
    }
}

#[async_trait]
impl CommandBus for InMemoryCommandBus {
    async fn send(&self, command: CommandEnvelope) -> Result<(), CommandBusError> {
        let failure = self.failures.read().get(&command.command_type).cloned();
        self.sent.write().push(command);
        match failure {
            Some(message) => Err(CommandBusError::ExecutionError(message)),
            None => Ok(()),
        }
    }
}
