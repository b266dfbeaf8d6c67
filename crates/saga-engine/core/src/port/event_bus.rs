//! # EventBus Port
//!
//! This module defines the [`EventBus`] trait used to publish saga and step
//! lifecycle notifications ([`SagaEvent`]) and to subscribe handlers to them.
//!
//! # Example
//!
//! ```ignore
//! struct AuditProjection;
//!
//! #[async_trait]
//! impl EventHandler for AuditProjection {
//!     async fn handle(&self, event: &SagaEvent) -> Result<(), EventBusError> {
//!         println!("{} {}", event.saga_id, event.event_type);
//!         Ok(())
//!     }
//! }
//!
//! event_bus.subscribe(SagaEventType::SagaFailed, Arc::new(AuditProjection)).await?;
//! ```

use crate::error::{Error, ErrorKind};
use crate::event::{SagaEvent, SagaEventType};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Trait for publishing and subscribing to lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to the bus.
    async fn publish(&self, event: SagaEvent) -> Result<(), EventBusError>;

    /// Subscribe a handler to one event type.
    async fn subscribe(
        &self,
        event_type: SagaEventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, EventBusError>;

    /// Remove a subscription.
    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> Result<(), EventBusError>;
}

/// Handler for lifecycle events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle the event.
    async fn handle(&self, event: &SagaEvent) -> Result<(), EventBusError>;
}

/// Subscription identifier for managing subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

impl Default for SubscriptionId {
    fn default() -> Self {
        SubscriptionId(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during event publishing or subscription.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Error publishing an event
    #[error("Publish error: {0}")]
    Publish(String),

    /// Error subscribing to events
    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Subscription not found
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// A handler rejected the event
    #[error("Handler error: {0}")]
    Handler(String),

    /// Connection lost
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
}

impl From<EventBusError> for Error {
    fn from(err: EventBusError) -> Self {
        Error::from_source(err.to_string(), ErrorKind::EventBus, err)
    }
}
