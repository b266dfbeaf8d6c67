//! In-memory implementation of EventBus for testing.
//!
//! Every published event is recorded, then handed to the handlers
//! subscribed to its type, in subscription order.

use async_trait::async_trait;
use parking_lot::RwLock;
use saga_engine_core::event::{SagaEvent, SagaEventType, SagaId};
use saga_engine_core::port::event_bus::{EventBus, EventBusError, EventHandler, SubscriptionId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

type Subscription = (SubscriptionId, SagaEventType, Arc<dyn EventHandler>);

#[derive(Default)]
pub struct InMemoryEventBus {
    published: RwLock<Vec<SagaEvent>>,
    subscriptions: RwLock<Vec<Subscription>>,
    fail_publish: AtomicBool,
}

impl std::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("published", &self.published.read().len())
            .field("subscriptions", &self.subscriptions.read().len())
            .finish()
    }
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event published so far.
    pub fn published(&self) -> Vec<SagaEvent> {
        self.published.read().clone()
    }

    /// Event types published for one saga, in order.
    pub fn types_for(&self, saga_id: &SagaId) -> Vec<SagaEventType> {
        self.published
            .read()
            .iter()
            .filter(|e| &e.saga_id == saga_id)
            .map(|e| e.event_type)
            .collect()
    }

    pub fn count_of(&self, event_type: SagaEventType) -> usize {
        self.published
            .read()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.published.write().clear();
    }

    /// Make every publish fail until turned off again.
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: SagaEvent) -> Result<(), EventBusError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(EventBusError::ConnectionLost("bus offline".to_string()));
        }

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .subscriptions
            .read()
            .iter()
            .filter(|(_, event_type, _)| *event_type == event.event_type)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect();
        self.published.write().push(event.clone());

        for handler in handlers {
            handler.handle(&event).await?;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        event_type: SagaEventType,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionId, EventBusError> {
        let id = SubscriptionId::default();
        self.subscriptions.write().push((id, event_type, handler));
        Ok(id)
    }

    async fn unsubscribe(&self, subscription_id: SubscriptionId) -> Result<(), EventBusError> {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|(id, _, _)| *id != subscription_id);
        if subscriptions.len() == before {
            return Err(EventBusError::SubscriptionNotFound(subscription_id));
        }
        Ok(())
    }
}
