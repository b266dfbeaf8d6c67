//! In-memory implementation of EventStore for testing.
//!
//! This implementation is thread-safe and provides full event store
//! functionality without requiring a database. It also counts what readers
//! pull out of it, so tests can check that saves and loads stay bounded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use saga_engine_core::event::{EventType, SagaId, StoredEvent};
use saga_engine_core::port::event_store::{EventStore, EventStoreError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory event store implementation.
///
/// # Thread Safety
///
/// Uses `RwLock` for concurrent access:
/// - Multiple readers can access simultaneously
/// - Appends get exclusive access, so the version check and the write are atomic
///
/// # Example
///
/// ```rust,ignore
/// let store = InMemoryEventStore::new();
/// let saga_id = SagaId::from("test-saga");
///
/// let event = StoredEvent::builder(saga_id.clone(), EventType::SagaStateChanged).build();
/// let version = store.append_events(&saga_id, 0, vec![event]).await?;
/// assert_eq!(version, 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    /// Streams indexed by saga_id, ordered by version.
    streams: RwLock<HashMap<SagaId, Vec<StoredEvent>>>,

    /// Events handed out by `get_events` and `get_events_by_type`.
    events_read: AtomicUsize,

    /// `get_events` calls starting at the first version.
    full_reads: AtomicUsize,

    /// When set, reads fail with a backend error.
    fail_reads: AtomicBool,
}

impl InMemoryEventStore {
    /// Create a new in-memory event store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new event store with initial streams.
    ///
    /// Versions are reassigned in the given order.
    pub fn with_events(events: Vec<StoredEvent>) -> Self {
        let store = Self::new();
        {
            let mut streams = store.streams.write();
            for mut event in events {
                let stream = streams.entry(event.stream_id.clone()).or_default();
                event.version = stream.len() as u64 + 1;
                stream.push(event);
            }
        }
        store
    }

    /// Clear all data (useful for testing).
    pub fn clear(&self) {
        self.streams.write().clear();
        self.reset_read_counters();
    }

    /// Get the number of streams stored.
    pub fn saga_count(&self) -> usize {
        self.streams.read().len()
    }

    /// Get the total number of events stored.
    pub fn event_count(&self) -> usize {
        self.streams.read().values().map(Vec::len).sum()
    }

    /// Snapshot of one stream, bypassing the read counters.
    pub fn stream(&self, saga_id: &SagaId) -> Vec<StoredEvent> {
        self.streams.read().get(saga_id).cloned().unwrap_or_default()
    }

    /// Events of one stream with the given type, bypassing the read counters.
    pub fn events_of_type(&self, saga_id: &SagaId, event_type: EventType) -> Vec<StoredEvent> {
        self.stream(saga_id)
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Drop every event of one type from a stream and renumber the rest.
    ///
    /// Simulates data written before that event type existed.
    pub fn strip_events_of_type(&self, saga_id: &SagaId, event_type: EventType) {
        if let Some(stream) = self.streams.write().get_mut(saga_id) {
            stream.retain(|e| e.event_type != event_type);
            for (i, event) in stream.iter_mut().enumerate() {
                event.version = i as u64 + 1;
            }
        }
    }

    /// Keep only the first `len` events of a stream.
    pub fn truncate_stream(&self, saga_id: &SagaId, len: usize) {
        if let Some(stream) = self.streams.write().get_mut(saga_id) {
            stream.truncate(len);
        }
    }

    pub fn events_read(&self) -> usize {
        self.events_read.load(Ordering::SeqCst)
    }

    pub fn full_reads(&self) -> usize {
        self.full_reads.load(Ordering::SeqCst)
    }

    pub fn reset_read_counters(&self) {
        self.events_read.store(0, Ordering::SeqCst);
        self.full_reads.store(0, Ordering::SeqCst);
    }

    /// Make every read fail until turned off again.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> Result<(), EventStoreError<InMemoryEventStoreError>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(InMemoryEventStoreError::Internal("reads disabled".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type Error = InMemoryEventStoreError;

    async fn append_events(
        &self,
        stream_id: &SagaId,
        expected_version: u64,
        events: Vec<StoredEvent>,
    ) -> Result<u64, EventStoreError<Self::Error>> {
        let mut streams = self.streams.write();
        let stream = streams.entry(stream_id.clone()).or_default();

        // Check for conflict (optimistic locking)
        let current = stream.len() as u64;
        if current != expected_version {
            return Err(EventStoreError::conflict(expected_version, current));
        }

        for mut event in events {
            if &event.stream_id != stream_id {
                return Err(InMemoryEventStoreError::WrongStream(event.stream_id.to_string()).into());
            }
            event.version = stream.len() as u64 + 1;
            stream.push(event);
        }
        Ok(stream.len() as u64)
    }

    async fn get_events(
        &self,
        stream_id: &SagaId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError<Self::Error>> {
        self.check_reads()?;
        if from_version <= 1 {
            self.full_reads.fetch_add(1, Ordering::SeqCst);
        }

        let events: Vec<StoredEvent> = self
            .streams
            .read()
            .get(stream_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        self.events_read.fetch_add(events.len(), Ordering::SeqCst);
        Ok(events)
    }

    async fn get_events_by_type(
        &self,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventStoreError<Self::Error>> {
        self.check_reads()?;
        let events: Vec<StoredEvent> = self
            .streams
            .read()
            .values()
            .flatten()
            .filter(|e| e.event_type == event_type && e.timestamp >= since)
            .cloned()
            .collect();
        self.events_read.fetch_add(events.len(), Ordering::SeqCst);
        Ok(events)
    }

    async fn current_version(
        &self,
        stream_id: &SagaId,
    ) -> Result<u64, EventStoreError<Self::Error>> {
        Ok(self
            .streams
            .read()
            .get(stream_id)
            .map_or(0, |stream| stream.len() as u64))
    }

    /// Indexed lookup; does not count as a stream read.
    async fn get_last_event_of_type(
        &self,
        stream_id: &SagaId,
        event_type: EventType,
    ) -> Result<Option<StoredEvent>, EventStoreError<Self::Error>> {
        self.check_reads()?;
        Ok(self.streams.read().get(stream_id).and_then(|stream| {
            stream
                .iter()
                .rev()
                .find(|e| e.event_type == event_type)
                .cloned()
        }))
    }
}

/// Error type for InMemoryEventStore operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InMemoryEventStoreError {
    #[error("Event belongs to stream {0}")]
    WrongStream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<String> for InMemoryEventStoreError {
    fn from(s: String) -> Self {
        Self::Internal(s)
    }
}
