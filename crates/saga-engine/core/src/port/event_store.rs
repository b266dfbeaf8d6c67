//! EventStore port trait definition.
//!
//! This module defines the [`EventStore`] trait that backends must implement
//! to provide append-only stream storage for the event-sourced saga
//! persistence.

use crate::error::{Error, ErrorKind};
use crate::event::{EventType, SagaId, StoredEvent};
use chrono::{DateTime, Utc};

/// Errors that can occur when operating on the event store.
#[derive(Debug, thiserror::Error)]
pub enum EventStoreError<E> {
    /// Conflict error - optimistic locking detected version mismatch.
    #[error("Conflict: expected version {expected}, but current is {actual}")]
    Conflict {
        /// The version the writer expected the stream to be at.
        expected: u64,
        /// The actual current version.
        actual: u64,
    },

    /// The requested stream was not found.
    #[error("Stream not found: {stream_id}")]
    NotFound {
        /// The stream that was not found.
        stream_id: SagaId,
    },

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(E),

    /// Codec/serialization error.
    #[error("Codec error: {0}")]
    Codec(String),
}

impl<E> EventStoreError<E> {
    /// Create a conflict error.
    pub fn conflict(expected: u64, actual: u64) -> Self {
        Self::Conflict { expected, actual }
    }

    /// Create a not found error.
    pub fn not_found(stream_id: SagaId) -> Self {
        Self::NotFound { stream_id }
    }

    /// Check if this is a conflict error.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl<E> From<E> for EventStoreError<E> {
    fn from(err: E) -> Self {
        EventStoreError::Backend(err)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<EventStoreError<E>> for Error {
    fn from(err: EventStoreError<E>) -> Self {
        let kind = match &err {
            EventStoreError::Conflict { .. } => ErrorKind::Concurrency,
            EventStoreError::NotFound { .. } => ErrorKind::NotFound,
            EventStoreError::Codec(_) => ErrorKind::Codec,
            EventStoreError::Backend(_) => ErrorKind::EventStore,
        };
        Error::from_source(err.to_string(), kind, err)
    }
}

/// Trait for event stream storage.
///
/// # Concurrency Model
///
/// Implementations use optimistic locking:
/// 1. `append_events` requires the version the caller believes is current
/// 2. If the stream's version differs, return `EventStoreError::Conflict`
/// 3. The engine surfaces the conflict; it never retries it
///
/// Versions are 1-based and contiguous per stream. An empty stream is at
/// version 0.
#[async_trait::async_trait]
pub trait EventStore: Send + Sync {
    /// The error type for this implementation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Append events atomically after `expected_version`.
    ///
    /// The store assigns versions `expected_version + 1 ..`. Returns the
    /// version of the last appended event.
    async fn append_events(
        &self,
        stream_id: &SagaId,
        expected_version: u64,
        events: Vec<StoredEvent>,
    ) -> Result<u64, EventStoreError<Self::Error>>;

    /// Events of a stream with `version >= from_version`, in order.
    async fn get_events(
        &self,
        stream_id: &SagaId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError<Self::Error>>;

    /// Events of one type across all streams, recorded at or after `since`.
    async fn get_events_by_type(
        &self,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventStoreError<Self::Error>>;

    /// Version of the last event in the stream, 0 if empty.
    async fn current_version(&self, stream_id: &SagaId)
    -> Result<u64, EventStoreError<Self::Error>>;

    /// Most recent event of a type within one stream.
    ///
    /// The default scans the whole stream; backends with an index should
    /// override it.
    async fn get_last_event_of_type(
        &self,
        stream_id: &SagaId,
        event_type: EventType,
    ) -> Result<Option<StoredEvent>, EventStoreError<Self::Error>> {
        let events = self.get_events(stream_id, 0).await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }
}
