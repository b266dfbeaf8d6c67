//! Event types for the saga engine.
//!
//! This module contains the persisted event record [`StoredEvent`], the
//! persisted [`EventType`] names and the metadata keys each type carries.
//! Both names and keys are a wire contract shared with recovery and with
//! external read-model projections.
//!
//! Bus notifications (saga and step lifecycle) live in [`lifecycle`].

pub mod lifecycle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

pub use lifecycle::{SagaEvent, SagaEventType};

/// Saga identifier type. Also the event stream id of the saga.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SagaId(pub String);

impl SagaId {
    /// Create a new saga ID from a UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }

    /// Generate a new random saga ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SagaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SagaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SagaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SagaId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Metadata keys carried by persisted events.
pub mod keys {
    pub const STATUS: &str = "status";
    pub const STEP: &str = "step";
    pub const CONTEXT: &str = "context";
    pub const DEFINITION_NAME: &str = "definition_name";
    pub const SAVED_HISTORY_COUNT: &str = "saved_history_count";
    pub const LAST_SAVED_VERSION: &str = "last_saved_version";
    pub const STARTED: &str = "saga_started_at";
    pub const COMPLETED: &str = "saga_completed_at";
    pub const CREATED: &str = "saga_created_at";

    pub const STEP_NAME: &str = "step_name";
    pub const STEP_STATUS: &str = "step_status";
    pub const STARTED_AT: &str = "started_at";
    pub const COMPLETED_AT: &str = "completed_at";
    pub const DURATION_MS: &str = "duration_ms";
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    pub const ERROR: &str = "error";
    pub const ERROR_MESSAGE: &str = "error_message";
}

/// Type of persisted events in a saga stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Full status/step/context snapshot, one per save.
    SagaStateChanged,
    /// Trailing marker of a save batch.
    SagaStateCheckpoint,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepCompensating,
    StepCompensated,
}

impl EventType {
    pub const ALL: [EventType; 7] = [
        EventType::SagaStateChanged,
        EventType::SagaStateCheckpoint,
        EventType::StepStarted,
        EventType::StepCompleted,
        EventType::StepFailed,
        EventType::StepCompensating,
        EventType::StepCompensated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SagaStateChanged => "SagaStateChanged",
            EventType::SagaStateCheckpoint => "SagaStateCheckpoint",
            EventType::StepStarted => "StepStarted",
            EventType::StepCompleted => "StepCompleted",
            EventType::StepFailed => "StepFailed",
            EventType::StepCompensating => "StepCompensating",
            EventType::StepCompensated => "StepCompensated",
        }
    }

    /// True for the five per-history-entry event types.
    pub fn is_step_event(&self) -> bool {
        !matches!(
            self,
            EventType::SagaStateChanged | EventType::SagaStateCheckpoint
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .find(|t| t.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown event type: {}", s))
    }
}

/// An event as stored in a saga stream.
///
/// `version` is the 1-based position in the stream and is assigned by the
/// event store on append; events built by the engine carry 0 until then.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub stream_id: SagaId,
    pub version: u64,
    pub event_type: EventType,
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl StoredEvent {
    pub fn builder(stream_id: SagaId, event_type: EventType) -> StoredEventBuilder {
        StoredEventBuilder {
            stream_id,
            event_type,
            metadata: Map::new(),
            timestamp: None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.metadata.get(key).and_then(Value::as_u64)
    }

    pub fn get_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.get_str(key)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Builder for [`StoredEvent`].
#[derive(Debug)]
pub struct StoredEventBuilder {
    stream_id: SagaId,
    event_type: EventType,
    metadata: Map<String, Value>,
    timestamp: Option<DateTime<Utc>>,
}

impl StoredEventBuilder {
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Insert only when `value` is `Some`.
    pub fn with_opt(mut self, key: &str, value: Option<impl Into<Value>>) -> Self {
        if let Some(v) = value {
            self.metadata.insert(key.to_string(), v.into());
        }
        self
    }

    pub fn with_time(self, key: &str, time: DateTime<Utc>) -> Self {
        self.with(key, format_time(time))
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> StoredEvent {
        StoredEvent {
            event_id: Uuid::new_v4(),
            stream_id: self.stream_id,
            version: 0,
            event_type: self.event_type,
            metadata: self.metadata,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        }
    }
}

/// RFC 3339 with nanoseconds, the format used for every persisted timestamp.
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true)
}
