//! Saga and step lifecycle notifications published on the [`EventBus`].
//!
//! [`EventBus`]: crate::port::EventBus

use super::SagaId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle event names, consumed by external projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaEventType {
    SagaStarted,
    SagaCompleted,
    SagaFailed,
    SagaCompensating,
    SagaCompensated,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepCompensating,
    StepCompensated,
}

impl SagaEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaEventType::SagaStarted => "SagaStarted",
            SagaEventType::SagaCompleted => "SagaCompleted",
            SagaEventType::SagaFailed => "SagaFailed",
            SagaEventType::SagaCompensating => "SagaCompensating",
            SagaEventType::SagaCompensated => "SagaCompensated",
            SagaEventType::StepStarted => "StepStarted",
            SagaEventType::StepCompleted => "StepCompleted",
            SagaEventType::StepFailed => "StepFailed",
            SagaEventType::StepCompensating => "StepCompensating",
            SagaEventType::StepCompensated => "StepCompensated",
        }
    }

    pub fn is_step_event(&self) -> bool {
        matches!(
            self,
            SagaEventType::StepStarted
                | SagaEventType::StepCompleted
                | SagaEventType::StepFailed
                | SagaEventType::StepCompensating
                | SagaEventType::StepCompensated
        )
    }
}

impl std::fmt::Display for SagaEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaEvent {
    pub event_type: SagaEventType,
    pub saga_id: SagaId,
    pub correlation_id: String,
    pub definition_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_attempt: Option<u32>,
    pub occurred_at: DateTime<Utc>,
}

impl SagaEvent {
    pub fn new(
        event_type: SagaEventType,
        saga_id: SagaId,
        correlation_id: impl Into<String>,
        definition_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            saga_id,
            correlation_id: correlation_id.into(),
            definition_name: definition_name.into(),
            step_name: None,
            duration_ms: None,
            error: None,
            retry_attempt: None,
            occurred_at: Utc::now(),
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step_name = Some(step.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }

    pub fn with_retry_attempt(mut self, attempt: u32) -> Self {
        self.retry_attempt = Some(attempt);
        self
    }
}
