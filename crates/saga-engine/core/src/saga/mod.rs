//! # Saga Model
//!
//! Status machines, history entries and the serializable [`SagaState`]
//! shared by the instance runtime and the persistence strategies.

pub mod definition;
pub mod instance;
pub mod registry;

pub use definition::{SagaDefinition, SagaDefinitionBuilder, StateMachine};
pub use instance::{SagaInstance, SagaRuntime};
pub use registry::SagaRegistry;

use crate::error::{Error, Result};
use crate::event::SagaId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Lifecycle status of a saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SagaStatus {
    Pending,
    Running,
    Completed,
    Compensating,
    Compensated,
    Failed,
}

impl SagaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
            Self::Failed => "failed",
        }
    }

    /// Completed, compensated and failed instances never change again.
    ///
    /// `Completed` can still be compensated manually; see
    /// [`SagaStatus::can_transition_to`].
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Compensated | Self::Failed)
    }

    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        use SagaStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Completed)
                | (Running, Compensating)
                | (Running, Failed)
                | (Completed, Compensating)
                | (Compensating, Compensated)
                | (Compensating, Failed)
        )
    }
}

impl fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "compensating" => Ok(Self::Compensating),
            "compensated" => Ok(Self::Compensated),
            "failed" => Ok(Self::Failed),
            other => Err(Error::validation(
                "status",
                &format!("unknown saga status '{}'", other),
            )),
        }
    }
}

/// Status recorded in a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Compensating,
    Compensated,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "compensating" => Ok(Self::Compensating),
            "compensated" => Ok(Self::Compensated),
            other => Err(Error::validation(
                "step_status",
                &format!("unknown step status '{}'", other),
            )),
        }
    }
}

/// One record of a step's progress.
///
/// Entries are identified by `(step_name, started_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step_name: String,
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_attempt: u32,
}

impl HistoryEntry {
    pub fn new(step_name: impl Into<String>, status: StepStatus, started_at: DateTime<Utc>) -> Self {
        Self {
            step_name: step_name.into(),
            status,
            started_at,
            completed_at: None,
            error: None,
            retry_attempt: 0,
        }
    }

    pub fn key(&self) -> (&str, DateTime<Utc>) {
        (&self.step_name, self.started_at)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.completed_at
            .and_then(|end| (end - self.started_at).to_std().ok())
    }
}

/// Serializable image of a saga instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaState {
    pub id: SagaId,
    pub definition_name: String,
    pub status: SagaStatus,
    pub current_step: usize,
    pub context: Map<String, Value>,
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}
