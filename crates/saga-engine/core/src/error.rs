//!
//! # Error Types
//!
//! Central error type for the saga engine. Every failure that crosses a
//! component boundary is an [`Error`] carrying an [`ErrorKind`] plus string
//! context (`saga_id`, `step`, ...) for diagnostics.
//!

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Central error type for saga-engine
#[derive(Debug)]
pub struct Error {
    /// Error message
    message: String,
    /// Error kind for classification
    kind: ErrorKind,
    /// Source error if any
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
    /// Timestamp when error occurred
    timestamp: SystemTime,
    /// Additional context attributes
    context: HashMap<String, String>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| &**e as &(dyn std::error::Error + 'static))
    }
}

impl Error {
    /// Create a new error with message
    pub fn new(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind,
            source: None,
            timestamp: SystemTime::now(),
            context: HashMap::new(),
        }
    }

    /// Create from another error
    pub fn from_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        kind: ErrorKind,
        source: E,
    ) -> Self {
        Self {
            message: message.into(),
            kind,
            source: Some(Box::new(source)),
            timestamp: SystemTime::now(),
            context: HashMap::new(),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind.clone()
    }

    /// Check the error kind without cloning.
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Error message without context.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Add context attribute
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Get context value
    pub fn get_context(&self, key: &str) -> Option<&str> {
        self.context.get(key).map(|s| s.as_str())
    }

    /// Get all context
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Get timestamp
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Wrap this error with an outer message, keeping kind and context.
    pub fn wrap(self, message: impl Into<String>) -> Self {
        let kind = self.kind.clone();
        let context = self.context.clone();
        let mut wrapped = Self::from_source(message, kind, self);
        wrapped.context = context;
        wrapped
    }

    /// Convert to structured format
    pub fn to_structured(&self) -> StructuredError {
        StructuredError {
            message: self.message.clone(),
            kind: self.kind.clone(),
            timestamp: chrono::DateTime::from(self.timestamp),
            context: self.context.clone(),
            source: self.source.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Structured error for serialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredError {
    pub message: String,
    pub kind: ErrorKind,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub context: HashMap<String, String>,
    pub source: Option<String>,
}

/// Kinds of errors
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A step's forward action failed after its retries
    StepExecution,
    /// A step guard returned false
    GuardRejected,
    /// A compensating action failed
    Compensation,
    /// Saga state could not be saved or loaded
    Persistence,
    /// Event store errors
    EventStore,
    /// Snapshot store errors
    Snapshot,
    /// Codec errors
    Codec,
    /// No definition registered under the requested name
    DefinitionNotFound,
    /// Saga not found
    NotFound,
    /// Optimistic concurrency conflict
    Concurrency,
    /// Cancellation errors
    Cancelled,
    /// Timeout errors
    Timeout,
    /// Operation illegal in the current saga status
    InvalidState,
    /// Validation errors
    Validation,
    /// Event bus errors
    EventBus,
    /// Command bus errors
    CommandBus,
    /// Configuration errors
    Configuration,
    /// Unknown errors
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::StepExecution => "step_execution",
            ErrorKind::GuardRejected => "guard_rejected",
            ErrorKind::Compensation => "compensation",
            ErrorKind::Persistence => "persistence",
            ErrorKind::EventStore => "event_store",
            ErrorKind::Snapshot => "snapshot",
            ErrorKind::Codec => "codec",
            ErrorKind::DefinitionNotFound => "definition_not_found",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Concurrency => "concurrency",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidState => "invalid_state",
            ErrorKind::Validation => "validation",
            ErrorKind::EventBus => "event_bus",
            ErrorKind::CommandBus => "command_bus",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result type with saga-engine error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Helper macro to create errors with context
#[macro_export]
macro_rules! ctx_error {
    ($kind:expr, $message:expr) => {
        $crate::Error::new($message.to_string(), $kind)
    };
    ($kind:expr, $message:expr, $($key:expr => $value:expr),+) => {
        {
            let mut error = $crate::Error::new($message.to_string(), $kind);
            $(
                error = error.with_context($key, $value);
            )+
            error
        }
    };
}

/// Helper functions for common error scenarios
impl Error {
    /// Create a step execution error
    pub fn step_execution(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::StepExecution)
    }

    /// Create a guard rejection for a step
    pub fn guard_rejected(step: &str) -> Self {
        Self::new(
            format!("guard rejected execution of step '{}'", step),
            ErrorKind::GuardRejected,
        )
        .with_context("step", step)
    }

    /// Create a compensation error
    pub fn compensation(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::Compensation)
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::Persistence)
    }

    /// Create an event store error
    pub fn event_store(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::EventStore)
    }

    /// Create a definition-resolution error
    pub fn definition_not_found(name: &str) -> Self {
        Self::new(
            format!("saga definition not found: {}", name),
            ErrorKind::DefinitionNotFound,
        )
        .with_context("definition", name)
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::NotFound)
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::Timeout)
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::Cancelled)
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::InvalidState)
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(message, ErrorKind::Configuration)
    }

    /// Create a validation error
    pub fn validation(field: &str, message: &str) -> Self {
        Self::new(
            format!("Validation error on field '{}': {}", field, message),
            ErrorKind::Validation,
        )
        .with_context("field", field)
    }
}
