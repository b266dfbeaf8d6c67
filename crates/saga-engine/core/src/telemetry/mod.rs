//! # Telemetry Module
//!
//! Tracing setup for processes embedding the saga engine, and the spans
//! saga runs are recorded under.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use saga_engine_core::telemetry::{init_telemetry, TelemetryConfig};
//!
//! // Initialize telemetry at application startup
//! let _guard = init_telemetry(&TelemetryConfig::default())?;
//! ```

use crate::error::{Error, Result};
use crate::event::SagaId;
use tracing::{Level, Span, span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

/// Configuration for telemetry initialization
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Service name for tracing
    pub service_name: String,
    /// Service version
    pub service_version: String,
    /// Log level filter, in `EnvFilter` directive syntax
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "saga-engine".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = version.into();
        self
    }
}

/// Telemetry guard - must be kept alive for tracing to work
#[derive(Debug)]
pub struct TelemetryGuard {
    service_name: String,
}

impl TelemetryGuard {
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Shutdown telemetry
    pub fn shutdown(self) {
        tracing::info!(service = %self.service_name, "Telemetry shut down");
    }
}

/// Install the global subscriber: `EnvFilter` plus a fmt layer.
///
/// Only one global subscriber can exist; a second call returns a
/// configuration error.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_new(&config.log_level).map_err(|e| {
        Error::configuration(format!("invalid log level '{}': {}", config.log_level, e))
    })?;

    Registry::default()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::configuration(format!("tracing already initialized: {}", e)))?;

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        "Telemetry initialized"
    );
    Ok(TelemetryGuard {
        service_name: config.service_name.clone(),
    })
}

/// Span covering one orchestrated run of a saga.
pub fn saga_span(saga: &str, saga_id: &SagaId, action: &str) -> Span {
    span!(
        Level::INFO,
        "saga",
        saga.name = saga,
        saga.id = %saga_id,
        saga.action = action,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_telemetry_config_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "saga-engine");
        assert_eq!(config.log_level, "info");

        let custom = TelemetryConfig::new("orders").with_log_level("debug");
        assert_eq!(custom.service_name, "orders");
        assert_eq!(custom.log_level, "debug");
    }

    #[test]
    fn test_init_twice_reports_configuration_error() {
        let config = TelemetryConfig::default().with_log_level("warn");
        let first = init_telemetry(&config);
        let second = init_telemetry(&config);

        // Another test in this binary may have installed a subscriber first.
        assert!(second.is_err());
        assert_eq!(second.unwrap_err().kind(), ErrorKind::Configuration);
        if let Ok(guard) = first {
            assert_eq!(guard.service_name(), "saga-engine");
            guard.shutdown();
        }
    }

    #[test]
    fn test_saga_span_is_created() {
        let span = saga_span("order", &SagaId::from("s-1"), "execute");
        let _entered = span.enter();
    }
}
