//! # Saga Engine Configuration
//!
//! Engine-wide defaults (snapshotting, retry policy, step timeout) and the
//! connection settings for the SQLite adapters, plus an environment loader.

use crate::retry::RetryPolicy;
use crate::snapshot::{DEFAULT_SNAPSHOT_FREQUENCY, SnapshotConfig};
use std::time::Duration;

/// Configuration for the saga engine.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaEngineConfig {
    /// Completed history entries between full snapshot refreshes.
    pub snapshot_frequency: usize,
    /// Attach a SHA-256 checksum to snapshot state blobs.
    pub enable_snapshot_checksum: bool,
    /// Retry policy for definitions that set none.
    pub default_retry_policy: Option<RetryPolicy>,
    /// Step timeout for definitions that set none.
    pub default_step_timeout: Option<Duration>,
}

impl Default for SagaEngineConfig {
    fn default() -> Self {
        Self {
            snapshot_frequency: DEFAULT_SNAPSHOT_FREQUENCY,
            enable_snapshot_checksum: true,
            default_retry_policy: None,
            default_step_timeout: None,
        }
    }
}

impl SagaEngineConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot_frequency(mut self, frequency: usize) -> Self {
        self.snapshot_frequency = frequency;
        self
    }

    pub fn with_snapshot_checksum(mut self, enabled: bool) -> Self {
        self.enable_snapshot_checksum = enabled;
        self
    }

    pub fn with_default_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.default_retry_policy = Some(policy);
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }

    pub fn snapshot_config(&self) -> SnapshotConfig {
        SnapshotConfig::new(self.snapshot_frequency, self.enable_snapshot_checksum)
    }
}

/// Configuration for SQLite connections
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqliteConfig {
    /// Database connection URL
    pub database_url: String,
    /// Maximum connections in pool
    pub max_connections: u32,
    /// Create the database file when missing
    pub create_if_missing: bool,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://saga.db".to_string(),
            max_connections: 5,
            create_if_missing: true,
        }
    }
}

impl SqliteConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared in-memory database, mostly for tests.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            create_if_missing: true,
        }
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = url.into();
        self
    }

    pub fn with_max_connections(mut self, n: u32) -> Self {
        self.max_connections = n;
        self
    }
}

/// Environment-based configuration loader
#[derive(Debug, Clone)]
pub struct EnvConfig;

impl EnvConfig {
    /// Load SagaEngineConfig from environment variables
    pub fn load_saga_engine_config() -> SagaEngineConfig {
        let mut config = SagaEngineConfig::new()
            .with_snapshot_frequency(env_parse("SAGA_SNAPSHOT_FREQUENCY", DEFAULT_SNAPSHOT_FREQUENCY))
            .with_snapshot_checksum(env_parse("SAGA_SNAPSHOT_CHECKSUM", true));

        let max_attempts: Option<u32> = env_value("SAGA_DEFAULT_MAX_ATTEMPTS");
        let delay_ms: Option<u64> = env_value("SAGA_DEFAULT_RETRY_DELAY_MS");
        if max_attempts.is_some() || delay_ms.is_some() {
            let defaults = RetryPolicy::default();
            config = config.with_default_retry_policy(
                RetryPolicy::builder()
                    .max_attempts(max_attempts.unwrap_or(defaults.max_attempts))
                    .initial_delay(delay_ms.map_or(defaults.initial_delay, Duration::from_millis))
                    .backoff_multiplier(defaults.backoff_multiplier)
                    .build(),
            );
        }

        if let Some(ms) = env_value::<u64>("SAGA_DEFAULT_STEP_TIMEOUT_MS") {
            config = config.with_default_step_timeout(Duration::from_millis(ms));
        }

        config
    }

    /// Load SQLite config from environment
    pub fn load_sqlite_config() -> SqliteConfig {
        let defaults = SqliteConfig::default();
        SqliteConfig::new()
            .with_database_url(
                std::env::var("SAGA_SQLITE_URL").unwrap_or(defaults.database_url),
            )
            .with_max_connections(env_parse("SAGA_SQLITE_MAX_CONNECTIONS", defaults.max_connections))
    }
}

fn env_value<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_value(key).unwrap_or(default)
}

// ============================================================================
// Tests
// ============================================================================
