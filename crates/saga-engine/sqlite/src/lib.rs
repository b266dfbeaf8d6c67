//! # saga-engine-sqlite
//!
//! SQLite backend implementation for saga-engine.
//!
//! This crate provides two ways to store sagas durably:
//! - [`SqliteEventStore`] - EventStore + SnapshotStore, for the event-sourced
//!   persistence of `saga-engine-core`
//! - [`SqliteSagaStore`] - relational persistence: one row per saga, one row
//!   per history entry, direct upserts
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           SagaOrchestrator                          │
//! └──────────────────────┬──────────────────────────────┘
//!                        │ SagaPersistence
//! ┌──────────────────────▼──────────────────────────────┐
//! │ EventSourcedPersistence      │  SqliteSagaStore     │
//! │   └─ SqliteEventStore        │                      │
//! └──────────────────────────────┴──────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use saga_engine_sqlite::{connect, SqliteEventStore};
//!
//! let pool = connect(&EnvConfig::load_sqlite_config()).await?;
//! let store = Arc::new(SqliteEventStore::new(pool).await?);
//! let persistence = EventSourcedPersistence::new(store.clone(), store, registry);
//! ```

pub mod error;
pub mod event_store;
pub mod saga_store;

pub use error::SqliteStoreError;
pub use event_store::SqliteEventStore;
pub use saga_store::SqliteSagaStore;

use saga_engine_core::config::SqliteConfig;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

/// Busy timeout applied to every connection.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a pool for `config`.
///
/// Connections never expire, so a `sqlite::memory:` database lives as long
/// as the pool.
pub async fn connect(config: &SqliteConfig) -> Result<SqlitePool, SqliteStoreError> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?
        .create_if_missing(config.create_if_missing)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    tracing::debug!(url = %config.database_url, max_connections = config.max_connections, "SQLite pool opened");
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool() {
        let pool = connect(&SqliteConfig::in_memory()).await.unwrap();
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let config = SqliteConfig::in_memory().with_database_url("sqlite::memory:?mode=bogus");
        assert!(connect(&config).await.is_err());
    }
}
