//! # SQLite EventStore Implementation
//!
//! This module provides [`SqliteEventStore`], an append-only event stream
//! and snapshot store backed by SQLite. It implements both the
//! [`EventStore`] and [`SnapshotStore`] ports, so one instance can serve as
//! both halves of `EventSourcedPersistence`.

use crate::error::SqliteStoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga_engine_core::config::SqliteConfig;
use saga_engine_core::event::{EventType, SagaId, StoredEvent, format_time};
use saga_engine_core::port::event_store::{EventStore, EventStoreError};
use saga_engine_core::port::snapshot_store::{SnapshotStore, SnapshotStoreError};
use saga_engine_core::snapshot::{Snapshot, SnapshotChecksum};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS saga_events (
        stream_id   TEXT    NOT NULL,
        version     INTEGER NOT NULL,
        event_id    TEXT    NOT NULL,
        event_type  TEXT    NOT NULL,
        metadata    TEXT    NOT NULL,
        created_at  TEXT    NOT NULL,
        PRIMARY KEY (stream_id, version)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_saga_events_type
        ON saga_events (event_type, created_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_saga_events_stream_type
        ON saga_events (stream_id, event_type, version)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saga_snapshots (
        saga_id               TEXT    PRIMARY KEY,
        definition_name       TEXT    NOT NULL,
        last_saved_version    INTEGER NOT NULL,
        saved_history_count   INTEGER NOT NULL,
        state                 BLOB,
        state_version         INTEGER NOT NULL,
        state_completed_count INTEGER NOT NULL,
        checksum              BLOB,
        created_at            TEXT    NOT NULL,
        updated_at            TEXT    NOT NULL
    )
    "#,
];

/// SQLite EventStore and SnapshotStore.
///
/// This implementation provides:
/// - Transactional batch appends with optimistic locking
/// - An index on `(stream_id, event_type)` for last-event-of-type lookups
/// - One snapshot row per saga, replaced on every save
///
/// # Examples
///
/// ```ignore
/// use saga_engine_sqlite::SqliteEventStore;
///
/// let store = Arc::new(SqliteEventStore::in_memory().await?);
/// let persistence = EventSourcedPersistence::new(store.clone(), store, registry);
/// ```
#[derive(Debug, Clone)]
pub struct SqliteEventStore {
    pool: Arc<SqlitePool>,
}

impl SqliteEventStore {
    /// Wrap an open pool and create the tables when missing.
    pub async fn new(pool: SqlitePool) -> Result<Self, SqliteStoreError> {
        let store = Self {
            pool: Arc::new(pool),
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn connect(config: &SqliteConfig) -> Result<Self, SqliteStoreError> {
        Self::new(crate::connect(config).await?).await
    }

    /// Private in-memory database. Useful for testing.
    pub async fn in_memory() -> Result<Self, SqliteStoreError> {
        Self::connect(&SqliteConfig::in_memory()).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the tables and indexes. Idempotent.
    pub async fn migrate(&self) -> Result<(), SqliteStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    stream_id: String,
    version: i64,
    event_id: String,
    event_type: String,
    metadata: String,
    created_at: String,
}

impl EventRow {
    fn into_event(self) -> Result<StoredEvent, EventStoreError<SqliteStoreError>> {
        let event_type = self
            .event_type
            .parse::<EventType>()
            .map_err(EventStoreError::Codec)?;
        let event_id = Uuid::parse_str(&self.event_id)
            .map_err(|e| EventStoreError::Codec(format!("event_id: {}", e)))?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| EventStoreError::Codec(format!("metadata: {}", e)))?;
        let timestamp = parse_time(&self.created_at).map_err(EventStoreError::Codec)?;

        Ok(StoredEvent {
            event_id,
            stream_id: SagaId(self.stream_id),
            version: self.version as u64,
            event_type,
            metadata,
            timestamp,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("timestamp '{}': {}", value, e))
}

fn into_events(
    rows: Vec<EventRow>,
) -> Result<Vec<StoredEvent>, EventStoreError<SqliteStoreError>> {
    rows.into_iter().map(EventRow::into_event).collect()
}

#[async_trait]
impl EventStore for SqliteEventStore {
    type Error = SqliteStoreError;

    async fn append_events(
        &self,
        stream_id: &SagaId,
        expected_version: u64,
        events: Vec<StoredEvent>,
    ) -> Result<u64, EventStoreError<Self::Error>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(SqliteStoreError::Backend)?;

        // Verify optimistic lock
        let current: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM saga_events WHERE stream_id = ?",
        )
        .bind(stream_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(SqliteStoreError::Backend)?;

        let current = current as u64;
        if current != expected_version {
            return Err(EventStoreError::conflict(expected_version, current));
        }

        let mut version = expected_version;
        for event in &events {
            version += 1;
            let metadata =
                serde_json::to_string(&event.metadata).map_err(SqliteStoreError::Serialization)?;

            let inserted = sqlx::query(
                r#"
                INSERT INTO saga_events
                (stream_id, version, event_id, event_type, metadata, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(stream_id.as_str())
            .bind(version as i64)
            .bind(event.event_id.to_string())
            .bind(event.event_type.as_str())
            .bind(metadata)
            .bind(format_time(event.timestamp))
            .execute(&mut *tx)
            .await;

            if let Err(err) = inserted {
                // A writer that slipped in between the version check and the insert
                if let sqlx::Error::Database(db) = &err
                    && db.is_unique_violation()
                {
                    return Err(EventStoreError::conflict(expected_version, version));
                }
                return Err(SqliteStoreError::Backend(err).into());
            }
        }

        tx.commit().await.map_err(SqliteStoreError::Backend)?;

        tracing::trace!(
            saga_id = %stream_id,
            count = events.len(),
            version,
            "Events appended"
        );
        Ok(version)
    }

    async fn get_events(
        &self,
        stream_id: &SagaId,
        from_version: u64,
    ) -> Result<Vec<StoredEvent>, EventStoreError<Self::Error>> {
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT stream_id, version, event_id, event_type, metadata, created_at
            FROM saga_events
            WHERE stream_id = ? AND version >= ?
            ORDER BY version ASC
            "#,
        )
        .bind(stream_id.as_str())
        .bind(from_version as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(SqliteStoreError::Backend)?;

        into_events(rows)
    }

    async fn get_events_by_type(
        &self,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> Result<Vec<StoredEvent>, EventStoreError<Self::Error>> {
        // Fixed-width RFC 3339 strings compare in time order.
        let rows: Vec<EventRow> = sqlx::query_as(
            r#"
            SELECT stream_id, version, event_id, event_type, metadata, created_at
            FROM saga_events
            WHERE event_type = ? AND created_at >= ?
            ORDER BY created_at ASC, stream_id ASC, version ASC
            "#,
        )
        .bind(event_type.as_str())
        .bind(format_time(since))
        .fetch_all(&*self.pool)
        .await
        .map_err(SqliteStoreError::Backend)?;

        into_events(rows)
    }

    async fn current_version(
        &self,
        stream_id: &SagaId,
    ) -> Result<u64, EventStoreError<Self::Error>> {
        let version: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(version), 0) FROM saga_events WHERE stream_id = ?",
        )
        .bind(stream_id.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(SqliteStoreError::Backend)?;

        Ok(version as u64)
    }

    async fn get_last_event_of_type(
        &self,
        stream_id: &SagaId,
        event_type: EventType,
    ) -> Result<Option<StoredEvent>, EventStoreError<Self::Error>> {
        let row: Option<EventRow> = sqlx::query_as(
            r#"
            SELECT stream_id, version, event_id, event_type, metadata, created_at
            FROM saga_events
            WHERE stream_id = ? AND event_type = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(stream_id.as_str())
        .bind(event_type.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(SqliteStoreError::Backend)?;

        row.map(EventRow::into_event).transpose()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SnapshotRow {
    saga_id: String,
    definition_name: String,
    last_saved_version: i64,
    saved_history_count: i64,
    state: Option<Vec<u8>>,
    state_version: i64,
    state_completed_count: i64,
    checksum: Option<Vec<u8>>,
    created_at: String,
    updated_at: String,
}

impl SnapshotRow {
    fn into_snapshot(self) -> Result<Snapshot, SnapshotStoreError<SqliteStoreError>> {
        let checksum = self
            .checksum
            .map(|bytes| {
                <[u8; 32]>::try_from(bytes.as_slice())
                    .map(SnapshotChecksum)
                    .map_err(|_| {
                        SnapshotStoreError::Serialization(format!(
                            "checksum has {} bytes, expected 32",
                            bytes.len()
                        ))
                    })
            })
            .transpose()?;

        Ok(Snapshot {
            saga_id: SagaId(self.saga_id),
            definition_name: self.definition_name,
            last_saved_version: self.last_saved_version as u64,
            saved_history_count: self.saved_history_count as usize,
            state: self.state,
            state_version: self.state_version as u64,
            state_completed_count: self.state_completed_count as usize,
            checksum,
            created_at: parse_time(&self.created_at).map_err(SnapshotStoreError::Serialization)?,
            updated_at: parse_time(&self.updated_at).map_err(SnapshotStoreError::Serialization)?,
        })
    }
}

#[async_trait]
impl SnapshotStore for SqliteEventStore {
    type Error = SqliteStoreError;

    async fn get_snapshot(
        &self,
        saga_id: &SagaId,
    ) -> Result<Option<Snapshot>, SnapshotStoreError<Self::Error>> {
        let row: Option<SnapshotRow> = sqlx::query_as(
            r#"
            SELECT saga_id, definition_name, last_saved_version, saved_history_count,
                   state, state_version, state_completed_count, checksum,
                   created_at, updated_at
            FROM saga_snapshots
            WHERE saga_id = ?
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(SqliteStoreError::Backend)?;

        row.map(SnapshotRow::into_snapshot).transpose()
    }

    async fn save_snapshot(
        &self,
        snapshot: &Snapshot,
    ) -> Result<(), SnapshotStoreError<Self::Error>> {
        sqlx::query(
            r#"
            INSERT INTO saga_snapshots
            (saga_id, definition_name, last_saved_version, saved_history_count,
             state, state_version, state_completed_count, checksum, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (saga_id) DO UPDATE SET
                definition_name       = excluded.definition_name,
                last_saved_version    = excluded.last_saved_version,
                saved_history_count   = excluded.saved_history_count,
                state                 = excluded.state,
                state_version         = excluded.state_version,
                state_completed_count = excluded.state_completed_count,
                checksum              = excluded.checksum,
                updated_at            = excluded.updated_at
            "#,
        )
        .bind(snapshot.saga_id.as_str())
        .bind(&snapshot.definition_name)
        .bind(snapshot.last_saved_version as i64)
        .bind(snapshot.saved_history_count as i64)
        .bind(snapshot.state.as_deref())
        .bind(snapshot.state_version as i64)
        .bind(snapshot.state_completed_count as i64)
        .bind(snapshot.checksum.as_ref().map(|c| c.0.to_vec()))
        .bind(format_time(snapshot.created_at))
        .bind(format_time(snapshot.updated_at))
        .execute(&*self.pool)
        .await
        .map_err(SqliteStoreError::Backend)?;

        Ok(())
    }
}
