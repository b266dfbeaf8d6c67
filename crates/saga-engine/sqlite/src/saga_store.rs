//! # Relational saga store
//!
//! [`SqliteSagaStore`] keeps one `sagas` row per instance and one
//! `saga_steps` row per history entry. Saves are upserts, so re-saving an
//! unchanged instance is a no-op and a save never grows storage beyond the
//! history itself.

use crate::error::SqliteStoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use saga_engine_core::config::SqliteConfig;
use saga_engine_core::error::{Error, Result};
use saga_engine_core::event::{SagaId, format_time};
use saga_engine_core::persistence::SagaPersistence;
use saga_engine_core::saga::{
    HistoryEntry, SagaInstance, SagaRegistry, SagaState, SagaStatus, StepStatus,
};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sagas (
        id               TEXT    PRIMARY KEY,
        definition_name  TEXT    NOT NULL,
        status           TEXT    NOT NULL,
        current_step     INTEGER NOT NULL,
        context          TEXT    NOT NULL,
        created_at       TEXT    NOT NULL,
        started_at       TEXT,
        completed_at     TEXT,
        updated_at       TEXT    NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sagas_status ON sagas (status)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS saga_steps (
        id             TEXT    PRIMARY KEY,
        saga_id        TEXT    NOT NULL REFERENCES sagas (id) ON DELETE CASCADE,
        position       INTEGER NOT NULL,
        step_name      TEXT    NOT NULL,
        status         TEXT    NOT NULL,
        started_at     TEXT    NOT NULL,
        completed_at   TEXT,
        error          TEXT,
        retry_attempt  INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_saga_steps_saga ON saga_steps (saga_id, position)
    "#,
];

/// Relational [`SagaPersistence`] over SQLite.
#[derive(Debug, Clone)]
pub struct SqliteSagaStore {
    pool: Arc<SqlitePool>,
    registry: Arc<SagaRegistry>,
}

impl SqliteSagaStore {
    /// Wrap an open pool and create the tables when missing.
    pub async fn new(
        pool: SqlitePool,
        registry: Arc<SagaRegistry>,
    ) -> std::result::Result<Self, SqliteStoreError> {
        let store = Self {
            pool: Arc::new(pool),
            registry,
        };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn connect(
        config: &SqliteConfig,
        registry: Arc<SagaRegistry>,
    ) -> std::result::Result<Self, SqliteStoreError> {
        Self::new(crate::connect(config).await?, registry).await
    }

    pub async fn in_memory(
        registry: Arc<SagaRegistry>,
    ) -> std::result::Result<Self, SqliteStoreError> {
        Self::connect(&SqliteConfig::in_memory(), registry).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the tables and indexes. Idempotent.
    pub async fn migrate(&self) -> std::result::Result<(), SqliteStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        Ok(())
    }

    /// Remove a saga and its history. Returns whether it existed.
    pub async fn delete(&self, saga_id: &SagaId) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(backend)?;
        sqlx::query("DELETE FROM saga_steps WHERE saga_id = ?")
            .bind(saga_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        let deleted = sqlx::query("DELETE FROM sagas WHERE id = ?")
            .bind(saga_id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(backend)?
            .rows_affected();
        tx.commit().await.map_err(backend)?;

        tracing::debug!(saga_id = %saga_id, deleted = deleted > 0, "Saga deleted");
        Ok(deleted > 0)
    }

    /// Ids of sagas in `status`, oldest first.
    pub async fn list_by_status(&self, status: SagaStatus) -> Result<Vec<SagaId>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT id FROM sagas WHERE status = ? ORDER BY created_at, id")
                .bind(status.as_str())
                .fetch_all(&*self.pool)
                .await
                .map_err(backend)?;
        Ok(ids.into_iter().map(SagaId).collect())
    }
}

/// Row id of a history entry, stable across saves.
pub fn step_row_id(saga_id: &SagaId, entry: &HistoryEntry) -> Uuid {
    let key = format!(
        "{}/{}/{}",
        saga_id,
        entry.step_name,
        format_time(entry.started_at)
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
}

fn backend(err: sqlx::Error) -> Error {
    SqliteStoreError::Backend(err).into()
}

fn parse_time(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SqliteStoreError::invalid(format!("timestamp '{}': {}", value, e)).into())
}

fn parse_opt_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_time).transpose()
}

#[derive(Debug, sqlx::FromRow)]
struct SagaRow {
    id: String,
    definition_name: String,
    status: String,
    current_step: i64,
    context: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct StepRow {
    step_name: String,
    status: String,
    started_at: String,
    completed_at: Option<String>,
    error: Option<String>,
    retry_attempt: i64,
}

impl StepRow {
    fn into_entry(self) -> Result<HistoryEntry> {
        Ok(HistoryEntry {
            status: self.status.parse::<StepStatus>()?,
            started_at: parse_time(&self.started_at)?,
            completed_at: parse_opt_time(self.completed_at)?,
            error: self.error,
            retry_attempt: self.retry_attempt as u32,
            step_name: self.step_name,
        })
    }
}

impl SagaRow {
    fn into_state(self, steps: Vec<StepRow>) -> Result<SagaState> {
        let context: Map<String, Value> = serde_json::from_str(&self.context)
            .map_err(|e| Error::from(SqliteStoreError::Serialization(e)))?;
        let history = steps
            .into_iter()
            .map(StepRow::into_entry)
            .collect::<Result<Vec<_>>>()?;

        Ok(SagaState {
            status: self.status.parse::<SagaStatus>()?,
            current_step: self.current_step as usize,
            context,
            history,
            created_at: parse_time(&self.created_at)?,
            started_at: parse_opt_time(self.started_at)?,
            completed_at: parse_opt_time(self.completed_at)?,
            id: SagaId(self.id),
            definition_name: self.definition_name,
        })
    }
}

#[async_trait]
impl SagaPersistence for SqliteSagaStore {
    async fn save(&self, instance: &SagaInstance) -> Result<()> {
        let state = instance.to_state();
        let context = serde_json::to_string(&state.context)
            .map_err(|e| Error::from(SqliteStoreError::Serialization(e)))?;
        let now = format_time(Utc::now());

        let mut tx = self.pool.begin().await.map_err(backend)?;

        sqlx::query(
            r#"
            INSERT INTO sagas
            (id, definition_name, status, current_step, context,
             created_at, started_at, completed_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                status       = excluded.status,
                current_step = excluded.current_step,
                context      = excluded.context,
                started_at   = excluded.started_at,
                completed_at = excluded.completed_at,
                updated_at   = excluded.updated_at
            "#,
        )
        .bind(state.id.as_str())
        .bind(&state.definition_name)
        .bind(state.status.as_str())
        .bind(state.current_step as i64)
        .bind(context)
        .bind(format_time(state.created_at))
        .bind(state.started_at.map(format_time))
        .bind(state.completed_at.map(format_time))
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        for (position, entry) in state.history.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO saga_steps
                (id, saga_id, position, step_name, status,
                 started_at, completed_at, error, retry_attempt)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (id) DO UPDATE SET
                    position      = excluded.position,
                    status        = excluded.status,
                    completed_at  = excluded.completed_at,
                    error         = excluded.error,
                    retry_attempt = excluded.retry_attempt
                "#,
            )
            .bind(step_row_id(&state.id, entry).to_string())
            .bind(state.id.as_str())
            .bind(position as i64)
            .bind(&entry.step_name)
            .bind(entry.status.as_str())
            .bind(format_time(entry.started_at))
            .bind(entry.completed_at.map(format_time))
            .bind(entry.error.as_deref())
            .bind(entry.retry_attempt as i64)
            .execute(&mut *tx)
            .await
            .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;

        tracing::debug!(
            saga_id = %state.id,
            status = %state.status,
            history = state.history.len(),
            "Saga row saved"
        );
        Ok(())
    }

    async fn load(&self, saga_id: &SagaId) -> Result<SagaInstance> {
        let row: Option<SagaRow> = sqlx::query_as(
            r#"
            SELECT id, definition_name, status, current_step, context,
                   created_at, started_at, completed_at
            FROM sagas
            WHERE id = ?
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(backend)?;

        let row = row.ok_or_else(|| Error::not_found(format!("saga '{}' not found", saga_id)))?;

        let steps: Vec<StepRow> = sqlx::query_as(
            r#"
            SELECT step_name, status, started_at, completed_at, error, retry_attempt
            FROM saga_steps
            WHERE saga_id = ?
            ORDER BY position ASC
            "#,
        )
        .bind(saga_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(backend)?;

        let state = row.into_state(steps)?;
        let definition = self.registry.get(&state.definition_name).ok_or_else(|| {
            Error::definition_not_found(&state.definition_name)
                .with_context("saga_id", state.id.to_string())
        })?;
        SagaInstance::from_state(state, definition)
    }

    async fn get_status(&self, saga_id: &SagaId) -> Result<SagaStatus> {
        let status: Option<String> = sqlx::query_scalar("SELECT status FROM sagas WHERE id = ?")
            .bind(saga_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend)?;

        status
            .ok_or_else(|| Error::not_found(format!("saga '{}' not found", saga_id)))?
            .parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saga_engine_core::ErrorKind;
    use saga_engine_core::context::SagaContext;
    use saga_engine_core::saga::{SagaDefinition, SagaRuntime};
    use saga_engine_testing::{RecordingStep, StepLog};

    fn registry() -> Arc<SagaRegistry> {
        let registry = Arc::new(SagaRegistry::new());
        let log = StepLog::new();
        registry.register(
            SagaDefinition::builder("order")
                .step(RecordingStep::new("reserve", &log))
                .step(RecordingStep::new("charge", &log))
                .build()
                .unwrap(),
        );
        registry
    }

    fn instance(registry: &SagaRegistry) -> SagaInstance {
        let ctx = SagaContext::new();
        ctx.set("order_id", "o-1");
        SagaInstance::new(registry.get("order").unwrap(), ctx)
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let registry = registry();
        let store = SqliteSagaStore::in_memory(registry.clone()).await.unwrap();
        let saga = instance(&registry);
        saga.execute(&SagaRuntime::new()).await.unwrap();

        store.save(&saga).await.unwrap();
        let loaded = store.load(saga.id()).await.unwrap();

        assert_eq!(loaded.to_state(), saga.to_state());
        assert_eq!(
            store.get_status(saga.id()).await.unwrap(),
            SagaStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_resave_is_idempotent() {
        let registry = registry();
        let store = SqliteSagaStore::in_memory(registry.clone()).await.unwrap();
        let saga = instance(&registry);
        saga.execute(&SagaRuntime::new()).await.unwrap();

        store.save(&saga).await.unwrap();
        store.save(&saga).await.unwrap();

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM saga_steps WHERE saga_id = ?")
            .bind(saga.id().as_str())
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows as usize, saga.history_len());
    }

    #[tokio::test]
    async fn test_load_errors() {
        let registry = registry();
        let store = SqliteSagaStore::in_memory(registry.clone()).await.unwrap();

        let err = store.load(&SagaId::from("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = store.get_status(&SagaId::from("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let saga = instance(&registry);
        store.save(&saga).await.unwrap();
        let other = SqliteSagaStore::new(store.pool().clone(), Arc::new(SagaRegistry::new()))
            .await
            .unwrap();
        let err = other.load(saga.id()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
    }

    #[tokio::test]
    async fn test_delete_and_list_by_status() {
        let registry = registry();
        let store = SqliteSagaStore::in_memory(registry.clone()).await.unwrap();

        let done = instance(&registry);
        done.execute(&SagaRuntime::new()).await.unwrap();
        let pending = instance(&registry);
        store.save(&done).await.unwrap();
        store.save(&pending).await.unwrap();

        assert_eq!(
            store.list_by_status(SagaStatus::Pending).await.unwrap(),
            vec![pending.id().clone()]
        );
        assert_eq!(
            store.list_by_status(SagaStatus::Completed).await.unwrap(),
            vec![done.id().clone()]
        );

        assert!(store.delete(done.id()).await.unwrap());
        assert!(!store.delete(done.id()).await.unwrap());
        assert!(store.list_by_status(SagaStatus::Completed).await.unwrap().is_empty());
    }

    #[test]
    fn test_step_row_id_is_stable() {
        let saga = SagaId::from("s");
        let entry = HistoryEntry::new("reserve", StepStatus::Running, Utc::now());
        let mut done = entry.clone();
        done.status = StepStatus::Completed;
        assert_eq!(step_row_id(&saga, &entry), step_row_id(&saga, &done));

        let retried = HistoryEntry::new(
            "reserve",
            StepStatus::Running,
            entry.started_at + chrono::Duration::milliseconds(1),
        );
        assert_ne!(step_row_id(&saga, &entry), step_row_id(&saga, &retried));
    }
}
