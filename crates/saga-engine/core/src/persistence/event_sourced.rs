//! Event-sourced saga persistence with checkpoints and snapshots.
//!
//! Every `save` appends one batch to the saga's stream:
//!
//! ```text
//! SagaStateChanged   status, step, context, definition_name,
//!                    saved_history_count / last_saved_version (before the batch)
//! Step*              one per history entry not yet persisted
//! SagaStateCheckpoint last_saved_version (its own version), saved_history_count
//! ```
//!
//! Only the history tail is appended, so the stream grows with progress, not
//! with the number of saves. A trailing `running` entry goes out as
//! `StepStarted` but is not counted as saved, so the next save emits it
//! again with its final status; replay keys entries by step name and start
//! time, so the second event replaces the first. Before writing, the stream position and the
//! persisted history count are resolved from, in order: snapshot metadata,
//! the last checkpoint event, the last state event found by type, and a full
//! replay. Every tier that knows a version reads only the events after it.
//!
//! The snapshot's checkpoint metadata is refreshed on every save; its state
//! blob every `frequency` completed entries and on terminal statuses. Load
//! combines a verified state blob with the events after it, and falls back
//! to a full replay.

use super::SagaPersistence;
use crate::codec::{JsonCodec, StateCodec};
use crate::error::{Error, ErrorKind, Result};
use crate::event::{EventType, SagaId, StoredEvent, keys};
use crate::port::{EventStore, SnapshotStore};
use crate::saga::{
    HistoryEntry, SagaInstance, SagaRegistry, SagaState, SagaStatus, StepStatus,
};
use crate::snapshot::{Snapshot, SnapshotConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stream position and persisted history length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SavePosition {
    version: u64,
    saved_history_count: usize,
}

pub struct EventSourcedPersistence<S: EventStore, N: SnapshotStore> {
    events: Arc<S>,
    snapshots: Arc<N>,
    registry: Arc<SagaRegistry>,
    codec: Arc<dyn StateCodec>,
    config: SnapshotConfig,
}

impl<S: EventStore, N: SnapshotStore> EventSourcedPersistence<S, N> {
    pub fn new(events: Arc<S>, snapshots: Arc<N>, registry: Arc<SagaRegistry>) -> Self {
        Self {
            events,
            snapshots,
            registry,
            codec: Arc::new(JsonCodec::new()),
            config: SnapshotConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SnapshotConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_codec(mut self, codec: Arc<dyn StateCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn event_store(&self) -> &Arc<S> {
        &self.events
    }

    pub fn snapshot_store(&self) -> &Arc<N> {
        &self.snapshots
    }

    pub fn registry(&self) -> &Arc<SagaRegistry> {
        &self.registry
    }

    /// Snapshot lookups are best-effort; a failing store degrades to replay.
    async fn snapshot(&self, saga_id: &SagaId) -> Option<Snapshot> {
        match self.snapshots.get_snapshot(saga_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(saga_id = %saga_id, error = %e, "Snapshot lookup failed");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Position resolution
    // ------------------------------------------------------------------

    async fn resolve_position(
        &self,
        saga_id: &SagaId,
        snapshot: Option<&Snapshot>,
        created_at: DateTime<Utc>,
    ) -> Result<SavePosition> {
        let current = self
            .events
            .current_version(saga_id)
            .await
            .map_err(Error::from)?;
        if current == 0 {
            return Ok(SavePosition {
                version: 0,
                saved_history_count: 0,
            });
        }

        if let Some(snapshot) = snapshot.filter(|s| s.last_saved_version > 0) {
            let known = SavePosition {
                version: snapshot.last_saved_version,
                saved_history_count: snapshot.saved_history_count,
            };
            if let Some(position) = self.refine(saga_id, known, current, "snapshot").await {
                return Ok(position);
            }
        }

        match self
            .events
            .get_last_event_of_type(saga_id, EventType::SagaStateCheckpoint)
            .await
        {
            Ok(Some(checkpoint)) => {
                if let Some(count) = checkpoint.get_u64(keys::SAVED_HISTORY_COUNT) {
                    let known = SavePosition {
                        version: checkpoint.version,
                        saved_history_count: count as usize,
                    };
                    if let Some(position) =
                        self.refine(saga_id, known, current, "checkpoint").await
                    {
                        return Ok(position);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(saga_id = %saga_id, error = %e, "Checkpoint lookup failed"),
        }

        match self
            .events
            .get_events_by_type(EventType::SagaStateChanged, created_at)
            .await
        {
            Ok(changes) => {
                let latest = changes
                    .into_iter()
                    .filter(|e| &e.stream_id == saga_id)
                    .max_by_key(|e| e.version);
                if let Some(change) = latest {
                    let known = SavePosition {
                        version: change.version,
                        saved_history_count: change
                            .get_u64(keys::SAVED_HISTORY_COUNT)
                            .unwrap_or(0) as usize,
                    };
                    // The state event precedes the step events of its own batch.
                    if let Some(position) = self
                        .refine_from_state_change(saga_id, &change, known, current)
                        .await
                    {
                        return Ok(position);
                    }
                }
            }
            Err(e) => warn!(saga_id = %saga_id, error = %e, "State event lookup by type failed"),
        }

        warn!(saga_id = %saga_id, "Falling back to full replay to resolve stream position");
        let events = self
            .events
            .get_events(saga_id, 0)
            .await
            .map_err(Error::from)?;
        let (version, count) = scan(&events, 0, 0);
        if version != current {
            return Err(Error::new(
                format!(
                    "stream {} is at version {} but replay ended at {}",
                    saga_id, current, version
                ),
                ErrorKind::Concurrency,
            )
            .with_context("saga_id", saga_id.to_string()));
        }
        Ok(SavePosition {
            version,
            saved_history_count: count,
        })
    }

    /// Read only the events after `known` and bring it up to `current`.
    ///
    /// `None` when `known` is stale or the read does not line up.
    async fn refine(
        &self,
        saga_id: &SagaId,
        known: SavePosition,
        current: u64,
        tier: &'static str,
    ) -> Option<SavePosition> {
        if known.version > current {
            warn!(
                saga_id = %saga_id,
                tier,
                known = known.version,
                current,
                "Stale stream position, trying next tier"
            );
            return None;
        }
        if known.version == current {
            debug!(saga_id = %saga_id, tier, version = current, "Stream position resolved");
            return Some(known);
        }

        let tail = match self.events.get_events(saga_id, known.version + 1).await {
            Ok(tail) => tail,
            Err(e) => {
                warn!(saga_id = %saga_id, tier, error = %e, "Tail read failed, trying next tier");
                return None;
            }
        };
        if !is_contiguous(&tail, known.version) {
            warn!(saga_id = %saga_id, tier, "Tail read is not contiguous, trying next tier");
            return None;
        }

        let (version, count) = scan(&tail, known.version, known.saved_history_count);
        if version != current {
            warn!(saga_id = %saga_id, tier, version, current, "Tail read ended early, trying next tier");
            return None;
        }
        debug!(
            saga_id = %saga_id,
            tier,
            version,
            read = tail.len(),
            "Stream position resolved"
        );
        Some(SavePosition {
            version,
            saved_history_count: count,
        })
    }

    async fn refine_from_state_change(
        &self,
        saga_id: &SagaId,
        change: &StoredEvent,
        known: SavePosition,
        current: u64,
    ) -> Option<SavePosition> {
        // Start just before the state event so its own batch is counted.
        let before = SavePosition {
            version: change.version.saturating_sub(1),
            saved_history_count: known.saved_history_count,
        };
        self.refine(saga_id, before, current, "state_changed").await
    }

    // ------------------------------------------------------------------
    // Snapshot refresh
    // ------------------------------------------------------------------

    async fn refresh_snapshot(
        &self,
        snapshot: Option<Snapshot>,
        state: &SagaState,
        version: u64,
        saved_history_count: usize,
    ) {
        let mut snapshot = snapshot
            .unwrap_or_else(|| Snapshot::new(state.id.clone(), state.definition_name.clone()));
        snapshot.set_checkpoint(version, saved_history_count);

        let completed = state
            .history
            .iter()
            .filter(|e| e.status == StepStatus::Completed)
            .count();
        let due = self.config.is_due(completed, snapshot.state_completed_count);
        if self.config.is_enabled() && (due || state.status.is_terminal()) {
            match self.codec.encode(state) {
                Ok(blob) => {
                    snapshot.set_state(blob, version, completed, self.config.enable_checksum);
                    debug!(saga_id = %state.id, version, completed, "Snapshot state refreshed");
                }
                Err(e) => warn!(saga_id = %state.id, error = %e, "Snapshot encoding failed"),
            }
        }

        if let Err(e) = self.snapshots.save_snapshot(&snapshot).await {
            warn!(saga_id = %state.id, error = %e, "Snapshot refresh failed");
        }
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// Verified snapshot state plus the events recorded after it.
    async fn load_from_snapshot(&self, saga_id: &SagaId, snapshot: &Snapshot) -> Option<SagaState> {
        let blob = match snapshot.verified_state() {
            Some(blob) => blob,
            None => {
                if snapshot.state.is_some() {
                    warn!(saga_id = %saga_id, "Snapshot checksum mismatch, replaying stream");
                }
                return None;
            }
        };
        let state = match self.codec.decode(blob) {
            Ok(state) => state,
            Err(e) => {
                warn!(saga_id = %saga_id, error = %e, "Snapshot state unreadable, replaying stream");
                return None;
            }
        };

        let current = self.events.current_version(saga_id).await.ok()?;
        if current < snapshot.state_version {
            warn!(
                saga_id = %saga_id,
                state_version = snapshot.state_version,
                current,
                "Snapshot is ahead of the stream, replaying stream"
            );
            return None;
        }
        let tail = match self
            .events
            .get_events(saga_id, snapshot.state_version + 1)
            .await
        {
            Ok(tail) => tail,
            Err(e) => {
                warn!(saga_id = %saga_id, error = %e, "Tail read failed, replaying stream");
                return None;
            }
        };
        if !is_contiguous(&tail, snapshot.state_version)
            || tail.last().map_or(snapshot.state_version, |e| e.version) != current
        {
            warn!(saga_id = %saga_id, "Tail after snapshot does not line up, replaying stream");
            return None;
        }

        let mut replay = Replay::from_state(state);
        for event in &tail {
            if let Err(e) = replay.apply(event) {
                warn!(saga_id = %saga_id, error = %e, "Tail event unreadable, replaying stream");
                return None;
            }
        }
        debug!(saga_id = %saga_id, tail = tail.len(), "Loaded from snapshot");
        replay.finish(saga_id, Some(&snapshot.definition_name)).ok()
    }

    fn instantiate(&self, state: SagaState) -> Result<SagaInstance> {
        let definition = self
            .registry
            .get(&state.definition_name)
            .ok_or_else(|| {
                Error::definition_not_found(&state.definition_name)
                    .with_context("saga_id", state.id.to_string())
            })?;
        SagaInstance::from_state(state, definition)
    }
}

#[async_trait]
impl<S: EventStore, N: SnapshotStore> SagaPersistence for EventSourcedPersistence<S, N> {
    async fn save(&self, instance: &SagaInstance) -> Result<()> {
        let saga_id = instance.id().clone();
        let state = instance.to_state();
        let snapshot = self.snapshot(&saga_id).await;

        let position = self
            .resolve_position(&saga_id, snapshot.as_ref(), state.created_at)
            .await?;
        if position.saved_history_count > state.history.len() {
            return Err(Error::persistence(format!(
                "persisted history ({}) is ahead of the instance ({})",
                position.saved_history_count,
                state.history.len()
            ))
            .with_context("saga_id", saga_id.to_string()));
        }

        let tail = &state.history[position.saved_history_count..];
        let saved_history_count = settled_len(&state.history).max(position.saved_history_count);
        let mut batch = Vec::with_capacity(tail.len() + 2);
        batch.push(state_changed_event(&state, position));
        batch.extend(tail.iter().map(|entry| step_event(&saga_id, entry)));

        let checkpoint_version = position.version + batch.len() as u64 + 1;
        batch.push(
            StoredEvent::builder(saga_id.clone(), EventType::SagaStateCheckpoint)
                .with(keys::LAST_SAVED_VERSION, checkpoint_version)
                .with(keys::SAVED_HISTORY_COUNT, saved_history_count as u64)
                .build(),
        );

        let appended = batch.len();
        let version = self
            .events
            .append_events(&saga_id, position.version, batch)
            .await
            .map_err(|e| Error::from(e).with_context("saga_id", saga_id.to_string()))?;

        debug!(
            saga_id = %saga_id,
            status = %state.status,
            version,
            appended,
            new_history = tail.len(),
            "Saga state saved"
        );

        self.refresh_snapshot(snapshot, &state, version, saved_history_count)
            .await;
        Ok(())
    }

    async fn load(&self, saga_id: &SagaId) -> Result<SagaInstance> {
        let snapshot = self.snapshot(saga_id).await;

        if let Some(snapshot) = &snapshot
            && let Some(state) = self.load_from_snapshot(saga_id, snapshot).await
        {
            return self.instantiate(state);
        }

        let events = self
            .events
            .get_events(saga_id, 0)
            .await
            .map_err(|e| Error::from(e).with_context("saga_id", saga_id.to_string()))?;
        if events.is_empty() {
            return Err(Error::not_found(format!("saga {} not found", saga_id))
                .with_context("saga_id", saga_id.to_string()));
        }

        let mut replay = Replay::default();
        for event in &events {
            replay.apply(event)?;
        }
        let fallback_name = snapshot.as_ref().map(|s| s.definition_name.as_str());
        let state = replay.finish(saga_id, fallback_name)?;
        debug!(saga_id = %saga_id, events = events.len(), "Loaded from full replay");
        self.instantiate(state)
    }

    async fn get_status(&self, saga_id: &SagaId) -> Result<SagaStatus> {
        let latest = self
            .events
            .get_last_event_of_type(saga_id, EventType::SagaStateChanged)
            .await
            .map_err(|e| Error::from(e).with_context("saga_id", saga_id.to_string()))?
            .ok_or_else(|| {
                Error::not_found(format!("saga {} not found", saga_id))
                    .with_context("saga_id", saga_id.to_string())
            })?;
        latest
            .get_str(keys::STATUS)
            .ok_or_else(|| Error::persistence("state event without status"))?
            .parse()
    }
}

// ============================================================================
// Event mapping
// ============================================================================

fn state_changed_event(state: &SagaState, position: SavePosition) -> StoredEvent {
    let mut builder = StoredEvent::builder(state.id.clone(), EventType::SagaStateChanged)
        .with(keys::STATUS, state.status.as_str())
        .with(keys::STEP, state.current_step as u64)
        .with(keys::CONTEXT, Value::Object(state.context.clone()))
        .with(keys::DEFINITION_NAME, state.definition_name.as_str())
        .with(keys::SAVED_HISTORY_COUNT, position.saved_history_count as u64)
        .with(keys::LAST_SAVED_VERSION, position.version)
        .with_time(keys::CREATED, state.created_at);
    if let Some(started) = state.started_at {
        builder = builder.with_time(keys::STARTED, started);
    }
    if let Some(completed) = state.completed_at {
        builder = builder.with_time(keys::COMPLETED, completed);
    }
    builder.build()
}

fn step_event_type(status: StepStatus) -> EventType {
    match status {
        StepStatus::Pending | StepStatus::Running => EventType::StepStarted,
        StepStatus::Completed => EventType::StepCompleted,
        StepStatus::Failed => EventType::StepFailed,
        StepStatus::Compensating => EventType::StepCompensating,
        StepStatus::Compensated => EventType::StepCompensated,
    }
}

fn step_event(saga_id: &SagaId, entry: &HistoryEntry) -> StoredEvent {
    let mut builder = StoredEvent::builder(saga_id.clone(), step_event_type(entry.status))
        .with(keys::STEP_NAME, entry.step_name.as_str())
        .with(keys::STEP_STATUS, entry.status.as_str())
        .with_time(keys::STARTED_AT, entry.started_at)
        .with(keys::RETRY_ATTEMPT, entry.retry_attempt);
    if let Some(completed) = entry.completed_at {
        builder = builder.with_time(keys::COMPLETED_AT, completed);
    }
    if let Some(duration) = entry.duration() {
        builder = builder.with(keys::DURATION_MS, duration.as_millis() as u64);
    }
    if let Some(error) = &entry.error {
        builder = builder
            .with(keys::ERROR, error.as_str())
            .with(keys::ERROR_MESSAGE, error.as_str());
    }
    builder.build()
}

fn is_contiguous(events: &[StoredEvent], after: u64) -> bool {
    events
        .iter()
        .enumerate()
        .all(|(i, e)| e.version == after + 1 + i as u64)
}

/// History entries that will not change again: all but a trailing
/// `running` entry.
fn settled_len(history: &[HistoryEntry]) -> usize {
    match history.last() {
        Some(last) if last.status == StepStatus::Running => history.len() - 1,
        _ => history.len(),
    }
}

/// Walk events after a known position: state and checkpoint events carry
/// an authoritative count, step events add one each. A `StepStarted` that
/// ends the walk is an entry still running and does not count.
fn scan(events: &[StoredEvent], version: u64, count: usize) -> (u64, usize) {
    let mut version = version;
    let mut count = count;
    let mut open = false;
    for event in events {
        match event.event_type {
            EventType::SagaStateChanged | EventType::SagaStateCheckpoint => {
                if let Some(c) = event.get_u64(keys::SAVED_HISTORY_COUNT) {
                    count = c as usize;
                    open = false;
                }
            }
            t if t.is_step_event() => {
                count += 1;
                open = t == EventType::StepStarted;
            }
            _ => {}
        }
        version = event.version;
    }
    if open {
        count -= 1;
    }
    (version, count)
}

/// Rebuilds a [`SagaState`] from stream events.
#[derive(Debug, Default)]
struct Replay {
    definition_name: Option<String>,
    status: Option<SagaStatus>,
    current_step: usize,
    context: Map<String, Value>,
    history: Vec<HistoryEntry>,
    index: HashMap<(String, DateTime<Utc>), usize>,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl Replay {
    fn from_state(state: SagaState) -> Self {
        let index = state
            .history
            .iter()
            .enumerate()
            .map(|(i, e)| ((e.step_name.clone(), e.started_at), i))
            .collect();
        Self {
            definition_name: Some(state.definition_name),
            status: Some(state.status),
            current_step: state.current_step,
            context: state.context,
            history: state.history,
            index,
            created_at: Some(state.created_at),
            started_at: state.started_at,
            completed_at: state.completed_at,
        }
    }

    fn apply(&mut self, event: &StoredEvent) -> Result<()> {
        match event.event_type {
            EventType::SagaStateChanged => self.apply_state_change(event),
            EventType::SagaStateCheckpoint => Ok(()),
            _ => self.apply_step(event),
        }
    }

    fn apply_state_change(&mut self, event: &StoredEvent) -> Result<()> {
        let status = event
            .get_str(keys::STATUS)
            .ok_or_else(|| malformed(event, keys::STATUS))?
            .parse()?;
        self.status = Some(status);
        self.current_step = event.get_u64(keys::STEP).unwrap_or(0) as usize;
        match event.get(keys::CONTEXT) {
            Some(Value::Object(context)) => self.context = context.clone(),
            Some(Value::Null) | None => {}
            Some(_) => return Err(malformed(event, keys::CONTEXT)),
        }
        if let Some(name) = event.get_str(keys::DEFINITION_NAME) {
            self.definition_name = Some(name.to_string());
        }
        if let Some(created) = event.get_time(keys::CREATED) {
            self.created_at = Some(created);
        }
        self.started_at = event.get_time(keys::STARTED).or(self.started_at);
        self.completed_at = event.get_time(keys::COMPLETED);
        Ok(())
    }

    fn apply_step(&mut self, event: &StoredEvent) -> Result<()> {
        let step_name = event
            .get_str(keys::STEP_NAME)
            .ok_or_else(|| malformed(event, keys::STEP_NAME))?
            .to_string();
        let started_at = event
            .get_time(keys::STARTED_AT)
            .ok_or_else(|| malformed(event, keys::STARTED_AT))?;
        let status = match event.get_str(keys::STEP_STATUS) {
            Some(s) => s.parse()?,
            None => status_for(event.event_type),
        };

        let mut entry = HistoryEntry::new(step_name.clone(), status, started_at);
        entry.completed_at = event.get_time(keys::COMPLETED_AT);
        entry.error = event
            .get_str(keys::ERROR_MESSAGE)
            .or_else(|| event.get_str(keys::ERROR))
            .map(str::to_string);
        entry.retry_attempt = event.get_u64(keys::RETRY_ATTEMPT).unwrap_or(0) as u32;

        match self.index.get(&(step_name.clone(), started_at)) {
            Some(&i) => self.history[i] = entry,
            None => {
                self.index.insert((step_name, started_at), self.history.len());
                self.history.push(entry);
            }
        }
        Ok(())
    }

    fn finish(self, saga_id: &SagaId, fallback_name: Option<&str>) -> Result<SagaState> {
        let status = self.status.ok_or_else(|| {
            Error::persistence(format!("stream {} has no state events", saga_id))
                .with_context("saga_id", saga_id.to_string())
        })?;
        let definition_name = self
            .definition_name
            .or_else(|| fallback_name.map(str::to_string))
            .ok_or_else(|| {
                Error::persistence(format!("stream {} does not name its definition", saga_id))
                    .with_context("saga_id", saga_id.to_string())
            })?;
        Ok(SagaState {
            id: saga_id.clone(),
            definition_name,
            status,
            current_step: self.current_step,
            context: self.context,
            history: self.history,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

fn status_for(event_type: EventType) -> StepStatus {
    match event_type {
        EventType::StepCompleted => StepStatus::Completed,
        EventType::StepFailed => StepStatus::Failed,
        EventType::StepCompensating => StepStatus::Compensating,
        EventType::StepCompensated => StepStatus::Compensated,
        _ => StepStatus::Running,
    }
}

fn malformed(event: &StoredEvent, key: &str) -> Error {
    Error::new(
        format!(
            "{} event at version {} has a missing or invalid '{}'",
            event.event_type, event.version, key
        ),
        ErrorKind::Codec,
    )
    .with_context("saga_id", event.stream_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SagaContext;
    use crate::port::{EventStoreError, SnapshotStoreError};
    use crate::saga::{SagaDefinition, SagaRuntime};
    use crate::step::SequentialStep;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("memory store error")]
    struct MemoryError;

    /// Minimal stream + snapshot store counting events handed out by reads.
    #[derive(Default)]
    struct MemoryStore {
        streams: Mutex<HashMap<SagaId, Vec<StoredEvent>>>,
        snapshots: Mutex<HashMap<SagaId, Snapshot>>,
        events_read: AtomicUsize,
    }

    #[async_trait]
    impl EventStore for MemoryStore {
        type Error = MemoryError;

        async fn append_events(
            &self,
            stream_id: &SagaId,
            expected_version: u64,
            events: Vec<StoredEvent>,
        ) -> std::result::Result<u64, EventStoreError<MemoryError>> {
            let mut streams = self.streams.lock();
            let stream = streams.entry(stream_id.clone()).or_default();
            let actual = stream.len() as u64;
            if actual != expected_version {
                return Err(EventStoreError::conflict(expected_version, actual));
            }
            for mut event in events {
                event.version = stream.len() as u64 + 1;
                stream.push(event);
            }
            Ok(stream.len() as u64)
        }

        async fn get_events(
            &self,
            stream_id: &SagaId,
            from_version: u64,
        ) -> std::result::Result<Vec<StoredEvent>, EventStoreError<MemoryError>> {
            let events: Vec<StoredEvent> = self
                .streams
                .lock()
                .get(stream_id)
                .map(|s| s.iter().filter(|e| e.version >= from_version).cloned().collect())
                .unwrap_or_default();
            self.events_read.fetch_add(events.len(), Ordering::SeqCst);
            Ok(events)
        }

        async fn get_events_by_type(
            &self,
            event_type: EventType,
            since: DateTime<Utc>,
        ) -> std::result::Result<Vec<StoredEvent>, EventStoreError<MemoryError>> {
            Ok(self
                .streams
                .lock()
                .values()
                .flatten()
                .filter(|e| e.event_type == event_type && e.timestamp >= since)
                .cloned()
                .collect())
        }

        async fn current_version(
            &self,
            stream_id: &SagaId,
        ) -> std::result::Result<u64, EventStoreError<MemoryError>> {
            Ok(self.streams.lock().get(stream_id).map_or(0, |s| s.len() as u64))
        }

        async fn get_last_event_of_type(
            &self,
            stream_id: &SagaId,
            event_type: EventType,
        ) -> std::result::Result<Option<StoredEvent>, EventStoreError<MemoryError>> {
            Ok(self.streams.lock().get(stream_id).and_then(|s| {
                s.iter().rev().find(|e| e.event_type == event_type).cloned()
            }))
        }
    }

    #[async_trait]
    impl SnapshotStore for MemoryStore {
        type Error = MemoryError;

        async fn get_snapshot(
            &self,
            saga_id: &SagaId,
        ) -> std::result::Result<Option<Snapshot>, SnapshotStoreError<MemoryError>> {
            Ok(self.snapshots.lock().get(saga_id).cloned())
        }

        async fn save_snapshot(
            &self,
            snapshot: &Snapshot,
        ) -> std::result::Result<(), SnapshotStoreError<MemoryError>> {
            self.snapshots
                .lock()
                .insert(snapshot.saga_id.clone(), snapshot.clone());
            Ok(())
        }
    }

    impl MemoryStore {
        fn stream(&self, saga_id: &SagaId) -> Vec<StoredEvent> {
            self.streams.lock().get(saga_id).cloned().unwrap_or_default()
        }
    }

    fn definition(steps: usize, fail_last: bool) -> SagaDefinition {
        let mut builder = SagaDefinition::builder("order");
        for i in 0..steps {
            let fail = fail_last && i + 1 == steps;
            builder = builder.step(
                SequentialStep::builder(format!("step_{}", i))
                    .execute(move |ctx| async move {
                        if fail {
                            return Err(Error::step_execution("boom"));
                        }
                        ctx.set(format!("done_{}", i), i as i64);
                        Ok(())
                    })
                    .compensate(move |ctx| async move {
                        ctx.remove(&format!("done_{}", i));
                        Ok(())
                    })
                    .build()
                    .unwrap(),
            );
        }
        builder.build().unwrap()
    }

    fn persistence(
        store: &Arc<MemoryStore>,
        registry: &Arc<SagaRegistry>,
    ) -> Arc<EventSourcedPersistence<MemoryStore, MemoryStore>> {
        Arc::new(EventSourcedPersistence::new(
            store.clone(),
            store.clone(),
            registry.clone(),
        ))
    }

    fn same_history(a: &[HistoryEntry], b: &[HistoryEntry]) -> bool {
        a.len() == b.len() && a.iter().all(|entry| b.contains(entry))
    }

    #[tokio::test]
    async fn test_round_trip_after_execution() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(3, false));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::with_correlation_id("c-1"));
        saga.context().set("customer", "alice");
        saga.execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await
            .unwrap();

        let loaded = persistence.load(saga.id()).await.unwrap();
        assert_eq!(loaded.status(), SagaStatus::Completed);
        assert_eq!(loaded.current_step(), saga.current_step());
        assert_eq!(loaded.context().to_map(), saga.context().to_map());
        assert!(same_history(&loaded.history(), &saga.history()));
        assert_eq!(
            persistence.get_status(saga.id()).await.unwrap(),
            SagaStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_only_tail_is_appended() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(4, false));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::new());
        saga.execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await
            .unwrap();

        // One save on start, two per step, one on completion.
        let saves = 1 + 2 * 4 + 1;
        let stream = store.stream(saga.id());
        let of_type = |t: EventType| stream.iter().filter(|e| e.event_type == t).count();
        assert_eq!(of_type(EventType::SagaStateCheckpoint), saves);
        assert_eq!(of_type(EventType::StepStarted), 4);
        assert_eq!(of_type(EventType::StepCompleted), 4);

        // Each entry goes out once while running and once when finished.
        let step_events = stream.iter().filter(|e| e.event_type.is_step_event()).count();
        assert_eq!(step_events, 2 * saga.history_len());
        assert_eq!(stream.len(), step_events + 2 * saves);

        for (i, event) in stream.iter().enumerate() {
            assert_eq!(event.version, i as u64 + 1);
        }
    }

    #[tokio::test]
    async fn test_running_entry_is_emitted_again_when_finished() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(1, false));
        let persistence = persistence(&store, &registry);

        let started = Utc::now();
        let mut running = SagaInstance::new(definition.clone(), SagaContext::new()).to_state();
        running.status = SagaStatus::Running;
        running
            .history
            .push(HistoryEntry::new("step_0", StepStatus::Running, started));
        let saga = SagaInstance::from_state(running.clone(), definition.clone()).unwrap();
        persistence.save(&saga).await.unwrap();

        let checkpoint = |store: &MemoryStore| {
            store
                .stream(saga.id())
                .iter()
                .rev()
                .find(|e| e.event_type == EventType::SagaStateCheckpoint)
                .and_then(|e| e.get_u64(keys::SAVED_HISTORY_COUNT))
        };
        assert_eq!(checkpoint(&store), Some(0));

        // Recover the position from state events alone.
        store.snapshots.lock().clear();
        {
            let mut streams = store.streams.lock();
            let stream = streams.get_mut(saga.id()).unwrap();
            stream.retain(|e| e.event_type != EventType::SagaStateCheckpoint);
            for (i, event) in stream.iter_mut().enumerate() {
                event.version = i as u64 + 1;
            }
        }

        let mut finished = running;
        finished.history[0].status = StepStatus::Completed;
        finished.history[0].completed_at = Some(started);
        let saga = SagaInstance::from_state(finished, definition).unwrap();
        persistence.save(&saga).await.unwrap();
        assert_eq!(checkpoint(&store), Some(1));

        let types: Vec<EventType> = store
            .stream(saga.id())
            .iter()
            .map(|e| e.event_type)
            .filter(|t| t.is_step_event())
            .collect();
        assert_eq!(types, vec![EventType::StepStarted, EventType::StepCompleted]);

        store.snapshots.lock().clear();
        let loaded = persistence.load(saga.id()).await.unwrap();
        assert_eq!(loaded.history_len(), 1);
        assert_eq!(loaded.history()[0].status, StepStatus::Completed);
    }

    #[tokio::test]
    async fn test_checkpoint_records_its_own_version() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(1, false));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::new());
        saga.execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await
            .unwrap();

        for checkpoint in store
            .stream(saga.id())
            .iter()
            .filter(|e| e.event_type == EventType::SagaStateCheckpoint)
        {
            assert_eq!(checkpoint.get_u64(keys::LAST_SAVED_VERSION), Some(checkpoint.version));
        }
    }

    #[tokio::test]
    async fn test_saves_read_only_recent_events() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(12, false));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::new());
        saga.execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await
            .unwrap();

        // Snapshot metadata is current after every save, so no save reads events.
        assert_eq!(store.events_read.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_position_recovered_without_snapshot() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(3, false));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::new());
        saga.execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await
            .unwrap();
        store.snapshots.lock().clear();

        let before = store.stream(saga.id()).len();
        persistence.save(&saga).await.unwrap();
        let stream = store.stream(saga.id());

        // Nothing new in history: just a state event and a checkpoint.
        assert_eq!(stream.len(), before + 2);
    }

    #[tokio::test]
    async fn test_position_recovered_from_state_events_only() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(2, false));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::new());
        saga.execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await
            .unwrap();

        // Simulate data written before checkpoints existed.
        store.snapshots.lock().clear();
        {
            let mut streams = store.streams.lock();
            let stream = streams.get_mut(saga.id()).unwrap();
            stream.retain(|e| e.event_type != EventType::SagaStateCheckpoint);
            for (i, event) in stream.iter_mut().enumerate() {
                event.version = i as u64 + 1;
            }
        }

        let before = store.stream(saga.id()).len();
        persistence.save(&saga).await.unwrap();
        assert_eq!(store.stream(saga.id()).len(), before + 2);
    }

    #[tokio::test]
    async fn test_load_falls_back_to_replay_on_corrupt_snapshot() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(2, true));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::new());
        let _ = saga
            .execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await;
        assert_eq!(saga.status(), SagaStatus::Compensated);

        {
            let mut snapshots = store.snapshots.lock();
            let snapshot = snapshots.get_mut(saga.id()).unwrap();
            assert!(snapshot.state.is_some());
            if let Some(state) = snapshot.state.as_mut() {
                state[1] ^= 0xff;
            }
        }

        let loaded = persistence.load(saga.id()).await.unwrap();
        assert_eq!(loaded.status(), SagaStatus::Compensated);
        assert!(same_history(&loaded.history(), &saga.history()));
    }

    #[tokio::test]
    async fn test_load_combines_snapshot_and_tail() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(2, false));
        let persistence = Arc::new(
            EventSourcedPersistence::new(store.clone(), store.clone(), registry.clone())
                .with_config(SnapshotConfig::new(1, true)),
        );

        let saga = SagaInstance::new(definition, SagaContext::new());
        saga.execute(&SagaRuntime::new().with_persistence(persistence.clone()))
            .await
            .unwrap();

        // Rewind the state blob to an older stream version.
        let older = {
            let stream = store.stream(saga.id());
            let version = stream
                .iter()
                .find(|e| e.event_type == EventType::SagaStateCheckpoint)
                .map(|e| e.version)
                .unwrap();
            let mut replay = Replay::default();
            for event in stream.iter().filter(|e| e.version <= version) {
                replay.apply(event).unwrap();
            }
            (replay.finish(saga.id(), None).unwrap(), version)
        };
        {
            let blob = JsonCodec::new().encode(&older.0).unwrap();
            let mut snapshots = store.snapshots.lock();
            let snapshot = snapshots.get_mut(saga.id()).unwrap();
            snapshot.set_state(blob, older.1, 0, true);
        }

        store.events_read.store(0, Ordering::SeqCst);
        let loaded = persistence.load(saga.id()).await.unwrap();
        let total = store.stream(saga.id()).len() as u64;

        assert_eq!(loaded.status(), SagaStatus::Completed);
        assert!(same_history(&loaded.history(), &saga.history()));
        assert_eq!(
            store.events_read.load(Ordering::SeqCst) as u64,
            total - older.1
        );
    }

    #[tokio::test]
    async fn test_load_errors() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let persistence = persistence(&store, &registry);

        let err = persistence.load(&SagaId::from("missing")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        // Persist with one registry, load with an empty one.
        let other = Arc::new(SagaRegistry::new());
        let definition = other.register(definition(1, false));
        let writer = EventSourcedPersistence::new(store.clone(), store.clone(), other);
        let saga = SagaInstance::new(definition, SagaContext::new());
        writer.save(&saga).await.unwrap();

        let err = persistence.load(saga.id()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DefinitionNotFound);
        assert!(err.to_string().contains("saga definition not found"));
    }

    #[tokio::test]
    async fn test_stale_writer_conflicts() {
        let store = Arc::new(MemoryStore::default());
        let registry = Arc::new(SagaRegistry::new());
        let definition = registry.register(definition(1, false));
        let persistence = persistence(&store, &registry);

        let saga = SagaInstance::new(definition, SagaContext::new());
        persistence.save(&saga).await.unwrap();

        let err = store
            .append_events(saga.id(), 0, vec![StoredEvent::builder(
                saga.id().clone(),
                EventType::SagaStateChanged,
            )
            .build()])
            .await
            .unwrap_err();
        let err: Error = err.into();
        assert_eq!(err.kind(), ErrorKind::Concurrency);
    }
}
