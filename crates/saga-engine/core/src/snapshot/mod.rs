//! Saga snapshots.
//!
//! A [`Snapshot`] carries two independent pieces of information:
//!
//! - checkpoint metadata (`last_saved_version`, `saved_history_count`),
//!   refreshed on every save so writers can resolve the stream position
//!   with a bounded read;
//! - an optional serialized state blob taken at `state_version`, refreshed
//!   every [`SnapshotConfig::frequency`] completed history entries so loads
//!   only replay the events after it.
//!
//! ```ignore
//! // Without snapshot: O(n) events
//! let events = event_store.get_events(&saga_id, 0).await?;
//!
//! // With snapshot: O(m) events where m << n
//! let events = event_store.get_events(&saga_id, snapshot.state_version + 1).await?;
//! ```

use crate::event::SagaId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default number of completed history entries between state refreshes.
pub const DEFAULT_SNAPSHOT_FREQUENCY: usize = 10;

/// Configuration for snapshot behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    /// Completed history entries between state blob refreshes.
    /// Set to 0 to disable periodic state refreshes.
    pub frequency: usize,

    /// Whether to include a checksum for integrity verification.
    pub enable_checksum: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_SNAPSHOT_FREQUENCY,
            enable_checksum: true,
        }
    }
}

impl SnapshotConfig {
    /// Create a new configuration with custom values.
    pub fn new(frequency: usize, enable_checksum: bool) -> Self {
        Self {
            frequency,
            enable_checksum,
        }
    }

    /// Disable periodic state refreshes. Metadata is still maintained.
    pub fn disabled() -> Self {
        Self {
            frequency: 0,
            enable_checksum: false,
        }
    }

    /// Check if periodic state refreshes are enabled.
    pub fn is_enabled(&self) -> bool {
        self.frequency > 0
    }

    /// Whether a state refresh is due.
    pub fn is_due(&self, completed_entries: usize, completed_at_last_refresh: usize) -> bool {
        self.is_enabled()
            && completed_entries > completed_at_last_refresh
            && completed_entries - completed_at_last_refresh >= self.frequency
    }
}

/// Snapshot of one saga stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// The saga this snapshot belongs to.
    pub saga_id: SagaId,

    /// Definition the saga was built from.
    pub definition_name: String,

    /// Stream version after the most recent save.
    pub last_saved_version: u64,

    /// History entries persisted as of `last_saved_version`.
    pub saved_history_count: usize,

    /// Serialized saga state, if one has been taken.
    #[serde(default)]
    pub state: Option<Vec<u8>>,

    /// Stream version the state blob corresponds to.
    #[serde(default)]
    pub state_version: u64,

    /// Completed history entries when the state blob was taken.
    #[serde(default)]
    pub state_completed_count: usize,

    /// Checksum of the state blob.
    #[serde(default)]
    pub checksum: Option<SnapshotChecksum>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Create a metadata-only snapshot.
    pub fn new(saga_id: SagaId, definition_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            saga_id,
            definition_name: definition_name.into(),
            last_saved_version: 0,
            saved_history_count: 0,
            state: None,
            state_version: 0,
            state_completed_count: 0,
            checksum: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the state blob.
    pub fn set_state(
        &mut self,
        state: Vec<u8>,
        version: u64,
        completed_count: usize,
        with_checksum: bool,
    ) {
        self.checksum = with_checksum.then(|| SnapshotChecksum::from_data(&state));
        self.state = Some(state);
        self.state_version = version;
        self.state_completed_count = completed_count;
        self.updated_at = Utc::now();
    }

    /// Refresh the checkpoint metadata.
    pub fn set_checkpoint(&mut self, last_saved_version: u64, saved_history_count: usize) {
        self.last_saved_version = last_saved_version;
        self.saved_history_count = saved_history_count;
        self.updated_at = Utc::now();
    }

    /// State blob if present and intact.
    pub fn verified_state(&self) -> Option<&[u8]> {
        let state = self.state.as_deref()?;
        match &self.checksum {
            Some(checksum) if !checksum.verify(state) => None,
            _ => Some(state),
        }
    }

    /// Verify the snapshot integrity.
    pub fn verify_integrity(&self) -> bool {
        match (&self.state, &self.checksum) {
            (Some(state), Some(checksum)) => checksum.verify(state),
            _ => true,
        }
    }
}

/// A checksum for snapshot integrity verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotChecksum(pub [u8; 32]);

impl SnapshotChecksum {
    /// Create a checksum from data using SHA-256.
    pub fn from_data(data: &[u8]) -> Self {
        use sha2::Digest;
        let hash = sha2::Sha256::digest(data);
        let mut result = [0u8; 32];
        result.copy_from_slice(hash.as_slice());
        Self(result)
    }

    /// Verify data matches this checksum.
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::from_data(data) == *self
    }
}
