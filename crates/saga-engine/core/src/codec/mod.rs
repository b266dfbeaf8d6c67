//! State codec traits and implementations.
//!
//! This module provides the [`StateCodec`] trait used to serialize the
//! [`SagaState`] stored in snapshot blobs:
//!
//! ```ignore
//! let blob = codec.encode(&instance.to_state())?;
//! let state = codec.decode(&blob)?;
//! ```
//!
//! Every blob starts with a one-byte format version; blobs with another
//! version are rejected.

use crate::error::{Error, ErrorKind};
use crate::saga::SagaState;

/// Current blob format version.
pub const STATE_FORMAT_VERSION: u8 = 1;

/// Error type for codec operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid codec version: expected {expected}, got {actual}")]
    InvalidVersion { expected: u8, actual: u8 },

    #[error("Empty state blob")]
    Empty,
}

impl CodecError {
    /// Create a version mismatch error.
    pub fn version_mismatch(expected: u8, actual: u8) -> Self {
        Self::InvalidVersion { expected, actual }
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        Error::from_source(err.to_string(), ErrorKind::Codec, err)
    }
}

/// Trait for encoding and decoding saga state blobs.
pub trait StateCodec: Send + Sync + 'static {
    /// Encode a state image to bytes.
    fn encode(&self, state: &SagaState) -> Result<Vec<u8>, CodecError>;

    /// Decode a state image from bytes.
    fn decode(&self, data: &[u8]) -> Result<SagaState, CodecError>;

    /// Return a unique identifier for this codec.
    fn codec_id(&self) -> &'static str;
}

// ============================================================================
// JSON Codec
// ============================================================================

/// JSON-based state codec.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    pub fn new() -> Self {
        Self
    }
}

impl StateCodec for JsonCodec {
    fn encode(&self, state: &SagaState) -> Result<Vec<u8>, CodecError> {
        let mut out = vec![STATE_FORMAT_VERSION];
        serde_json::to_writer(&mut out, state)?;
        Ok(out)
    }

    fn decode(&self, data: &[u8]) -> Result<SagaState, CodecError> {
        let (&version, body) = data.split_first().ok_or(CodecError::Empty)?;
        if version != STATE_FORMAT_VERSION {
            return Err(CodecError::version_mismatch(STATE_FORMAT_VERSION, version));
        }
        Ok(serde_json::from_slice(body)?)
    }

    fn codec_id(&self) -> &'static str {
        "json"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SagaContext;
    use crate::event::SagaId;
    use crate::saga::{HistoryEntry, SagaStatus, StepStatus};
    use chrono::Utc;

    fn state() -> SagaState {
        let ctx = SagaContext::with_correlation_id("corr-7");
        ctx.set("amount", 12.5);
        ctx.set("items", vec!["a".to_string(), "b".to_string()]);
        let now = Utc::now();
        SagaState {
            id: SagaId::from("saga-1"),
            definition_name: "order".to_string(),
            status: SagaStatus::Running,
            current_step: 1,
            context: ctx.to_map(),
            history: vec![HistoryEntry::new("reserve", StepStatus::Completed, now)],
            created_at: now,
            started_at: Some(now),
            completed_at: None,
        }
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec::new();
        let original = state();

        let encoded = codec.encode(&original).unwrap();
        assert_eq!(encoded[0], STATE_FORMAT_VERSION);

        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_rejects_unknown_version_and_garbage() {
        let codec = JsonCodec::new();
        let mut encoded = codec.encode(&state()).unwrap();
        encoded[0] = 9;
        assert!(matches!(
            codec.decode(&encoded),
            Err(CodecError::InvalidVersion { expected: 1, actual: 9 })
        ));

        assert!(matches!(codec.decode(&[]), Err(CodecError::Empty)));
        assert!(matches!(
            codec.decode(&[STATE_FORMAT_VERSION, b'{']),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_codec_error_kind() {
        let err: Error = CodecError::Empty.into();
        assert_eq!(err.kind(), ErrorKind::Codec);
    }
}
