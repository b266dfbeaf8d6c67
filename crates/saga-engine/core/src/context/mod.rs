//! # Saga Context
//!
//! [`SagaContext`] is the shared key/value store handed to every step of a
//! saga, together with a correlation id and execution metadata.
//!
//! The context is a cheap-to-clone handle: clones share the same underlying
//! state, guarded by a reader/writer lock. Getters take the read lock,
//! setters take the write lock. [`SagaContext::metadata`] returns a deep copy,
//! so metadata can only change through the explicit setters.
//!
//! Values are a tagged union ([`ContextValue`]) with coercing accessors:
//! `get_int` accepts integer and float values, `get_float` accepts both too.

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Key used for the data section in [`SagaContext::to_map`].
pub const DATA_KEY: &str = "data";
/// Key used for the correlation id in [`SagaContext::to_map`].
pub const CORRELATION_ID_KEY: &str = "correlation_id";
/// Key used for the metadata section in [`SagaContext::to_map`].
pub const METADATA_KEY: &str = "metadata";

// ============================================================================
// ContextValue
// ============================================================================

/// A value stored in the saga context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
    /// Any other JSON document, carried without interpretation.
    Opaque(Value),
}

impl ContextValue {
    /// Convert to a JSON value, preserving the int/float distinction.
    pub fn to_json(&self) -> Value {
        match self {
            ContextValue::Bool(b) => Value::Bool(*b),
            ContextValue::Int(i) => Value::from(*i),
            ContextValue::Float(f) => Value::from(*f),
            ContextValue::String(s) => Value::String(s.clone()),
            ContextValue::StringList(list) => {
                Value::Array(list.iter().cloned().map(Value::String).collect())
            }
            ContextValue::Opaque(v) => v.clone(),
        }
    }

    /// Rebuild a context value from JSON.
    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Bool(b) => ContextValue::Bool(b),
            Value::String(s) => ContextValue::String(s),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ContextValue::Int(i)
                } else if let Some(f) = n.as_f64().filter(|_| n.is_f64()) {
                    ContextValue::Float(f)
                } else {
                    // u64 beyond i64::MAX
                    ContextValue::Opaque(Value::Number(n))
                }
            }
            Value::Array(items) if items.iter().all(Value::is_string) => {
                ContextValue::StringList(
                    items
                        .into_iter()
                        .filter_map(|v| match v {
                            Value::String(s) => Some(s),
                            _ => None,
                        })
                        .collect(),
                )
            }
            other => ContextValue::Opaque(other),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ContextValue::Bool(_) => "bool",
            ContextValue::Int(_) => "int",
            ContextValue::Float(_) => "float",
            ContextValue::String(_) => "string",
            ContextValue::StringList(_) => "string_list",
            ContextValue::Opaque(_) => "opaque",
        }
    }
}

impl From<bool> for ContextValue {
    fn from(v: bool) -> Self {
        ContextValue::Bool(v)
    }
}

impl From<i64> for ContextValue {
    fn from(v: i64) -> Self {
        ContextValue::Int(v)
    }
}

impl From<i32> for ContextValue {
    fn from(v: i32) -> Self {
        ContextValue::Int(v as i64)
    }
}

impl From<u32> for ContextValue {
    fn from(v: u32) -> Self {
        ContextValue::Int(v as i64)
    }
}

impl From<f64> for ContextValue {
    fn from(v: f64) -> Self {
        ContextValue::Float(v)
    }
}

impl From<String> for ContextValue {
    fn from(v: String) -> Self {
        ContextValue::String(v)
    }
}

impl From<&str> for ContextValue {
    fn from(v: &str) -> Self {
        ContextValue::String(v.to_string())
    }
}

impl From<Vec<String>> for ContextValue {
    fn from(v: Vec<String>) -> Self {
        ContextValue::StringList(v)
    }
}

impl From<Value> for ContextValue {
    fn from(v: Value) -> Self {
        ContextValue::from_json(v)
    }
}

// ============================================================================
// SagaMetadata
// ============================================================================

/// Execution metadata attached to a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaMetadata {
    /// Budget for the whole saga execution.
    #[serde(default, with = "duration_millis")]
    pub timeout: Option<Duration>,
    /// Saga-wide retry policy override.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub custom: HashMap<String, ContextValue>,
}

impl SagaMetadata {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            timeout: None,
            retry_policy: None,
            created_at: now,
            updated_at: now,
            custom: HashMap::new(),
        }
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

// ============================================================================
// SagaContext
// ============================================================================

#[derive(Debug)]
struct ContextState {
    data: HashMap<String, ContextValue>,
    correlation_id: String,
    metadata: SagaMetadata,
}

/// Shared, thread-safe saga context.
#[derive(Debug, Clone)]
pub struct SagaContext {
    inner: Arc<RwLock<ContextState>>,
}

impl Default for SagaContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SagaContext {
    /// Create an empty context with a generated correlation id.
    pub fn new() -> Self {
        Self::with_correlation_id(uuid::Uuid::new_v4().to_string())
    }

    /// Create an empty context with the given correlation id.
    pub fn with_correlation_id(correlation_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                data: HashMap::new(),
                correlation_id: correlation_id.into(),
                metadata: SagaMetadata::new(Utc::now()),
            })),
        }
    }

    pub fn correlation_id(&self) -> String {
        self.inner.read().correlation_id.clone()
    }

    // ---- data ----

    pub fn get(&self, key: &str) -> Option<ContextValue> {
        self.inner.read().data.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().data.contains_key(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.inner.read().data.get(key) {
            Some(ContextValue::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    /// Integer value; floats are truncated.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.inner.read().data.get(key) {
            Some(ContextValue::Int(i)) => Some(*i),
            Some(ContextValue::Float(f)) if f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// Float value; integers are widened.
    pub fn get_float(&self, key: &str) -> Option<f64> {
        match self.inner.read().data.get(key) {
            Some(ContextValue::Float(f)) => Some(*f),
            Some(ContextValue::Int(i)) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.inner.read().data.get(key) {
            Some(ContextValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        match self.inner.read().data.get(key) {
            Some(ContextValue::StringList(list)) => Some(list.clone()),
            _ => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        let mut state = self.inner.write();
        state.data.insert(key.into(), value.into());
        state.metadata.updated_at = Utc::now();
    }

    pub fn remove(&self, key: &str) -> Option<ContextValue> {
        let mut state = self.inner.write();
        let removed = state.data.remove(key);
        if removed.is_some() {
            state.metadata.updated_at = Utc::now();
        }
        removed
    }

    /// Snapshot of all data entries.
    pub fn data(&self) -> HashMap<String, ContextValue> {
        self.inner.read().data.clone()
    }

    // ---- metadata ----

    /// Deep copy of the metadata.
    pub fn metadata(&self) -> SagaMetadata {
        self.inner.read().metadata.clone()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.inner.read().metadata.timeout
    }

    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        self.inner.read().metadata.retry_policy.clone()
    }

    pub fn set_timeout(&self, timeout: Option<Duration>) {
        let mut state = self.inner.write();
        state.metadata.timeout = timeout;
        state.metadata.updated_at = Utc::now();
    }

    pub fn set_retry_policy(&self, policy: Option<RetryPolicy>) {
        let mut state = self.inner.write();
        state.metadata.retry_policy = policy;
        state.metadata.updated_at = Utc::now();
    }

    pub fn set_custom(&self, key: impl Into<String>, value: impl Into<ContextValue>) {
        let mut state = self.inner.write();
        state.metadata.custom.insert(key.into(), value.into());
        state.metadata.updated_at = Utc::now();
    }

    pub fn get_custom(&self, key: &str) -> Option<ContextValue> {
        self.inner.read().metadata.custom.get(key).cloned()
    }

    // ---- serialization ----

    /// Serialize the context to a JSON map with `data`, `correlation_id`
    /// and `metadata` sections.
    pub fn to_map(&self) -> Map<String, Value> {
        let state = self.inner.read();

        let data: Map<String, Value> = state
            .data
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();

        let mut map = Map::new();
        map.insert(DATA_KEY.to_string(), Value::Object(data));
        map.insert(
            CORRELATION_ID_KEY.to_string(),
            Value::String(state.correlation_id.clone()),
        );
        map.insert(
            METADATA_KEY.to_string(),
            metadata_to_json(&state.metadata),
        );
        map
    }

    /// Rebuild a context from [`SagaContext::to_map`] output.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let correlation_id = match map.get(CORRELATION_ID_KEY) {
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(Error::validation(
                    CORRELATION_ID_KEY,
                    "correlation id must be a string",
                ));
            }
            None => uuid::Uuid::new_v4().to_string(),
        };

        let data = match map.get(DATA_KEY) {
            Some(Value::Object(entries)) => entries
                .iter()
                .map(|(k, v)| (k.clone(), ContextValue::from_json(v.clone())))
                .collect(),
            Some(Value::Null) | None => HashMap::new(),
            Some(_) => return Err(Error::validation(DATA_KEY, "data must be an object")),
        };

        let metadata = match map.get(METADATA_KEY) {
            Some(Value::Null) | None => SagaMetadata::new(Utc::now()),
            Some(value) => metadata_from_json(value)?,
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(ContextState {
                data,
                correlation_id,
                metadata,
            })),
        })
    }

    /// Independent copy that does not share state with `self`.
    pub fn deep_clone(&self) -> Self {
        let state = self.inner.read();
        Self {
            inner: Arc::new(RwLock::new(ContextState {
                data: state.data.clone(),
                correlation_id: state.correlation_id.clone(),
                metadata: state.metadata.clone(),
            })),
        }
    }
}

// Custom values go through ContextValue::to_json so ints and floats keep their tags.
fn metadata_to_json(metadata: &SagaMetadata) -> Value {
    let custom: Map<String, Value> = metadata
        .custom
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();

    serde_json::json!({
        "timeout": metadata.timeout.map(|d| d.as_millis() as u64),
        "retry_policy": metadata.retry_policy,
        "created_at": metadata.created_at,
        "updated_at": metadata.updated_at,
        "custom": custom,
    })
}

fn metadata_from_json(value: &Value) -> Result<SagaMetadata> {
    let obj = value
        .as_object()
        .ok_or_else(|| Error::validation(METADATA_KEY, "metadata must be an object"))?;

    let parse_time = |key: &str| -> Result<DateTime<Utc>> {
        match obj.get(key) {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| Error::validation(key, &e.to_string())),
            None => Ok(Utc::now()),
        }
    };

    let retry_policy = match obj.get("retry_policy") {
        Some(Value::Null) | None => None,
        Some(v) => Some(
            serde_json::from_value(v.clone())
                .map_err(|e| Error::validation("retry_policy", &e.to_string()))?,
        ),
    };

    let custom = match obj.get("custom") {
        Some(Value::Object(entries)) => entries
            .iter()
            .map(|(k, v)| (k.clone(), ContextValue::from_json(v.clone())))
            .collect(),
        _ => HashMap::new(),
    };

    Ok(SagaMetadata {
        timeout: obj
            .get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_millis),
        retry_policy,
        created_at: parse_time("created_at")?,
        updated_at: parse_time("updated_at")?,
        custom,
    })
}
