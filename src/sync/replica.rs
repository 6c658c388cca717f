//! Local replica persistence
//!
//! The client keeps its copy of every data type in a key/value store holding
//! opaque values. New writes are binary envelopes; values written by older
//! builds may still be JSON text and are read through the format detector.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use super::types::DataType;
use crate::codec::{parse_stored_data, Codec, StoredValue};
use crate::error::{SyncError, SyncResult};

const KEY_PREFIX: &str = "tempo";

/// Key/value persistence layer for the local replica
pub trait ReplicaStore: Send + Sync {
    fn get(&self, key: &str) -> Option<StoredValue>;
    fn set(&self, key: &str, value: StoredValue);
    fn remove(&self, key: &str) -> Option<StoredValue>;
}

/// In-memory store, shared between clones
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    values: Arc<RwLock<HashMap<String, StoredValue>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl ReplicaStore for MemoryStore {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.values.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: StoredValue) {
        self.values.write().insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<StoredValue> {
        self.values.write().remove(key)
    }
}

/// Storage key of a data type's records
pub fn record_key(data_type: DataType) -> String {
    format!("{}:{}", KEY_PREFIX, data_type)
}

fn versions_key() -> String {
    format!("{}:versions", KEY_PREFIX)
}

/// Typed view over a `ReplicaStore`
#[derive(Clone)]
pub struct LocalReplica {
    store: Arc<dyn ReplicaStore>,
    codec: Codec,
}

impl LocalReplica {
    pub fn new(store: Arc<dyn ReplicaStore>, codec: Codec) -> Self {
        Self { store, codec }
    }

    /// Read a data type, whatever format it was stored in
    pub fn load(&self, data_type: DataType) -> SyncResult<Option<Value>> {
        let raw = self.store.get(&record_key(data_type));
        parse_stored_data(&self.codec, data_type, raw.as_ref())
    }

    /// Store a data type as a binary envelope
    pub fn save(&self, data_type: DataType, data: &Value) -> SyncResult<()> {
        let bytes = self.codec.encode(data_type, data)?;
        self.store.set(&record_key(data_type), StoredValue::Binary(bytes));
        Ok(())
    }

    /// Last adopted server version per data type
    pub fn load_versions(&self) -> SyncResult<BTreeMap<DataType, u64>> {
        match self.store.get(&versions_key()) {
            None => Ok(BTreeMap::new()),
            Some(StoredValue::Text(text)) => serde_json::from_str(&text)
                .map_err(|e| SyncError::Parse(format!("Stored versions are corrupt: {}", e))),
            Some(StoredValue::Json(value)) => serde_json::from_value(value)
                .map_err(|e| SyncError::Parse(format!("Stored versions are corrupt: {}", e))),
            Some(StoredValue::Binary(_)) => Err(SyncError::Parse(
                "Stored versions are not text".to_string(),
            )),
        }
    }

    pub fn save_versions(&self, versions: &BTreeMap<DataType, u64>) -> SyncResult<()> {
        let text = serde_json::to_string(versions)
            .map_err(|e| SyncError::Parse(format!("Failed to serialize versions: {}", e)))?;
        self.store.set(&versions_key(), StoredValue::Text(text));
        Ok(())
    }
}
