//! Binary codec for sync payloads
//!
//! Payloads travel as a CBOR envelope `{t: tag, p: protocol, d: payload}`.
//! The payload is first run through the data type's reversible transform
//! (see [`transform`]) so that `decode(t, encode(t, v)) == v` for every
//! supported data type.

pub mod format;
pub mod transform;

use std::sync::Arc;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::sync::DataType;

pub use format::{detect_format, parse_stored_data, Format, StoredValue};
pub use transform::{KeyDictionary, Transform, TransformTable};

/// Wire-format generation spoken by this build
pub const PROTOCOL_VERSION: u32 = 1;

/// Content type advertised for binary envelopes
pub const CBOR_CONTENT_TYPE: &str = "application/cbor";

/// Content type of the textual fallback
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Wire-format generation spoken by this build
pub fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "t")]
    tag: String,
    #[serde(rename = "p")]
    protocol: u32,
    #[serde(rename = "d")]
    payload: Value,
}

/// CBOR encoder/decoder keyed by data type
///
/// Cheap to clone; the transform table is shared.
#[derive(Debug, Clone)]
pub struct Codec {
    table: Arc<TransformTable>,
}

impl Codec {
    pub fn new(table: TransformTable) -> Self {
        Self {
            table: Arc::new(table),
        }
    }

    pub fn protocol_version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// Compress `value` for `data_type` and encode it as an envelope
    pub fn encode(&self, data_type: DataType, value: &Value) -> SyncResult<Vec<u8>> {
        let transform = self
            .table
            .get(data_type)
            .ok_or_else(|| SyncError::UnsupportedType(data_type.to_string()))?;

        let envelope = Envelope {
            tag: data_type.as_str().to_string(),
            protocol: PROTOCOL_VERSION,
            payload: transform.compress(value.clone()),
        };

        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes)
            .map_err(|e| SyncError::Decode(format!("Failed to encode {}: {}", data_type, e)))?;
        Ok(bytes)
    }

    /// Encode any serializable value through its JSON data model
    pub fn encode_as<T: Serialize>(&self, data_type: DataType, value: &T) -> SyncResult<Vec<u8>> {
        let value = serde_json::to_value(value)
            .map_err(|e| SyncError::Parse(format!("Failed to serialize {}: {}", data_type, e)))?;
        self.encode(data_type, &value)
    }

    /// Decode an envelope and undo the data type's transform
    pub fn decode(&self, data_type: DataType, bytes: &[u8]) -> SyncResult<Value> {
        let envelope: Envelope = ciborium::from_reader(bytes)
            .map_err(|e| SyncError::Decode(format!("Malformed envelope: {}", e)))?;

        if envelope.tag != data_type.as_str() {
            return Err(SyncError::Decode(format!(
                "Envelope carries {}, expected {}",
                envelope.tag, data_type
            )));
        }

        if envelope.protocol != PROTOCOL_VERSION {
            tracing::debug!(
                data_type = %data_type,
                peer_protocol = envelope.protocol,
                local_protocol = PROTOCOL_VERSION,
                "Protocol generation mismatch"
            );
        }

        match self.table.get(data_type) {
            Some(transform) => Ok(transform.decompress(envelope.payload)),
            None => {
                tracing::debug!(data_type = %data_type, "No transform registered, decoding as-is");
                Ok(envelope.payload)
            }
        }
    }

    /// Decode an envelope into a concrete type
    pub fn decode_as<T: DeserializeOwned>(&self, data_type: DataType, bytes: &[u8]) -> SyncResult<T> {
        let value = self.decode(data_type, bytes)?;
        serde_json::from_value(value)
            .map_err(|e| SyncError::Decode(format!("Unexpected {} payload: {}", data_type, e)))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(TransformTable::standard())
    }
}
