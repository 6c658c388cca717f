//! Format detection for stored and received values
//!
//! Older replicas and servers hold plain JSON; newer ones hold binary
//! envelopes. Values of unknown provenance are classified here and routed to
//! the matching parser.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Codec;
use crate::error::{SyncError, SyncResult};
use crate::sync::DataType;

/// Encoding family of a value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Binary,
    Text,
}

/// Opaque value as held by a persistence layer
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Byte buffer, normally a binary envelope
    Binary(Vec<u8>),
    /// Serialized JSON text
    Text(String),
    /// Already-structured value
    Json(Value),
}

impl From<Vec<u8>> for StoredValue {
    fn from(bytes: Vec<u8>) -> Self {
        StoredValue::Binary(bytes)
    }
}

impl From<String> for StoredValue {
    fn from(text: String) -> Self {
        StoredValue::Text(text)
    }
}

impl From<Value> for StoredValue {
    fn from(value: Value) -> Self {
        StoredValue::Json(value)
    }
}

/// Classify a value; missing and structured values are textual
pub fn detect_format(value: Option<&StoredValue>) -> Format {
    match value {
        Some(StoredValue::Binary(_)) => Format::Binary,
        Some(StoredValue::Text(_)) | Some(StoredValue::Json(_)) | None => Format::Text,
    }
}

/// Parse a stored value of unknown provenance.
///
/// Returns `None` for a missing or null value. Parse failures are returned
/// to the caller, which decides on any default.
pub fn parse_stored_data(
    codec: &Codec,
    data_type: DataType,
    raw: Option<&StoredValue>,
) -> SyncResult<Option<Value>> {
    let raw = match raw {
        None | Some(StoredValue::Json(Value::Null)) => return Ok(None),
        Some(raw) => raw,
    };

    match raw {
        StoredValue::Binary(bytes) => codec.decode(data_type, bytes).map(Some),
        StoredValue::Text(text) => serde_json::from_str(text)
            .map(Some)
            .map_err(|e| SyncError::Parse(format!("Stored {} is not valid JSON: {}", data_type, e))),
        StoredValue::Json(value) => Ok(Some(value.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format(Some(&StoredValue::Binary(vec![0xa1]))), Format::Binary);
        assert_eq!(detect_format(Some(&StoredValue::Binary(Vec::new()))), Format::Binary);
        assert_eq!(detect_format(None), Format::Text);
        assert_eq!(detect_format(Some(&StoredValue::Json(Value::Null))), Format::Text);
        assert_eq!(detect_format(Some(&StoredValue::Json(json!({"a": 1})))), Format::Text);
        assert_eq!(detect_format(Some(&StoredValue::Text("[]".into()))), Format::Text);
    }

    #[test]
    fn test_parse_missing_values() {
        let codec = Codec::default();
        assert_eq!(parse_stored_data(&codec, DataType::Playlists, None).unwrap(), None);
        assert_eq!(
            parse_stored_data(&codec, DataType::Playlists, Some(&Value::Null.into())).unwrap(),
            None
        );
    }

    #[test]
    fn test_parse_binary_and_legacy_json() {
        let codec = Codec::default();
        let value = json!({"focusDuration": 1500});

        let binary: StoredValue = codec.encode(DataType::FocusSettings, &value).unwrap().into();
        assert_eq!(
            parse_stored_data(&codec, DataType::FocusSettings, Some(&binary)).unwrap(),
            Some(value.clone())
        );

        let legacy: StoredValue = value.to_string().into();
        assert_eq!(
            parse_stored_data(&codec, DataType::FocusSettings, Some(&legacy)).unwrap(),
            Some(value.clone())
        );

        let structured: StoredValue = value.clone().into();
        assert_eq!(
            parse_stored_data(&codec, DataType::FocusSettings, Some(&structured)).unwrap(),
            Some(value)
        );
    }

    #[test]
    fn test_parse_failures_propagate() {
        let codec = Codec::default();

        let broken: StoredValue = "{not json".to_string().into();
        assert!(matches!(
            parse_stored_data(&codec, DataType::FocusSettings, Some(&broken)),
            Err(SyncError::Parse(_))
        ));

        let garbage = StoredValue::Binary(vec![0xff, 0xff]);
        assert!(matches!(
            parse_stored_data(&codec, DataType::FocusSettings, Some(&garbage)),
            Err(SyncError::Decode(_))
        ));
    }
}
