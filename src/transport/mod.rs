//! Transport adapter
//!
//! Shapes outgoing requests into binary envelopes and turns responses back
//! into values. Requests always go out as CBOR and ask for CBOR back;
//! responses are decoded as CBOR only when their `Content-Type` says so,
//! otherwise they are parsed as JSON. Servers that never adopted the binary
//! envelope keep working unchanged.

mod http;

pub use self::http::HttpTransport;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::codec::{Codec, CBOR_CONTENT_TYPE};
use crate::error::{SyncError, SyncResult};
use crate::sync::{BatchRequest, DataType, RecordWrite};

/// Request payload shapes understood by the remote store
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// One `{data, version}` record
    Single(RecordWrite),
    /// Raw array of records
    Array(Vec<Value>),
    /// Multi-type batch with a `changes` array
    Batch(BatchRequest),
}

impl RequestBody {
    /// Classify an untyped payload by its shape
    pub fn from_value(value: Value) -> SyncResult<Self> {
        let has_changes = value.get("changes").is_some_and(Value::is_array);
        let is_record = value.get("data").is_some() && value.get("version").is_some();

        match value {
            Value::Array(items) => Ok(RequestBody::Array(items)),
            Value::Object(_) if has_changes => {
                serde_json::from_value(value)
                    .map(RequestBody::Batch)
                    .map_err(|e| SyncError::Parse(format!("Invalid batch body: {}", e)))
            }
            Value::Object(_) if is_record => {
                serde_json::from_value(value)
                    .map(RequestBody::Single)
                    .map_err(|e| SyncError::Parse(format!("Invalid record body: {}", e)))
            }
            other => Err(SyncError::Parse(format!(
                "Unrecognized request body shape: {}",
                shape_name(&other)
            ))),
        }
    }

    /// Data type the body is encoded under
    pub fn encoding_type(&self, data_type: DataType) -> DataType {
        match self {
            RequestBody::Batch(_) => DataType::Batch,
            RequestBody::Single(_) | RequestBody::Array(_) => data_type,
        }
    }
}

fn shape_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// HTTP method of a wire request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

/// Encoded request ready for a transport
#[derive(Debug, Clone, PartialEq)]
pub struct WireRequest {
    pub method: Method,
    pub data_type: DataType,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl WireRequest {
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }
}

/// Response as returned by a transport
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WireResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl WireResponse {
    /// Look up a header, ignoring ASCII case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn text(&self) -> SyncResult<&str> {
        std::str::from_utf8(&self.body)
            .map_err(|e| SyncError::Parse(format!("Response body is not UTF-8: {}", e)))
    }

    /// Map error statuses to sync errors; 5xx, 408 and 429 are transient
    pub fn error_for_status(self) -> SyncResult<Self> {
        if self.is_success() {
            return Ok(self);
        }
        let message = String::from_utf8_lossy(&self.body).into_owned();
        match self.status {
            408 | 429 | 500..=599 => Err(SyncError::Transport(format!(
                "Server returned {}: {}",
                self.status, message
            ))),
            status => Err(SyncError::Rejected(status, message)),
        }
    }
}

/// Whether a `Content-Type` header names the binary envelope.
///
/// Parameters after `;` are ignored and the media type is compared
/// ASCII-case-insensitively. A missing header is not binary.
pub fn is_binary_content_type(header: Option<&str>) -> bool {
    header
        .and_then(|value| value.split(';').next())
        .map(|media_type| media_type.trim().eq_ignore_ascii_case(CBOR_CONTENT_TYPE))
        .unwrap_or(false)
}

/// Whether an `Accept` header lists the binary envelope
pub fn accepts_binary(header: Option<&str>) -> bool {
    header
        .map(|value| value.split(',').any(|item| is_binary_content_type(Some(item))))
        .unwrap_or(false)
}

/// Encode a request body as a binary envelope with CBOR headers
pub fn build_request(codec: &Codec, data_type: DataType, body: &RequestBody) -> SyncResult<WireRequest> {
    let encoding_type = body.encoding_type(data_type);
    let bytes = match body {
        RequestBody::Single(record) => codec.encode_as(encoding_type, record)?,
        RequestBody::Array(items) => codec.encode(encoding_type, &Value::Array(items.clone()))?,
        RequestBody::Batch(batch) => codec.encode_as(encoding_type, batch)?,
    };

    let headers = BTreeMap::from([
        ("Content-Type".to_string(), CBOR_CONTENT_TYPE.to_string()),
        ("Accept".to_string(), CBOR_CONTENT_TYPE.to_string()),
    ]);

    Ok(WireRequest {
        method: Method::Post,
        data_type: encoding_type,
        headers,
        body: bytes,
    })
}

/// Parse a response body, falling back to JSON when it is not CBOR
pub fn parse_response(codec: &Codec, response: &WireResponse, data_type: DataType) -> SyncResult<Value> {
    if is_binary_content_type(response.content_type()) {
        return codec.decode(data_type, response.bytes());
    }

    serde_json::from_slice(response.bytes())
        .map_err(|e| SyncError::Parse(format!("Response for {} is not valid JSON: {}", data_type, e)))
}

/// Parse a response body into a concrete type
pub fn parse_response_as<T: DeserializeOwned>(
    codec: &Codec,
    response: &WireResponse,
    data_type: DataType,
) -> SyncResult<T> {
    let value = parse_response(codec, response, data_type)?;
    serde_json::from_value(value)
        .map_err(|e| SyncError::Parse(format!("Unexpected {} response: {}", data_type, e)))
}

/// Network primitive carrying wire requests to the remote store
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request to `path` and return the raw response
    async fn send(&self, path: &str, request: WireRequest) -> SyncResult<WireResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{BatchChange, OperationType};
    use serde_json::json;

    fn json_response(content_type: Option<&str>, body: &Value) -> WireResponse {
        WireResponse {
            status: 200,
            headers: content_type
                .map(|ct| vec![("content-type".to_string(), ct.to_string())])
                .unwrap_or_default(),
            body: serde_json::to_vec(body).unwrap(),
        }
    }

    #[test]
    fn test_build_single_record_request() {
        let codec = Codec::default();
        let body = RequestBody::from_value(json!({"data": {"focusDuration": 1500}, "version": 1})).unwrap();
        assert!(matches!(body, RequestBody::Single(_)));

        let request = build_request(&codec, DataType::FocusSettings, &body).unwrap();
        assert_eq!(request.headers["Content-Type"], "application/cbor");
        assert_eq!(request.headers["Accept"], "application/cbor");
        assert_eq!(request.data_type, DataType::FocusSettings);
        assert!(!request.body.is_empty());

        let decoded: RecordWrite = codec.decode_as(DataType::FocusSettings, &request.body).unwrap();
        assert_eq!(decoded.version, 1);
        assert_eq!(decoded.data, json!({"focusDuration": 1500}));
    }

    #[test]
    fn test_build_array_and_batch_requests() {
        let codec = Codec::default();

        let array = RequestBody::from_value(json!([{"id": "1", "mode": "focus"}])).unwrap();
        let request = build_request(&codec, DataType::FocusRecords, &array).unwrap();
        assert_eq!(
            codec.decode(DataType::FocusRecords, &request.body).unwrap(),
            json!([{"id": "1", "mode": "focus"}])
        );

        let batch = RequestBody::Batch(BatchRequest {
            changes: vec![BatchChange {
                data_type: DataType::Playlists,
                data: json!([]),
                operation: OperationType::Update,
            }],
            ..Default::default()
        });
        let request = build_request(&codec, DataType::Playlists, &batch).unwrap();
        assert_eq!(request.data_type, DataType::Batch);
        let decoded: BatchRequest = codec.decode_as(DataType::Batch, &request.body).unwrap();
        assert_eq!(decoded.changes.len(), 1);
    }

    #[test]
    fn test_request_shape_detection() {
        let batch = json!({"changes": [], "versions": {}});
        assert!(matches!(RequestBody::from_value(batch), Ok(RequestBody::Batch(_))));

        assert!(matches!(
            RequestBody::from_value(json!({"changes": "nope", "data": 1})),
            Err(SyncError::Parse(_))
        ));
        assert!(matches!(RequestBody::from_value(json!(42)), Err(SyncError::Parse(_))));
    }

    #[test]
    fn test_binary_content_type_rule() {
        assert!(is_binary_content_type(Some("application/cbor")));
        assert!(is_binary_content_type(Some("Application/CBOR; charset=binary")));
        assert!(is_binary_content_type(Some("  application/cbor ")));
        assert!(!is_binary_content_type(Some("application/json")));
        assert!(!is_binary_content_type(Some("application/cbor-seq")));
        assert!(!is_binary_content_type(None));

        assert!(accepts_binary(Some("application/json, application/cbor")));
        assert!(!accepts_binary(Some("*/*")));
    }

    #[test]
    fn test_json_response_is_returned_verbatim() {
        let codec = Codec::default();
        let body = json!({"type": "focus_records", "data": [], "version": 0});

        let response = json_response(Some("application/json"), &body);
        assert_eq!(parse_response(&codec, &response, DataType::FocusRecords).unwrap(), body);

        let response = json_response(None, &body);
        assert_eq!(parse_response(&codec, &response, DataType::FocusRecords).unwrap(), body);

        let response = json_response(Some("text/plain"), &body);
        assert_eq!(parse_response(&codec, &response, DataType::FocusRecords).unwrap(), body);
    }

    #[test]
    fn test_binary_response_is_decoded() {
        let codec = Codec::default();
        let value = json!({"focusDuration": 1500});
        let response = WireResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), "application/cbor".to_string())],
            body: codec.encode(DataType::FocusSettings, &value).unwrap(),
        };

        assert_eq!(response.header("CONTENT-TYPE"), Some("application/cbor"));
        assert_eq!(parse_response(&codec, &response, DataType::FocusSettings).unwrap(), value);
    }

    #[test]
    fn test_unparseable_responses() {
        let codec = Codec::default();
        let response = WireResponse {
            status: 200,
            headers: vec![],
            body: b"<html>".to_vec(),
        };
        assert!(matches!(
            parse_response(&codec, &response, DataType::Playlists),
            Err(SyncError::Parse(_))
        ));
    }

    #[test]
    fn test_error_status_mapping() {
        let response = |status| WireResponse {
            status,
            ..Default::default()
        };

        assert!(response(204).error_for_status().is_ok());
        assert!(response(503).error_for_status().unwrap_err().is_transient());
        assert!(response(429).error_for_status().unwrap_err().is_transient());
        assert!(matches!(
            response(400).error_for_status(),
            Err(SyncError::Rejected(400, _))
        ));
    }
}
