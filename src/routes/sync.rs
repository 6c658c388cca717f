//! Sync API endpoints
//!
//! Request bodies are decoded as binary envelopes when sent with
//! `Content-Type: application/cbor` and as JSON otherwise. Responses follow
//! the `Accept` header the same way.

use std::collections::BTreeMap;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::codec::{Codec, CBOR_CONTENT_TYPE, PROTOCOL_VERSION};
use crate::error::{AppError, Result, SyncError};
use crate::state::AppState;
use crate::sync::{BatchRequest, DataType, RecordWrite, SyncRepository};
use crate::transport::{accepts_binary, is_binary_content_type};

/// Create the sync router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/batch", post(sync_batch))
        .route("/records/:data_type", get(get_records).put(put_records))
        .route("/status", get(get_status))
        .route("/protocol", get(get_protocol))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProtocolInfo {
    protocol_version: u32,
}

/// Apply a multi-type batch
async fn sync_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let request: BatchRequest = decode_body(state.codec(), DataType::Batch, &headers, &body)?;

    tracing::debug!(
        changes = request.changes.len(),
        device_id = request.device_id.as_deref().unwrap_or("unknown"),
        "Received sync batch"
    );

    let repo = SyncRepository::new(state.db());
    let result = repo.apply_batch(&request).await?;

    if !result.conflicts.is_empty() {
        tracing::info!(conflicts = ?result.conflicts, "Sync batch has conflicts");
    }

    respond(state.codec(), DataType::Batch, &headers, &result)
}

/// Current record set of one data type
async fn get_records(
    State(state): State<AppState>,
    Path(data_type): Path<String>,
    headers: HeaderMap,
) -> Result<Response> {
    let data_type = record_type(&data_type)?;

    let repo = SyncRepository::new(state.db());
    let record = repo.get(data_type).await?;

    respond(state.codec(), data_type, &headers, &record)
}

/// Single `{data, version}` write
async fn put_records(
    State(state): State<AppState>,
    Path(data_type): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let data_type = record_type(&data_type)?;
    let write: RecordWrite = decode_body(state.codec(), data_type, &headers, &body)?;

    let repo = SyncRepository::new(state.db());
    let outcome = repo.apply_write(data_type, write, None).await?;

    respond(state.codec(), data_type, &headers, &outcome)
}

/// Server version of every written data type
async fn get_status(State(state): State<AppState>, headers: HeaderMap) -> Result<Response> {
    let repo = SyncRepository::new(state.db());
    let versions: BTreeMap<DataType, u64> = repo.versions().await?;

    respond(state.codec(), DataType::Batch, &headers, &versions)
}

async fn get_protocol() -> Json<ProtocolInfo> {
    Json(ProtocolInfo {
        protocol_version: PROTOCOL_VERSION,
    })
}

fn record_type(raw: &str) -> Result<DataType> {
    let data_type: DataType = raw.parse()?;
    if data_type.is_batch() {
        return Err(SyncError::UnsupportedType(format!("{} has no record set", data_type)).into());
    }
    Ok(data_type)
}

fn decode_body<T: DeserializeOwned>(
    codec: &Codec,
    data_type: DataType,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<T> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok());

    if is_binary_content_type(content_type) {
        return Ok(codec.decode_as(data_type, body)?);
    }

    serde_json::from_slice(body)
        .map_err(|e| AppError::Sync(SyncError::Parse(format!("Invalid {} body: {}", data_type, e))))
}

fn respond<T: Serialize>(
    codec: &Codec,
    data_type: DataType,
    headers: &HeaderMap,
    value: &T,
) -> Result<Response> {
    let accept = headers.get(header::ACCEPT).and_then(|value| value.to_str().ok());

    if accepts_binary(accept) {
        let bytes = codec.encode_as(data_type, value)?;
        return Ok(([(header::CONTENT_TYPE, CBOR_CONTENT_TYPE)], bytes).into_response());
    }

    Ok(Json(value).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use crate::routes;
    use crate::sync::{BatchChange, BatchResult, OperationType, SyncOutcome, VersionedRecordSet};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn app() -> Router {
        let pool = create_memory_pool().await.unwrap();
        routes::app(AppState::new(pool))
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn batch_request(data_type: DataType, data: Value, version: u64) -> BatchRequest {
        BatchRequest {
            changes: vec![BatchChange {
                data_type,
                data,
                operation: OperationType::Update,
            }],
            versions: BTreeMap::from([(data_type, version)]),
            device_id: Some("device-a".to_string()),
        }
    }

    #[tokio::test]
    async fn test_cbor_batch_round_trip() {
        let app = app().await;
        let codec = Codec::default();
        let request = batch_request(DataType::FocusSettings, json!({"focusDuration": 1500}), 0);

        let response = app
            .oneshot(
                Request::post("/api/v1/sync/batch")
                    .header("Content-Type", "Application/CBOR; charset=binary")
                    .header("Accept", "application/json, application/cbor")
                    .body(Body::from(codec.encode_as(DataType::Batch, &request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            CBOR_CONTENT_TYPE
        );

        let result: BatchResult = codec
            .decode_as(DataType::Batch, &body_bytes(response).await)
            .unwrap();
        assert!(result.success);
        assert_eq!(result.results[&DataType::FocusSettings].version, 1);
    }

    #[tokio::test]
    async fn test_json_batch_gets_json_reply() {
        let app = app().await;
        let request = batch_request(DataType::FocusRecords, json!([{"id": "r1"}]), 0);

        let response = app
            .oneshot(
                Request::post("/api/v1/sync/batch")
                    .header("Content-Type", "application/json")
                    .body(Body::from(serde_json::to_vec(&request).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let result: BatchResult = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(result.success);
        assert!(result.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_cbor_is_bad_request() {
        let app = app().await;

        let response = app
            .oneshot(
                Request::post("/api/v1/sync/batch")
                    .header("Content-Type", CBOR_CONTENT_TYPE)
                    .body(Body::from(vec![0xff, 0x00, 0x13]))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["error"], "parse_error");
    }

    #[tokio::test]
    async fn test_put_then_get_record() {
        let app = app().await;
        let codec = Codec::default();
        let write = RecordWrite {
            data: json!([{"id": "p1", "name": "Deep Work", "songs": []}]),
            version: 0,
        };

        let response = app
            .clone()
            .oneshot(
                Request::put("/api/v1/sync/records/playlists")
                    .header("Content-Type", CBOR_CONTENT_TYPE)
                    .body(Body::from(codec.encode_as(DataType::Playlists, &write).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let outcome: SyncOutcome = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.version, 1);

        let response = app
            .oneshot(
                Request::get("/api/v1/sync/records/playlists")
                    .header("Accept", CBOR_CONTENT_TYPE)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let record: VersionedRecordSet = codec
            .decode_as(DataType::Playlists, &body_bytes(response).await)
            .unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.data, write.data);
    }

    #[tokio::test]
    async fn test_unknown_and_batch_types_are_rejected() {
        let app = app().await;

        for path in ["/api/v1/sync/records/bookmarks", "/api/v1/sync/records/batch"] {
            let response = app
                .clone()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }
    }

    #[tokio::test]
    async fn test_status_and_protocol() {
        let app = app().await;

        let response = app
            .clone()
            .oneshot(Request::get("/api/v1/sync/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(status, json!({}));

        let response = app
            .oneshot(Request::get("/api/v1/sync/protocol").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let info: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(info, json!({"protocolVersion": 1}));
    }

    #[tokio::test]
    async fn test_health() {
        let app = app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["database"], "ok");
    }
}
