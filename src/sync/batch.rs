//! Batch sync orchestrator
//!
//! Collects pending changes for several data types into one `BatchRequest`,
//! sends it through the transport adapter and folds the per-type outcomes
//! back into the version ledger. Conflicts are returned to the caller
//! untouched; the orchestrator holds no resolution policy of its own.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::ledger::{SyncGuard, VersionLedger};
use super::retry::RetryPolicy;
use super::types::{BatchChange, BatchRequest, BatchResult, DataType, SyncOutcome, VersionedRecordSet};
use crate::codec::{Codec, CBOR_CONTENT_TYPE};
use crate::error::{SyncError, SyncResult};
use crate::transport::{
    build_request, parse_response_as, Method, RequestBody, Transport, WireRequest, WireResponse,
};

/// Endpoint of the batch exchange on the remote store
pub const BATCH_PATH: &str = "/api/v1/sync/batch";

/// Endpoint of a single data type's record set
pub fn record_path(data_type: DataType) -> String {
    format!("/api/v1/sync/records/{}", data_type)
}

/// Sends grouped changes and applies per-type results
#[derive(Clone)]
pub struct BatchSyncOrchestrator {
    transport: Arc<dyn Transport>,
    codec: Codec,
    ledger: VersionLedger,
    retry: RetryPolicy,
    device_id: Option<String>,
}

impl BatchSyncOrchestrator {
    pub fn new(transport: Arc<dyn Transport>, codec: Codec, ledger: VersionLedger) -> Self {
        Self {
            transport,
            codec,
            ledger,
            retry: RetryPolicy::default(),
            device_id: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn ledger(&self) -> &VersionLedger {
        &self.ledger
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn retry(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Read the server's current record set for one data type
    pub async fn fetch(&self, data_type: DataType) -> SyncResult<VersionedRecordSet> {
        if data_type.is_batch() {
            return Err(SyncError::UnsupportedType(format!(
                "{} has no record set",
                data_type
            )));
        }

        let request = WireRequest {
            method: Method::Get,
            data_type,
            headers: BTreeMap::from([("Accept".to_string(), CBOR_CONTENT_TYPE.to_string())]),
            body: Vec::new(),
        };
        let response = self.send_with_retry(&record_path(data_type), request).await?;

        parse_response_as(&self.codec, &response, data_type)
    }

    /// Submit changes for one or more data types in a single exchange.
    ///
    /// Only encoding errors are returned as `Err`. Transport and decode
    /// failures come back as a failed `BatchResult` with the ledger untouched.
    pub async fn sync_batch(&self, changes: Vec<BatchChange>) -> SyncResult<BatchResult> {
        if changes.is_empty() {
            return Ok(BatchResult::from_results(BTreeMap::new()));
        }
        if let Some(change) = changes.iter().find(|change| change.data_type.is_batch()) {
            return Err(SyncError::UnsupportedType(format!(
                "{} cannot be synced as a record",
                change.data_type
            )));
        }

        let data_types: BTreeSet<DataType> = changes.iter().map(|change| change.data_type).collect();
        let mut guard = self.ledger.begin(data_types.iter().copied()).await;

        let request = BatchRequest {
            changes,
            versions: guard.versions(),
            device_id: self.device_id.clone(),
        };
        let wire = build_request(&self.codec, DataType::Batch, &RequestBody::Batch(request))?;

        tracing::debug!(
            types = ?data_types,
            bytes = wire.body.len(),
            "Submitting sync batch"
        );

        let response = match self.send_with_retry(BATCH_PATH, wire).await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(types = ?data_types, error = %e, "Sync batch failed in transit");
                return Ok(BatchResult::failed(guard.versions(), &e.to_string()));
            }
        };

        let result: BatchResult = match parse_response_as(&self.codec, &response, DataType::Batch) {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(types = ?data_types, error = %e, "Unreadable sync batch response");
                return Ok(BatchResult::failed(guard.versions(), &e.to_string()));
            }
        };

        Ok(self.apply_results(&mut guard, result))
    }

    /// Send with the retry policy; every attempt reuses the same payload
    async fn send_with_retry(&self, path: &str, wire: WireRequest) -> SyncResult<WireResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let sent = tokio::time::timeout(
                self.retry.timeout,
                self.transport.send(path, wire.clone()),
            )
            .await;

            let result = match sent {
                Ok(response) => response.and_then(WireResponse::error_for_status),
                Err(_) => Err(SyncError::Timeout(self.retry.timeout.as_millis() as u64)),
            };

            match result {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_after(attempt);
                    tracing::debug!(
                        path,
                        attempt,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying sync request"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Fold per-type outcomes into the ledger and rebuild a consistent result
    fn apply_results(&self, guard: &mut SyncGuard, result: BatchResult) -> BatchResult {
        if !result.is_consistent() {
            tracing::warn!(
                conflicts = ?result.conflicts,
                "Server conflict list disagrees with outcomes, using outcomes"
            );
        }

        let mut results = result.results;
        let held: Vec<DataType> = guard.data_types().collect();

        for data_type in held {
            let snapshot_version = guard.snapshot(data_type).map(|entry| entry.version).unwrap_or(0);

            let Some(outcome) = results.get(&data_type) else {
                tracing::warn!(data_type = %data_type, "No outcome returned for data type");
                results.insert(
                    data_type,
                    SyncOutcome::rejected(
                        serde_json::Value::Null,
                        snapshot_version,
                        "missing from server response",
                    ),
                );
                continue;
            };

            let adopt = if outcome.conflict.is_some() {
                tracing::info!(
                    data_type = %data_type,
                    local_version = snapshot_version,
                    server_version = outcome.version,
                    "Conflict surfaced for resolution"
                );
                false
            } else if outcome.success {
                true
            } else if outcome.version < snapshot_version {
                // Local ahead of server: the server is the truth
                true
            } else {
                tracing::warn!(
                    data_type = %data_type,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "Data type failed to sync"
                );
                false
            };

            if adopt {
                if let Err(e) = guard.commit(data_type, outcome.version) {
                    tracing::error!(data_type = %data_type, error = %e, "Failed to adopt server version");
                }
            }
        }

        let unexpected: Vec<DataType> = results
            .keys()
            .filter(|data_type| guard.snapshot(**data_type).is_none())
            .copied()
            .collect();
        for data_type in unexpected {
            tracing::debug!(data_type = %data_type, "Ignoring outcome for a type not in this batch");
            results.remove(&data_type);
        }

        BatchResult::from_results(results)
    }
}
