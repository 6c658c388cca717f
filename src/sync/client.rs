//! Sync client
//!
//! Ties the local replica, the version ledger and the batch orchestrator
//! together. Local mutations are written to the replica immediately and
//! queued; `sync` pushes everything queued in one batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use super::batch::BatchSyncOrchestrator;
use super::conflict::{ConflictResolver, UserInput};
use super::ledger::{VersionLedger, VersionRelation};
use super::replica::{LocalReplica, ReplicaStore};
use super::retry::RetryPolicy;
use super::types::{
    BatchChange, BatchResult, Conflict, ConflictResolution, DataType, OperationType,
    ResolutionStrategy, VersionedRecordSet,
};
use crate::codec::Codec;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{HttpTransport, Transport};

/// Client side of the sync protocol
pub struct SyncClient {
    replica: LocalReplica,
    orchestrator: BatchSyncOrchestrator,
    resolver: ConflictResolver,
    /// Latest unsent change per data type
    pending: Mutex<BTreeMap<DataType, BatchChange>>,
}

impl SyncClient {
    /// Open a client over a replica store, restoring adopted versions
    pub fn new(
        store: Arc<dyn ReplicaStore>,
        transport: Arc<dyn Transport>,
        codec: Codec,
    ) -> SyncResult<Self> {
        let replica = LocalReplica::new(store, codec.clone());
        let versions = replica.load_versions()?;
        tracing::debug!(types = versions.len(), "Restored sync versions");

        let ledger = VersionLedger::with_versions(versions);
        let orchestrator = BatchSyncOrchestrator::new(transport, codec, ledger);

        Ok(Self {
            replica,
            orchestrator,
            resolver: ConflictResolver::new(),
            pending: Mutex::new(BTreeMap::new()),
        })
    }

    /// Client talking HTTP to the configured remote store
    pub fn from_config(config: &SyncConfig, store: Arc<dyn ReplicaStore>) -> SyncResult<Self> {
        let transport = HttpTransport::new(&config.base_url, config.timeout())?;
        tracing::info!(
            base_url = transport.base_url(),
            device_id = %config.device_id,
            "Configured sync client"
        );

        Ok(Self::new(store, Arc::new(transport), Codec::default())?
            .with_retry(config.retry_policy())
            .with_device_id(config.device_id.clone()))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.orchestrator = self.orchestrator.with_retry(retry);
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.orchestrator = self.orchestrator.with_device_id(device_id);
        self
    }

    pub fn ledger(&self) -> &VersionLedger {
        self.orchestrator.ledger()
    }

    pub fn retry(&self) -> &RetryPolicy {
        self.orchestrator.retry()
    }

    pub fn device_id(&self) -> Option<&str> {
        self.orchestrator.device_id()
    }

    /// Current local copy of a data type
    pub fn load(&self, data_type: DataType) -> SyncResult<Option<Value>> {
        self.replica.load(data_type)
    }

    /// Data types with changes waiting to be pushed
    pub fn pending_types(&self) -> Vec<DataType> {
        self.pending.lock().keys().copied().collect()
    }

    /// Apply a local change and queue it for the next sync
    pub fn record_mutation(
        &self,
        data_type: DataType,
        data: Value,
        operation: OperationType,
    ) -> SyncResult<VersionedRecordSet> {
        if data_type.is_batch() {
            return Err(SyncError::UnsupportedType(format!(
                "{} cannot be mutated as a record",
                data_type
            )));
        }

        let data = match operation {
            OperationType::Delete => Value::Null,
            OperationType::Create | OperationType::Update => data,
        };

        let mut pending = self.pending.lock();
        self.replica.save(data_type, &data)?;
        let entry = self.ledger().record_mutation(data_type);
        pending.insert(
            data_type,
            BatchChange {
                data_type,
                data: data.clone(),
                operation,
            },
        );

        tracing::debug!(
            data_type = %data_type,
            version = entry.version,
            pending = entry.pending,
            "Recorded local mutation"
        );

        Ok(VersionedRecordSet::new(data_type, data, entry.version))
    }

    /// Push every queued change in one batch.
    ///
    /// Accepted data is written back to the replica. Conflicts are returned
    /// in the result and stay queued until resolved.
    pub async fn sync(&self) -> SyncResult<BatchResult> {
        let changes: Vec<BatchChange> = self.pending.lock().values().cloned().collect();
        if changes.is_empty() {
            return Ok(BatchResult::from_results(BTreeMap::new()));
        }

        let before = self.ledger().snapshot();
        let result = self.orchestrator.sync_batch(changes.clone()).await?;

        for (data_type, outcome) in &result.results {
            let Some(sent) = changes.iter().find(|change| change.data_type == *data_type) else {
                continue;
            };
            let base_version = before.get(data_type).map(|entry| entry.version).unwrap_or(0);

            // Local ahead of server: the orchestrator adopted the server's version
            let adopted_remote =
                !outcome.success && outcome.conflict.is_none() && outcome.version < base_version;

            if outcome.success || adopted_remote {
                let mut pending = self.pending.lock();
                if take_if_unchanged(&mut pending, sent) {
                    self.replica.save(*data_type, &outcome.data)?;
                } else {
                    tracing::debug!(
                        data_type = %data_type,
                        "Local data changed during sync, keeping it queued"
                    );
                }
            }
        }

        self.persist_versions()?;

        tracing::info!(
            success = result.success,
            types = result.results.len(),
            conflicts = result.conflicts.len(),
            "Sync finished"
        );
        Ok(result)
    }

    /// Resolve a conflict returned by `sync`
    pub fn resolve(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        user_input: Option<UserInput>,
    ) -> SyncResult<ConflictResolution> {
        self.resolver.resolve(conflict, strategy, user_input)
    }

    /// Apply a resolution locally.
    ///
    /// `server` adopts the server's data and version. Every other strategy
    /// stores the resolved data and queues it against the server's version.
    pub async fn apply_resolution(
        &self,
        conflict: &Conflict,
        resolution: &ConflictResolution,
    ) -> SyncResult<()> {
        let data_type = resolution.data_type;
        if conflict.data_type != data_type {
            return Err(SyncError::InvariantViolation(format!(
                "resolution for {} applied to a {} conflict",
                data_type, conflict.data_type
            )));
        }
        if !resolution.is_final() {
            return Err(SyncError::UnconfirmedResolution(data_type.to_string()));
        }

        let mut guard = self.ledger().begin([data_type]).await;
        {
            let mut pending = self.pending.lock();

            // The conflict was reported for the change still queued, or for none
            if let Some(current) = pending.get(&data_type) {
                if current.data != conflict.local_data {
                    tracing::warn!(
                        data_type = %data_type,
                        "Local data changed since the conflict was reported, not applying resolution"
                    );
                    return Err(SyncError::StaleConflict(data_type.to_string()));
                }
            }

            self.replica.save(data_type, &resolution.resolved_data)?;
            guard.commit(data_type, resolution.base_version)?;

            if resolution.requires_push() {
                self.ledger().record_mutation(data_type);
                pending.insert(
                    data_type,
                    BatchChange {
                        data_type,
                        data: resolution.resolved_data.clone(),
                        operation: OperationType::Update,
                    },
                );
            } else {
                pending.remove(&data_type);
            }
        }
        drop(guard);

        self.persist_versions()?;

        tracing::info!(
            data_type = %data_type,
            strategy = ?resolution.strategy,
            base_version = resolution.base_version,
            "Applied conflict resolution"
        );
        Ok(())
    }

    /// Read the server's copy of a data type and adopt it when nothing local is pending
    pub async fn fetch(
        &self,
        data_type: DataType,
    ) -> SyncResult<(VersionedRecordSet, VersionRelation)> {
        let record = self.orchestrator.fetch(data_type).await?;

        let mut guard = self.ledger().begin([data_type]).await;
        let relation = self.ledger().classify(data_type, record.version);

        match relation {
            VersionRelation::RemoteAhead => {
                self.replica.save(data_type, &record.data)?;
                guard.commit(data_type, record.version)?;
                drop(guard);
                self.persist_versions()?;
            }
            VersionRelation::UpToDate | VersionRelation::LocalAhead => {}
            VersionRelation::Diverged => {
                tracing::info!(
                    data_type = %data_type,
                    server_version = record.version,
                    "Server moved while local changes are pending"
                );
            }
        }

        Ok((record, relation))
    }

    fn persist_versions(&self) -> SyncResult<()> {
        let versions: BTreeMap<DataType, u64> = self
            .ledger()
            .snapshot()
            .into_iter()
            .map(|(data_type, entry)| (data_type, entry.version))
            .collect();
        self.replica.save_versions(&versions)
    }
}

/// Drop a queued change if it is still the one that was sent
fn take_if_unchanged(pending: &mut BTreeMap<DataType, BatchChange>, sent: &BatchChange) -> bool {
    match pending.get(&sent.data_type) {
        Some(current) if current == sent => {
            pending.remove(&sent.data_type);
            true
        }
        Some(_) => false,
        None => true,
    }
}
