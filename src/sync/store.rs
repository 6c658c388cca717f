//! Authoritative record store
//!
//! SQLite storage for the remote side of the protocol: one versioned record
//! set per data type, and the optimistic-concurrency check applied to every
//! incoming change.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Sqlite, SqlitePool, Transaction};

use super::types::{
    BatchChange, BatchRequest, BatchResult, Conflict, DataType, OperationType, RecordWrite,
    SyncOutcome, VersionedRecordSet,
};
use crate::error::{AppError, Result};

/// Repository for authoritative record sets
pub struct SyncRepository<'a> {
    pool: &'a SqlitePool,
}

#[derive(Debug, Clone)]
struct CurrentRecord {
    data: Value,
    version: u64,
}

impl<'a> SyncRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Current record set for a data type (version 0 and `null` if never written)
    pub async fn get(&self, data_type: DataType) -> Result<VersionedRecordSet> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT data_type, data, version, updated_at
            FROM sync_records
            WHERE data_type = ?
            "#,
        )
        .bind(data_type.as_str())
        .fetch_optional(self.pool)
        .await?;

        match row {
            Some(row) => row.into_record_set(),
            None => Ok(VersionedRecordSet::new(data_type, Value::Null, 0)),
        }
    }

    /// Current version of every data type that has been written
    pub async fn versions(&self) -> Result<BTreeMap<DataType, u64>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT data_type, version FROM sync_records ORDER BY data_type")
                .fetch_all(self.pool)
                .await?;

        rows.into_iter()
            .map(|(data_type, version)| Ok((data_type.parse::<DataType>()?, version as u64)))
            .collect()
    }

    /// Apply a single `{data, version}` write
    pub async fn apply_write(
        &self,
        data_type: DataType,
        write: RecordWrite,
        device_id: Option<String>,
    ) -> Result<SyncOutcome> {
        let request = BatchRequest {
            changes: vec![BatchChange {
                data_type,
                data: write.data,
                operation: OperationType::Update,
            }],
            versions: BTreeMap::from([(data_type, write.version)]),
            device_id,
        };

        let mut result = self.apply_batch(&request).await?;
        result
            .results
            .remove(&data_type)
            .ok_or_else(|| AppError::Internal(format!("No outcome for {}", data_type)))
    }

    /// Apply every change of a batch in one transaction.
    ///
    /// Changes for the same data type are applied in order; once one is
    /// accepted the next is checked against the new version.
    pub async fn apply_batch(&self, request: &BatchRequest) -> Result<BatchResult> {
        let mut tx = self.pool.begin().await?;
        let mut current: HashMap<DataType, CurrentRecord> = HashMap::new();
        let mut expected: BTreeMap<DataType, u64> = request.versions.clone();
        let mut outcomes: BTreeMap<DataType, SyncOutcome> = BTreeMap::new();

        for change in &request.changes {
            let data_type = change.data_type;
            if data_type.is_batch() {
                outcomes.insert(
                    data_type,
                    SyncOutcome::rejected(Value::Null, 0, "batch is not a record type"),
                );
                continue;
            }

            if !current.contains_key(&data_type) {
                let record = load_current(&mut tx, data_type).await?;
                current.insert(data_type, record);
            }
            let record = match current.get_mut(&data_type) {
                Some(record) => record,
                None => continue,
            };

            let client_version = expected.get(&data_type).copied().unwrap_or_else(|| {
                tracing::debug!(data_type = %data_type, "No client version sent, assuming 0");
                0
            });
            let incoming = match change.operation {
                OperationType::Delete => Value::Null,
                OperationType::Create | OperationType::Update => change.data.clone(),
            };

            let outcome = if client_version > record.version {
                tracing::warn!(
                    data_type = %data_type,
                    client_version,
                    server_version = record.version,
                    "Client version ahead of server"
                );
                SyncOutcome::rejected(
                    record.data.clone(),
                    record.version,
                    "client version ahead of server",
                )
            } else if record.data == incoming {
                expected.insert(data_type, record.version);
                SyncOutcome::accepted(record.data.clone(), record.version)
            } else if client_version == record.version {
                let version = record.version + 1;
                store_record(
                    &mut tx,
                    data_type,
                    &incoming,
                    version,
                    request.device_id.as_deref(),
                )
                .await?;
                record.data = incoming.clone();
                record.version = version;
                expected.insert(data_type, version);

                tracing::debug!(data_type = %data_type, version, "Accepted write");
                SyncOutcome::accepted(incoming, version)
            } else {
                tracing::info!(
                    data_type = %data_type,
                    client_version,
                    server_version = record.version,
                    "Write conflict"
                );
                SyncOutcome::conflicted(Conflict {
                    data_type,
                    local_data: incoming,
                    server_data: record.data.clone(),
                    local_version: client_version,
                    server_version: record.version,
                })
            };

            outcomes.insert(data_type, outcome);
        }

        tx.commit().await?;

        Ok(BatchResult::from_results(outcomes))
    }
}

async fn load_current(tx: &mut Transaction<'_, Sqlite>, data_type: DataType) -> Result<CurrentRecord> {
    let row: Option<(String, i64)> =
        sqlx::query_as("SELECT data, version FROM sync_records WHERE data_type = ?")
            .bind(data_type.as_str())
            .fetch_optional(&mut **tx)
            .await?;

    match row {
        Some((data, version)) => Ok(CurrentRecord {
            data: serde_json::from_str(&data)?,
            version: version as u64,
        }),
        None => Ok(CurrentRecord {
            data: Value::Null,
            version: 0,
        }),
    }
}

async fn store_record(
    tx: &mut Transaction<'_, Sqlite>,
    data_type: DataType,
    data: &Value,
    version: u64,
    device_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_records (data_type, data, version, device_id, updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(data_type) DO UPDATE SET
            data = excluded.data,
            version = excluded.version,
            device_id = excluded.device_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(data_type.as_str())
    .bind(serde_json::to_string(data)?)
    .bind(version as i64)
    .bind(device_id)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut **tx)
    .await?;

    Ok(())
}

#[derive(sqlx::FromRow)]
struct RecordRow {
    data_type: String,
    data: String,
    version: i64,
    updated_at: String,
}

impl RecordRow {
    fn into_record_set(self) -> Result<VersionedRecordSet> {
        let timestamp = DateTime::parse_from_rfc3339(&self.updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| AppError::Internal(format!("Corrupt timestamp: {}", e)))?;

        Ok(VersionedRecordSet {
            data_type: self.data_type.parse()?,
            data: serde_json::from_str(&self.data)?,
            version: self.version as u64,
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_pool;
    use serde_json::json;

    fn batch(changes: Vec<(DataType, Value)>, version: u64) -> BatchRequest {
        let versions = changes.iter().map(|(data_type, _)| (*data_type, version)).collect();
        BatchRequest {
            changes: changes
                .into_iter()
                .map(|(data_type, data)| BatchChange {
                    data_type,
                    data,
                    operation: OperationType::Update,
                })
                .collect(),
            versions,
            device_id: Some("device-1".to_string()),
        }
    }

    #[tokio::test]
    async fn test_empty_store() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);

        let record = repo.get(DataType::Playlists).await.unwrap();
        assert_eq!(record.version, 0);
        assert_eq!(record.data, Value::Null);
        assert!(repo.versions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_write_bumps_version() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);

        let result = repo
            .apply_batch(&batch(vec![(DataType::FocusSettings, json!({"focusDuration": 1500}))], 0))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.results[&DataType::FocusSettings].version, 1);

        let record = repo.get(DataType::FocusSettings).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.data, json!({"focusDuration": 1500}));
        assert_eq!(repo.versions().await.unwrap()[&DataType::FocusSettings], 1);
    }

    #[tokio::test]
    async fn test_resubmission_is_a_no_op() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);
        let data = json!([{"id": "1", "mode": "focus"}]);

        repo.apply_batch(&batch(vec![(DataType::FocusRecords, data.clone())], 0))
            .await
            .unwrap();
        let again = repo
            .apply_batch(&batch(vec![(DataType::FocusRecords, data)], 1))
            .await
            .unwrap();

        assert!(again.success);
        assert!(again.conflicts.is_empty());
        assert_eq!(again.results[&DataType::FocusRecords].version, 1);
        assert_eq!(repo.get(DataType::FocusRecords).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_stale_write_conflicts() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);

        // Both replicas start from version 3
        for version in 0..3 {
            repo.apply_batch(&batch(vec![(DataType::FocusSettings, json!({"focusDuration": version}))], version))
                .await
                .unwrap();
        }

        let a = repo
            .apply_batch(&batch(vec![(DataType::FocusSettings, json!({"focusDuration": 1500}))], 3))
            .await
            .unwrap();
        assert_eq!(a.results[&DataType::FocusSettings].version, 4);

        let b = repo
            .apply_batch(&batch(vec![(DataType::FocusSettings, json!({"focusDuration": 900}))], 3))
            .await
            .unwrap();
        assert!(!b.success);
        assert_eq!(b.conflicts, vec![DataType::FocusSettings]);

        let conflict = b.results[&DataType::FocusSettings].conflict.clone().unwrap();
        assert_eq!(conflict.local_version, 3);
        assert_eq!(conflict.server_version, 4);
        assert_eq!(conflict.server_data, json!({"focusDuration": 1500}));
        assert_eq!(conflict.local_data, json!({"focusDuration": 900}));

        assert_eq!(
            repo.get(DataType::FocusSettings).await.unwrap().data,
            json!({"focusDuration": 1500})
        );
    }

    #[tokio::test]
    async fn test_partial_batch() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);
        repo.apply_batch(&batch(vec![(DataType::Playlists, json!([{"id": "a"}]))], 0))
            .await
            .unwrap();

        let result = repo
            .apply_batch(&batch(
                vec![
                    (DataType::Playlists, json!([{"id": "b"}])),
                    (DataType::FocusRecords, json!([])),
                ],
                0,
            ))
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.conflicts, vec![DataType::Playlists]);
        assert!(result.results[&DataType::FocusRecords].success);
        assert!(result.is_consistent());
    }

    #[tokio::test]
    async fn test_sequential_changes_in_one_batch() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);

        let result = repo
            .apply_batch(&batch(
                vec![
                    (DataType::FocusRecords, json!([{"id": "1"}])),
                    (DataType::FocusRecords, json!([{"id": "1"}, {"id": "2"}])),
                ],
                0,
            ))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.results[&DataType::FocusRecords].version, 2);
    }

    #[tokio::test]
    async fn test_client_ahead_is_rejected() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);

        let result = repo
            .apply_batch(&batch(vec![(DataType::Playlists, json!([]))], 5))
            .await
            .unwrap();

        let outcome = &result.results[&DataType::Playlists];
        assert!(!outcome.success);
        assert!(outcome.conflict.is_none());
        assert_eq!(outcome.version, 0);
        assert!(result.conflicts.is_empty());
    }

    #[tokio::test]
    async fn test_delete_clears_data() {
        let pool = create_memory_pool().await.unwrap();
        let repo = SyncRepository::new(&pool);
        repo.apply_write(
            DataType::PlaybackHistory,
            RecordWrite {
                data: json!([{"songId": 1}]),
                version: 0,
            },
            None,
        )
        .await
        .unwrap();

        // Data sent along with a delete is ignored
        let mut request = batch(vec![(DataType::PlaybackHistory, json!([{"songId": 1}, {"songId": 2}]))], 1);
        request.changes[0].operation = OperationType::Delete;
        let result = repo.apply_batch(&request).await.unwrap();
        assert_eq!(result.results[&DataType::PlaybackHistory].version, 2);

        let record = repo.get(DataType::PlaybackHistory).await.unwrap();
        assert_eq!(record.data, Value::Null);
        assert_eq!(record.version, 2);
        assert_eq!(repo.versions().await.unwrap()[&DataType::PlaybackHistory], 2);

        // Deleting again is a no-op
        let again = repo.apply_batch(&request).await.unwrap();
        assert!(again.success);
        assert_eq!(again.results[&DataType::PlaybackHistory].version, 2);
    }
}
