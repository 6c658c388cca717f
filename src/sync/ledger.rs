//! Version ledger
//!
//! Tracks, per data type, the last server version this replica adopted and
//! how many local mutations are waiting to be pushed. The ledger is the only
//! mutable state shared by the sync core.
//!
//! At most one sync per data type is in flight: [`VersionLedger::begin`]
//! hands out a [`SyncGuard`] holding per-type locks and a version snapshot.
//! Only [`SyncGuard::commit`] changes the ledger, so a sync that is dropped
//! half way (cancelled, timed out, failed to parse) leaves it untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::types::DataType;
use crate::error::{SyncError, SyncResult};

/// Ledger state for one data type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Last server version adopted
    pub version: u64,
    /// Local mutations since that version
    pub pending: u64,
}

impl LedgerEntry {
    pub fn is_dirty(&self) -> bool {
        self.pending > 0
    }
}

/// Relationship between a local entry and the server's version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionRelation {
    /// Same version, nothing pending
    UpToDate,
    /// Same version, local changes pending
    LocalAhead,
    /// Server moved, nothing pending locally
    RemoteAhead,
    /// Server moved and local changes are pending
    Diverged,
}

impl VersionRelation {
    /// Classify an entry against a server version.
    ///
    /// A local version above the server's is an invariant violation; it is
    /// logged and the server is treated as ahead.
    pub fn classify(data_type: DataType, entry: LedgerEntry, server_version: u64) -> Self {
        if entry.version > server_version {
            tracing::warn!(
                data_type = %data_type,
                local_version = entry.version,
                server_version,
                "{}",
                SyncError::InvariantViolation("local version ahead of server".to_string())
            );
            return VersionRelation::RemoteAhead;
        }

        match (entry.version == server_version, entry.is_dirty()) {
            (true, false) => VersionRelation::UpToDate,
            (true, true) => VersionRelation::LocalAhead,
            (false, false) => VersionRelation::RemoteAhead,
            (false, true) => VersionRelation::Diverged,
        }
    }
}

/// Per-data-type version counters with in-flight serialization
#[derive(Clone, Default)]
pub struct VersionLedger {
    inner: Arc<LedgerInner>,
}

#[derive(Default)]
struct LedgerInner {
    entries: RwLock<HashMap<DataType, LedgerEntry>>,
    in_flight: Mutex<HashMap<DataType, Arc<AsyncMutex<()>>>>,
}

impl VersionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a ledger from previously adopted versions
    pub fn with_versions(versions: impl IntoIterator<Item = (DataType, u64)>) -> Self {
        let ledger = Self::new();
        {
            let mut entries = ledger.inner.entries.write();
            for (data_type, version) in versions {
                entries.insert(data_type, LedgerEntry { version, pending: 0 });
            }
        }
        ledger
    }

    pub fn entry(&self, data_type: DataType) -> LedgerEntry {
        self.inner
            .entries
            .read()
            .get(&data_type)
            .copied()
            .unwrap_or_default()
    }

    pub fn version(&self, data_type: DataType) -> u64 {
        self.entry(data_type).version
    }

    /// Current state of every tracked data type
    pub fn snapshot(&self) -> BTreeMap<DataType, LedgerEntry> {
        self.inner
            .entries
            .read()
            .iter()
            .map(|(data_type, entry)| (*data_type, *entry))
            .collect()
    }

    /// Data types with local changes waiting to be pushed
    pub fn pending_types(&self) -> Vec<DataType> {
        let mut types: Vec<DataType> = self
            .inner
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.is_dirty())
            .map(|(data_type, _)| *data_type)
            .collect();
        types.sort();
        types
    }

    /// Note an accepted local mutation
    pub fn record_mutation(&self, data_type: DataType) -> LedgerEntry {
        let mut entries = self.inner.entries.write();
        let entry = entries.entry(data_type).or_default();
        entry.pending += 1;
        *entry
    }

    pub fn classify(&self, data_type: DataType, server_version: u64) -> VersionRelation {
        VersionRelation::classify(data_type, self.entry(data_type), server_version)
    }

    /// Wait until no other sync holds any of `data_types`, then snapshot them.
    ///
    /// Locks are taken in a fixed order so overlapping batches cannot deadlock.
    pub async fn begin(&self, data_types: impl IntoIterator<Item = DataType>) -> SyncGuard {
        let ordered: BTreeSet<DataType> = data_types.into_iter().collect();

        let mut permits = Vec::with_capacity(ordered.len());
        for data_type in &ordered {
            let lock = {
                let mut in_flight = self.inner.in_flight.lock();
                in_flight.entry(*data_type).or_default().clone()
            };
            permits.push(lock.lock_owned().await);
        }

        let snapshot = ordered
            .iter()
            .map(|data_type| (*data_type, self.entry(*data_type)))
            .collect();

        SyncGuard {
            ledger: self.clone(),
            snapshot,
            _permits: permits,
        }
    }
}

/// Exclusive hold on some data types for the duration of one sync
pub struct SyncGuard {
    ledger: VersionLedger,
    snapshot: BTreeMap<DataType, LedgerEntry>,
    _permits: Vec<OwnedMutexGuard<()>>,
}

impl SyncGuard {
    /// Versions to send with the request
    pub fn versions(&self) -> BTreeMap<DataType, u64> {
        self.snapshot
            .iter()
            .map(|(data_type, entry)| (*data_type, entry.version))
            .collect()
    }

    pub fn data_types(&self) -> impl Iterator<Item = DataType> + '_ {
        self.snapshot.keys().copied()
    }

    pub fn snapshot(&self, data_type: DataType) -> Option<LedgerEntry> {
        self.snapshot.get(&data_type).copied()
    }

    /// Adopt the server's version for a data type.
    ///
    /// Mutations counted in the snapshot are considered delivered (or
    /// discarded); mutations recorded while the sync was in flight stay pending.
    pub fn commit(&mut self, data_type: DataType, server_version: u64) -> SyncResult<()> {
        let snapshot = self.snapshot.get(&data_type).copied().ok_or_else(|| {
            SyncError::InvariantViolation(format!("{} is not held by this sync", data_type))
        })?;

        if server_version < snapshot.version {
            tracing::warn!(
                data_type = %data_type,
                local_version = snapshot.version,
                server_version,
                "{}",
                SyncError::InvariantViolation("local version ahead of server, adopting server".to_string())
            );
        }

        let mut entries = self.ledger.inner.entries.write();
        let entry = entries.entry(data_type).or_default();
        entry.version = server_version;
        entry.pending = entry.pending.saturating_sub(snapshot.pending);

        let committed = LedgerEntry {
            version: server_version,
            pending: 0,
        };
        self.snapshot.insert(data_type, committed);

        tracing::debug!(
            data_type = %data_type,
            version = server_version,
            pending = entry.pending,
            "Adopted server version"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_classification() {
        let clean = LedgerEntry { version: 3, pending: 0 };
        let dirty = LedgerEntry { version: 3, pending: 2 };
        let dt = DataType::FocusSettings;

        assert_eq!(VersionRelation::classify(dt, clean, 3), VersionRelation::UpToDate);
        assert_eq!(VersionRelation::classify(dt, dirty, 3), VersionRelation::LocalAhead);
        assert_eq!(VersionRelation::classify(dt, clean, 4), VersionRelation::RemoteAhead);
        assert_eq!(VersionRelation::classify(dt, dirty, 4), VersionRelation::Diverged);
        assert_eq!(VersionRelation::classify(dt, clean, 2), VersionRelation::RemoteAhead);
    }

    #[test]
    fn test_mutations_do_not_move_version() {
        let ledger = VersionLedger::with_versions([(DataType::Playlists, 5)]);
        ledger.record_mutation(DataType::Playlists);
        let entry = ledger.record_mutation(DataType::Playlists);

        assert_eq!(entry, LedgerEntry { version: 5, pending: 2 });
        assert_eq!(ledger.pending_types(), vec![DataType::Playlists]);
        assert_eq!(ledger.classify(DataType::Playlists, 5), VersionRelation::LocalAhead);
    }

    #[tokio::test]
    async fn test_commit_adopts_server_version() {
        let ledger = VersionLedger::new();
        let mut observed = Vec::new();

        for server_version in 1..=5 {
            ledger.record_mutation(DataType::FocusRecords);
            let mut guard = ledger.begin([DataType::FocusRecords]).await;
            guard.commit(DataType::FocusRecords, server_version).unwrap();
            drop(guard);
            observed.push(ledger.version(DataType::FocusRecords));
        }

        assert_eq!(observed, vec![1, 2, 3, 4, 5]);
        assert!(ledger.pending_types().is_empty());
    }

    #[tokio::test]
    async fn test_dropped_sync_leaves_ledger_untouched() {
        let ledger = VersionLedger::with_versions([(DataType::FocusSettings, 3)]);
        ledger.record_mutation(DataType::FocusSettings);

        let guard = ledger.begin([DataType::FocusSettings]).await;
        assert_eq!(guard.versions()[&DataType::FocusSettings], 3);
        drop(guard);

        assert_eq!(
            ledger.entry(DataType::FocusSettings),
            LedgerEntry { version: 3, pending: 1 }
        );
    }

    #[tokio::test]
    async fn test_mutation_during_flight_stays_pending() {
        let ledger = VersionLedger::new();
        ledger.record_mutation(DataType::Playlists);

        let mut guard = ledger.begin([DataType::Playlists]).await;
        ledger.record_mutation(DataType::Playlists);
        guard.commit(DataType::Playlists, 1).unwrap();

        assert_eq!(ledger.entry(DataType::Playlists), LedgerEntry { version: 1, pending: 1 });
    }

    #[tokio::test]
    async fn test_second_sync_waits_for_first() {
        let ledger = VersionLedger::new();
        let first = ledger.begin([DataType::Playlists, DataType::FocusRecords]).await;

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            ledger.begin([DataType::FocusRecords]),
        )
        .await;
        assert!(blocked.is_err());

        let unrelated = tokio::time::timeout(
            Duration::from_millis(50),
            ledger.begin([DataType::FocusSettings]),
        )
        .await;
        assert!(unrelated.is_ok());

        drop(first);
        let second = tokio::time::timeout(
            Duration::from_millis(50),
            ledger.begin([DataType::FocusRecords]),
        )
        .await;
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn test_commit_of_unheld_type_fails() {
        let ledger = VersionLedger::new();
        let mut guard = ledger.begin([DataType::Playlists]).await;
        assert!(matches!(
            guard.commit(DataType::FocusSettings, 1),
            Err(SyncError::InvariantViolation(_))
        ));
    }
}
