//! Sync data types
//!
//! Defines types for multi-device synchronization including:
//! - Data type tags partitioning records and versions
//! - Versioned record sets
//! - Batch requests and per-type outcomes
//! - Conflicts and their resolutions

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SyncError;

/// Logical record category synced as one versioned unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// Completed focus-timer sessions (append-only)
    FocusRecords,
    /// Focus-timer settings object
    FocusSettings,
    /// User playlists
    Playlists,
    /// Played tracks (append-only)
    PlaybackHistory,
    /// Multi-type exchange carrying several data types at once
    Batch,
}

impl DataType {
    /// Every record-carrying data type (excludes `Batch`)
    pub const RECORDS: [DataType; 4] = [
        DataType::FocusRecords,
        DataType::FocusSettings,
        DataType::Playlists,
        DataType::PlaybackHistory,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::FocusRecords => "focus_records",
            DataType::FocusSettings => "focus_settings",
            DataType::Playlists => "playlists",
            DataType::PlaybackHistory => "playback_history",
            DataType::Batch => "batch",
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, DataType::Batch)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "focus_records" => Ok(DataType::FocusRecords),
            "focus_settings" => Ok(DataType::FocusSettings),
            "playlists" => Ok(DataType::Playlists),
            "playback_history" => Ok(DataType::PlaybackHistory),
            "batch" => Ok(DataType::Batch),
            other => Err(SyncError::UnsupportedType(other.to_string())),
        }
    }
}

/// Snapshot of one data type at a given version
///
/// Superseded, never mutated, by the next mutation or accepted server version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionedRecordSet {
    pub data_type: DataType,
    pub data: Value,
    /// Authoritative ordering; never compare timestamps instead
    pub version: u64,
    /// Display/debugging only
    pub timestamp: DateTime<Utc>,
}

impl VersionedRecordSet {
    pub fn new(data_type: DataType, data: Value, version: u64) -> Self {
        Self {
            data_type,
            data,
            version,
            timestamp: Utc::now(),
        }
    }
}

/// Types of sync operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Delete,
}

/// One pending change inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchChange {
    pub data_type: DataType,
    pub data: Value,
    pub operation: OperationType,
}

/// Request carrying changes for several data types in one exchange
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub changes: Vec<BatchChange>,
    /// Local version each change was made against
    #[serde(default)]
    pub versions: BTreeMap<DataType, u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

/// Single-record write body (`{data, version}`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordWrite {
    pub data: Value,
    pub version: u64,
}

/// A conflict between local and server copies of one data type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub data_type: DataType,
    pub local_data: Value,
    pub server_data: Value,
    /// Version the client believed current when it wrote
    pub local_version: u64,
    /// Version the server actually holds
    pub server_version: u64,
}

/// Result of reconciling one data type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub success: bool,
    pub data: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict: Option<Conflict>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncOutcome {
    /// Accepted (or already up-to-date) outcome
    pub fn accepted(data: Value, version: u64) -> Self {
        Self {
            success: true,
            data,
            version,
            timestamp: Utc::now(),
            conflict: None,
            error: None,
        }
    }

    /// Outcome that needs explicit resolution
    pub fn conflicted(conflict: Conflict) -> Self {
        Self {
            success: false,
            data: conflict.server_data.clone(),
            version: conflict.server_version,
            timestamp: Utc::now(),
            conflict: Some(conflict),
            error: None,
        }
    }

    /// Failed outcome carrying the server's current state
    pub fn rejected(data: Value, version: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            data,
            version,
            timestamp: Utc::now(),
            conflict: None,
            error: Some(error.into()),
        }
    }
}

/// Multi-type response to a `BatchRequest`
///
/// `conflicts` lists exactly the data types whose outcome carries a conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub success: bool,
    pub results: BTreeMap<DataType, SyncOutcome>,
    pub conflicts: Vec<DataType>,
}

impl BatchResult {
    /// Build a result whose `success` and `conflicts` are derived from the outcomes
    pub fn from_results(results: BTreeMap<DataType, SyncOutcome>) -> Self {
        let conflicts = results
            .iter()
            .filter(|(_, outcome)| outcome.conflict.is_some())
            .map(|(data_type, _)| *data_type)
            .collect();
        let success = results.values().all(|outcome| outcome.success);

        Self {
            success,
            results,
            conflicts,
        }
    }

    /// Every listed type failed for the same reason (transport, decode)
    pub fn failed(data_types: impl IntoIterator<Item = (DataType, u64)>, reason: &str) -> Self {
        let results = data_types
            .into_iter()
            .map(|(data_type, version)| {
                (data_type, SyncOutcome::rejected(Value::Null, version, reason))
            })
            .collect();
        Self::from_results(results)
    }

    /// Check `conflicts` against the per-type outcomes
    pub fn is_consistent(&self) -> bool {
        let listed_have_conflict = self.conflicts.iter().all(|data_type| {
            self.results
                .get(data_type)
                .is_some_and(|outcome| outcome.conflict.is_some())
        });
        let conflicted_are_listed = self
            .results
            .iter()
            .filter(|(_, outcome)| outcome.conflict.is_some())
            .all(|(data_type, _)| self.conflicts.contains(data_type));

        listed_have_conflict && conflicted_are_listed
    }
}

/// How to resolve a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Type-specific deterministic merge
    Merge,
    /// Keep the local version
    Local,
    /// Keep the server version
    Server,
    /// Use caller-supplied data; requires user confirmation
    Manual,
}

impl ResolutionStrategy {
    pub fn requires_confirmation(&self) -> bool {
        matches!(self, ResolutionStrategy::Manual)
    }
}

/// Outcome of resolving one conflict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResolution {
    pub data_type: DataType,
    pub strategy: ResolutionStrategy,
    pub resolved_data: Value,
    pub user_confirmed: bool,
    /// Server version the resolved data must be written against
    pub base_version: u64,
}

impl ConflictResolution {
    /// Whether the resolution may be applied
    pub fn is_final(&self) -> bool {
        !self.strategy.requires_confirmation() || self.user_confirmed
    }

    /// Whether the resolved data must be pushed back to the server
    pub fn requires_push(&self) -> bool {
        !matches!(self.strategy, ResolutionStrategy::Server)
    }
}
