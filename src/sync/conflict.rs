//! Conflict resolution
//!
//! Turns a [`Conflict`] plus a chosen strategy into a [`ConflictResolution`].
//! Merging is defined per data type (see [`MergeRule`]); when a rule cannot
//! produce a result without dropping data it fails and the caller falls back
//! to manual resolution.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use super::types::{Conflict, ConflictResolution, DataType, ResolutionStrategy};
use crate::error::{SyncError, SyncResult};

/// Deterministic merge rule for one data type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Arrays of `{id, ...}` items unioned by id
    UnionById,
    /// Objects merged field by field; differing fields go to the later `updatedAt`
    LatestFieldWins,
    /// No merge is defined
    Unsupported,
}

impl MergeRule {
    pub fn for_type(data_type: DataType) -> Self {
        match data_type {
            DataType::FocusRecords | DataType::PlaybackHistory | DataType::Playlists => {
                MergeRule::UnionById
            }
            DataType::FocusSettings => MergeRule::LatestFieldWins,
            DataType::Batch => MergeRule::Unsupported,
        }
    }
}

/// Caller-supplied data for manual resolution
#[derive(Debug, Clone, PartialEq)]
pub struct UserInput {
    pub data: Value,
    pub confirmed: bool,
}

impl UserInput {
    pub fn confirmed(data: Value) -> Self {
        Self {
            data,
            confirmed: true,
        }
    }

    pub fn unconfirmed(data: Value) -> Self {
        Self {
            data,
            confirmed: false,
        }
    }
}

/// Stateless resolver; merge rules come from [`MergeRule::for_type`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a conflict with the given strategy.
    ///
    /// The resolved data is always written against the server's version, so
    /// `local`, `merge` and `manual` advance the server past it.
    pub fn resolve(
        &self,
        conflict: &Conflict,
        strategy: ResolutionStrategy,
        user_input: Option<UserInput>,
    ) -> SyncResult<ConflictResolution> {
        let (resolved_data, user_confirmed) = match strategy {
            ResolutionStrategy::Local => (conflict.local_data.clone(), false),
            ResolutionStrategy::Server => (conflict.server_data.clone(), false),
            ResolutionStrategy::Merge => (self.merge(conflict)?, false),
            ResolutionStrategy::Manual => {
                let input = user_input
                    .ok_or_else(|| SyncError::MissingInput(conflict.data_type.to_string()))?;
                if !input.confirmed {
                    return Err(SyncError::UnconfirmedResolution(conflict.data_type.to_string()));
                }
                (input.data, true)
            }
        };

        if !strategy.requires_confirmation() {
            tracing::info!(
                data_type = %conflict.data_type,
                strategy = ?strategy,
                local_version = conflict.local_version,
                server_version = conflict.server_version,
                "Conflict resolved automatically"
            );
        }

        Ok(ConflictResolution {
            data_type: conflict.data_type,
            strategy,
            resolved_data,
            user_confirmed,
            base_version: conflict.server_version,
        })
    }

    /// Merge local and server data with the data type's rule
    pub fn merge(&self, conflict: &Conflict) -> SyncResult<Value> {
        match MergeRule::for_type(conflict.data_type) {
            MergeRule::UnionById => union_by_id(&conflict.server_data, &conflict.local_data),
            MergeRule::LatestFieldWins => {
                merge_fields(&conflict.server_data, &conflict.local_data)
            }
            MergeRule::Unsupported => Err(SyncError::Merge(format!(
                "No merge rule for {}",
                conflict.data_type
            ))),
        }
    }
}

/// Extract timestamp from JSON data if present
fn extract_timestamp(data: &Value) -> Option<DateTime<Utc>> {
    data.get("updatedAt")
        .or_else(|| data.get("updated_at"))
        .or_else(|| data.get("timestamp"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Server,
    Local,
}

/// Side whose value carries the strictly later timestamp
fn later_side(server: &Value, local: &Value, what: &str) -> SyncResult<Side> {
    match (extract_timestamp(server), extract_timestamp(local)) {
        (Some(s), Some(l)) if l > s => Ok(Side::Local),
        (Some(s), Some(l)) if s > l => Ok(Side::Server),
        (Some(_), Some(_)) => Err(SyncError::Merge(format!(
            "{} changed on both sides at the same time",
            what
        ))),
        _ => Err(SyncError::Merge(format!(
            "{} changed on both sides without timestamps",
            what
        ))),
    }
}

/// Item identity; a numeric id never matches a string id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ItemId {
    Text(String),
    Number(String),
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ItemId::Text(id) => write!(f, "\"{}\"", id),
            ItemId::Number(id) => write!(f, "{}", id),
        }
    }
}

fn item_id(item: &Value) -> SyncResult<ItemId> {
    match item.get("id") {
        Some(Value::String(id)) => Ok(ItemId::Text(id.clone())),
        Some(Value::Number(id)) => Ok(ItemId::Number(id.to_string())),
        _ => Err(SyncError::Merge("Item without a string or number id".to_string())),
    }
}

fn as_items<'a>(value: &'a Value, side: &str) -> SyncResult<&'a Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Err(SyncError::Merge(format!("{} data is missing", side))),
        _ => Err(SyncError::Merge(format!("{} data is not an array", side))),
    }
}

/// Union two id-keyed arrays; server order first, then local-only items
fn union_by_id(server: &Value, local: &Value) -> SyncResult<Value> {
    let server_items = as_items(server, "Server")?;
    let local_items = as_items(local, "Local")?;

    let mut merged: Vec<Value> = Vec::with_capacity(server_items.len() + local_items.len());
    let mut index: HashMap<ItemId, usize> = HashMap::with_capacity(merged.capacity());

    for item in server_items {
        let id = item_id(item)?;
        if index.contains_key(&id) {
            return Err(SyncError::Merge(format!("Duplicate id {} in server data", id)));
        }
        index.insert(id, merged.len());
        merged.push(item.clone());
    }

    for item in local_items {
        let id = item_id(item)?;
        match index.get(&id).copied() {
            None => {
                index.insert(id, merged.len());
                merged.push(item.clone());
            }
            Some(pos) if merged[pos] == *item => {}
            Some(pos) => {
                if later_side(&merged[pos], item, &format!("Item {}", id))? == Side::Local {
                    merged[pos] = item.clone();
                }
            }
        }
    }

    Ok(Value::Array(merged))
}

/// Field-level merge of two objects
fn merge_fields(server: &Value, local: &Value) -> SyncResult<Value> {
    let (server_map, local_map) = match (server, local) {
        (Value::Object(s), Value::Object(l)) => (s, l),
        _ => {
            return Err(SyncError::Merge(
                "Settings merge needs an object on both sides".to_string(),
            ))
        }
    };

    let mut merged: Map<String, Value> = server_map.clone();
    let mut local_wins: Option<bool> = None;

    for (key, local_value) in local_map {
        match server_map.get(key) {
            None => {
                merged.insert(key.clone(), local_value.clone());
            }
            Some(server_value) if server_value == local_value => {}
            Some(_) => {
                let take_local = match local_wins {
                    Some(decided) => decided,
                    None => {
                        let decided = later_side(server, local, "Settings")? == Side::Local;
                        local_wins = Some(decided);
                        decided
                    }
                };
                if take_local {
                    merged.insert(key.clone(), local_value.clone());
                }
            }
        }
    }

    Ok(Value::Object(merged))
}
