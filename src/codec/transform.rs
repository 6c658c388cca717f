//! Per-data-type payload transforms
//!
//! Before a payload is CBOR-encoded its object keys are shortened through a
//! key dictionary chosen by data type. The transform is applied recursively
//! and is exactly reversible:
//!
//! - a dictionary key is replaced by its alias
//! - a key that is itself an alias, or starts with `~`, gets a `~` prefix
//! - every other key is left alone
//!
//! Expanding strips one `~` or swaps an alias back.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::sync::DataType;

const ESCAPE: char = '~';

/// Bidirectional long-name / alias table for object keys
#[derive(Debug, Clone, Default)]
pub struct KeyDictionary {
    to_alias: HashMap<String, String>,
    to_name: HashMap<String, String>,
}

impl KeyDictionary {
    /// Build a dictionary from `(name, alias)` pairs.
    ///
    /// Pairs whose alias is empty, starts with `~`, or is already taken are skipped.
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut dictionary = Self::default();
        for (name, alias) in pairs {
            if alias.is_empty()
                || alias.starts_with(ESCAPE)
                || dictionary.to_name.contains_key(*alias)
                || dictionary.to_alias.contains_key(*name)
            {
                tracing::warn!(name, alias, "Skipping ambiguous key alias");
                continue;
            }
            dictionary.to_alias.insert(name.to_string(), alias.to_string());
            dictionary.to_name.insert(alias.to_string(), name.to_string());
        }
        dictionary
    }

    pub fn len(&self) -> usize {
        self.to_alias.len()
    }

    pub fn is_empty(&self) -> bool {
        self.to_alias.is_empty()
    }

    fn shorten_key(&self, key: String) -> String {
        if let Some(alias) = self.to_alias.get(&key) {
            return alias.clone();
        }
        if key.starts_with(ESCAPE) || self.to_name.contains_key(&key) {
            format!("{ESCAPE}{key}")
        } else {
            key
        }
    }

    fn expand_key(&self, key: String) -> String {
        if let Some(stripped) = key.strip_prefix(ESCAPE) {
            return stripped.to_string();
        }
        match self.to_name.get(&key) {
            Some(name) => name.clone(),
            None => key,
        }
    }

    fn rewrite(&self, value: Value, key_fn: &dyn Fn(&Self, String) -> String) -> Value {
        match value {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, child) in map {
                    out.insert(key_fn(self, key), self.rewrite(child, key_fn));
                }
                Value::Object(out)
            }
            Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.rewrite(item, key_fn)).collect())
            }
            other => other,
        }
    }
}

/// Reversible payload transform applied around the binary encoding
#[derive(Debug, Clone)]
pub enum Transform {
    /// Payload is encoded as-is
    Identity,
    /// Object keys are shortened through a dictionary
    Keys(KeyDictionary),
}

impl Transform {
    pub fn compress(&self, value: Value) -> Value {
        match self {
            Transform::Identity => value,
            Transform::Keys(dictionary) => dictionary.rewrite(value, &KeyDictionary::shorten_key),
        }
    }

    pub fn decompress(&self, value: Value) -> Value {
        match self {
            Transform::Identity => value,
            Transform::Keys(dictionary) => dictionary.rewrite(value, &KeyDictionary::expand_key),
        }
    }
}

/// Data type -> transform mapping handed to the codec
#[derive(Debug, Clone, Default)]
pub struct TransformTable {
    rules: HashMap<DataType, Transform>,
}

impl TransformTable {
    /// Empty table; every data type is unsupported until registered
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the transform for a data type
    pub fn with(mut self, data_type: DataType, transform: Transform) -> Self {
        self.rules.insert(data_type, transform);
        self
    }

    pub fn get(&self, data_type: DataType) -> Option<&Transform> {
        self.rules.get(&data_type)
    }

    pub fn supports(&self, data_type: DataType) -> bool {
        self.rules.contains_key(&data_type)
    }

    /// Dictionaries for every built-in data type
    pub fn standard() -> Self {
        Self::new()
            .with(
                DataType::FocusRecords,
                Transform::Keys(KeyDictionary::new(&[
                    ("data", "D"),
                    ("version", "V"),
                    ("mode", "m"),
                    ("startTime", "st"),
                    ("endTime", "et"),
                    ("duration", "du"),
                    ("completed", "c"),
                    ("updatedAt", "ua"),
                ])),
            )
            .with(
                DataType::FocusSettings,
                Transform::Keys(KeyDictionary::new(&[
                    ("data", "D"),
                    ("version", "V"),
                    ("focusDuration", "fd"),
                    ("shortBreakDuration", "sb"),
                    ("longBreakDuration", "lb"),
                    ("longBreakInterval", "li"),
                    ("autoStartBreaks", "ab"),
                    ("autoStartFocus", "af"),
                    ("soundEnabled", "se"),
                    ("updatedAt", "ua"),
                ])),
            )
            .with(
                DataType::Playlists,
                Transform::Keys(KeyDictionary::new(&[
                    ("data", "D"),
                    ("version", "V"),
                    ("name", "n"),
                    ("songs", "s"),
                    ("title", "t"),
                    ("artist", "ar"),
                    ("duration", "du"),
                    ("coverUrl", "cu"),
                    ("createdAt", "ca"),
                    ("updatedAt", "ua"),
                ])),
            )
            .with(
                DataType::PlaybackHistory,
                Transform::Keys(KeyDictionary::new(&[
                    ("data", "D"),
                    ("version", "V"),
                    ("songId", "si"),
                    ("playedAt", "pa"),
                    ("duration", "du"),
                    ("completed", "c"),
                    ("source", "src"),
                ])),
            )
            .with(
                DataType::Batch,
                Transform::Keys(KeyDictionary::new(&[
                    ("changes", "c"),
                    ("dataType", "dt"),
                    ("operation", "op"),
                    ("versions", "vs"),
                    ("deviceId", "dv"),
                    ("data", "d"),
                    ("version", "v"),
                    ("results", "r"),
                    ("conflicts", "cf"),
                    ("conflict", "cn"),
                    ("success", "ok"),
                    ("timestamp", "ts"),
                    ("localData", "ld"),
                    ("serverData", "sd"),
                    ("localVersion", "lv"),
                    ("serverVersion", "sv"),
                    ("error", "er"),
                ])),
            )
    }
}
