//! Store names, key paths and the generic storage record.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// Schema version written by this build.
pub const SCHEMA_VERSION: u32 = 2;

/// Named stores known to the storage layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreName {
    ActivityState,
    Queue,
    Attribution,
    Preferences,
}

/// How a store derives a record's key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyPath {
    /// Key is read from a top-level field of the record.
    Field(&'static str),
    /// Single-record store with a constant key.
    Fixed(&'static str),
}

impl StoreName {
    pub const ALL: [StoreName; 4] = [
        StoreName::ActivityState,
        StoreName::Queue,
        StoreName::Attribution,
        StoreName::Preferences,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::ActivityState => "activity_state",
            StoreName::Queue => "queue",
            StoreName::Attribution => "attribution",
            StoreName::Preferences => "preferences",
        }
    }

    pub fn key_path(&self) -> KeyPath {
        match self {
            StoreName::ActivityState => KeyPath::Field("uuid"),
            StoreName::Queue => KeyPath::Field("created_at"),
            StoreName::Attribution => KeyPath::Fixed("attribution"),
            StoreName::Preferences => KeyPath::Fixed("preferences"),
        }
    }

    /// Whether the store keeps at most one live record.
    pub fn holds_single_record(&self) -> bool {
        !matches!(self, StoreName::Queue)
    }

    /// Extract the key of `value` according to this store's key path.
    pub fn key_of(&self, value: &Value) -> StorageResult<StorageKey> {
        match self.key_path() {
            KeyPath::Fixed(key) => Ok(StorageKey::Text(key.to_string())),
            KeyPath::Field(field) => match value.get(field) {
                Some(Value::String(s)) => Ok(StorageKey::Text(s.clone())),
                Some(Value::Number(n)) => n.as_i64().map(StorageKey::Int).ok_or_else(|| {
                    StorageError::InvalidFormat(format!(
                        "{}: key field '{}' is not an integer",
                        self, field
                    ))
                }),
                _ => Err(StorageError::InvalidFormat(format!(
                    "{}: record has no key field '{}'",
                    self, field
                ))),
            },
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record key. Integer keys sort before text keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StorageKey {
    Int(i64),
    Text(String),
}

impl Ord for StorageKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (StorageKey::Int(a), StorageKey::Int(b)) => a.cmp(b),
            (StorageKey::Text(a), StorageKey::Text(b)) => a.cmp(b),
            (StorageKey::Int(_), StorageKey::Text(_)) => Ordering::Less,
            (StorageKey::Text(_), StorageKey::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for StorageKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Int(n) => write!(f, "{}", n),
            StorageKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for StorageKey {
    fn from(n: i64) -> Self {
        StorageKey::Int(n)
    }
}

impl From<&str> for StorageKey {
    fn from(s: &str) -> Self {
        StorageKey::Text(s.to_string())
    }
}

impl From<String> for StorageKey {
    fn from(s: String) -> Self {
        StorageKey::Text(s)
    }
}

/// The storage layer's unit of durability.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StorageRecord {
    pub store: StoreName,
    pub key: StorageKey,
    pub value: Value,
}

impl StorageRecord {
    /// Build a record, deriving the key from the store's key path.
    pub fn new(store: StoreName, value: Value) -> StorageResult<Self> {
        let key = store.key_of(&value)?;
        Ok(Self { store, key, value })
    }

    /// The stored record this one collides with: the same key, or in a
    /// single-record store any record at all.
    pub fn conflict_in(&self, records: &BTreeMap<StorageKey, Value>) -> Option<StorageRecord> {
        let (key, value) = if self.store.holds_single_record() {
            records.iter().next()?
        } else {
            records.get_key_value(&self.key)?
        };
        Some(StorageRecord {
            store: self.store,
            key: key.clone(),
            value: value.clone(),
        })
    }

    /// Approximate encoded size, used for quota accounting.
    pub fn encoded_len(&self) -> usize {
        serde_json::to_vec(&self.value).map(|v| v.len()).unwrap_or(0)
    }
}
