//! Backing adapter contract and capability probe.

use super::keyvalue::{FileKv, KeyValueAdapter, MemoryKv};
use super::scheme::{StorageKey, StorageRecord, StoreName};
use super::structured::StructuredAdapter;
use crate::config::{AdapterPreference, StorageConfig};
use crate::error::{StorageError, StorageResult};
use std::sync::Arc;
use tracing::{info, warn};

/// File name of the flat key/value store inside the storage directory.
pub const KV_FILE: &str = "kv.json";

/// Which kind of adapter backs the storage layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterKind {
    /// Per-store record logs with per-record operations.
    Structured,
    /// Flat string map; each store is one serialized collection.
    KeyValue,
}

/// Synchronous record store backing the async [`StorageManager`].
///
/// Implementations return records ordered ascending by key.
///
/// [`StorageManager`]: super::StorageManager
pub trait StorageAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// All records of a store, ascending by key.
    fn get_all(&self, store: StoreName) -> StorageResult<Vec<StorageRecord>>;

    /// A single record by key.
    fn get(&self, store: StoreName, key: &StorageKey) -> StorageResult<Option<StorageRecord>> {
        Ok(self
            .get_all(store)?
            .into_iter()
            .find(|record| &record.key == key))
    }

    /// Insert or replace a record.
    fn put(&self, record: StorageRecord) -> StorageResult<()>;

    /// Write `record` unless it collides with a stored record (see
    /// [`StorageRecord::conflict_in`]), in which case that record is returned
    /// and nothing is written. The check and the write are atomic with respect
    /// to other contexts sharing the store.
    fn insert(&self, record: StorageRecord) -> StorageResult<Option<StorageRecord>>;

    /// Replace a record whose key is already stored. Returns `false`, writing
    /// nothing, if the key is absent.
    fn update(&self, record: StorageRecord) -> StorageResult<bool>;

    /// Remove a record. Returns whether it existed.
    fn delete(&self, store: StoreName, key: &StorageKey) -> StorageResult<bool>;

    /// Remove every record of a store, keeping its schema version.
    fn clear(&self, store: StoreName) -> StorageResult<()>;

    /// Schema version marker of a store (0 if never written).
    fn schema_version(&self, store: StoreName) -> StorageResult<u32>;

    /// Replace the whole store content and stamp `version`.
    ///
    /// The version marker must never become visible before the records.
    fn rewrite(
        &self,
        store: StoreName,
        records: Vec<StorageRecord>,
        version: u32,
    ) -> StorageResult<()>;
}

/// Select a backing adapter for `config`.
///
/// With [`AdapterPreference::Auto`] the structured adapter is preferred, then a
/// file-backed key/value store, then an in-memory key/value store.
pub fn probe(config: &StorageConfig) -> StorageResult<Arc<dyn StorageAdapter>> {
    let quota = config.quota_bytes;

    match config.adapter {
        AdapterPreference::Memory => Ok(memory(quota)),
        AdapterPreference::Structured => {
            let path = config.path.as_ref().ok_or_else(|| {
                StorageError::AdapterUnavailable("structured storage requires a path".into())
            })?;
            Ok(Arc::new(StructuredAdapter::open(path, quota, config.compact_after)?))
        }
        AdapterPreference::KeyValue => match &config.path {
            Some(path) => Ok(Arc::new(KeyValueAdapter::new(
                FileKv::open(path.join(KV_FILE))?,
                quota,
            ))),
            None => Ok(memory(quota)),
        },
        AdapterPreference::Auto => {
            if let Some(path) = &config.path {
                match StructuredAdapter::open(path, quota, config.compact_after) {
                    Ok(adapter) => {
                        info!(path = %path.display(), "Using structured storage");
                        return Ok(Arc::new(adapter));
                    }
                    Err(e) => warn!(error = %e, "Structured storage unavailable"),
                }

                match FileKv::open(path.join(KV_FILE)) {
                    Ok(kv) => {
                        info!(path = %path.display(), "Using key/value storage");
                        return Ok(Arc::new(KeyValueAdapter::new(kv, quota)));
                    }
                    Err(e) => warn!(error = %e, "Key/value storage unavailable"),
                }
            }

            info!("Using in-memory storage");
            Ok(memory(quota))
        }
    }
}

fn memory(quota: usize) -> Arc<dyn StorageAdapter> {
    Arc::new(KeyValueAdapter::new(MemoryKv::new(), quota))
}
