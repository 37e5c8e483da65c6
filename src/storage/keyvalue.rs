//! Flat key/value fallback adapter.
//!
//! Each store is kept as one JSON-encoded collection under `sdk.<store>`, with
//! its schema version under `sdk.<store>.version`. Every operation reads the
//! whole collection, modifies it and writes it back.

use super::adapter::{AdapterKind, StorageAdapter};
use super::scheme::{StorageKey, StorageRecord, StoreName};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Minimal string map the key/value adapter is built on.
pub trait KeyValueBackend: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<String>>;
    fn set(&self, key: &str, value: String) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Read-modify-write `key` under a single lock. `f` gets the current value
    /// and returns the value to store (`None` writes nothing) plus a result.
    fn update<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<String>) -> StorageResult<(Option<String>, R)>,
    ) -> StorageResult<R>;
}

/// Volatile backend.
#[derive(Default)]
pub struct MemoryKv {
    map: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueBackend for MemoryKv {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.map.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn update<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<String>) -> StorageResult<(Option<String>, R)>,
    ) -> StorageResult<R> {
        let mut map = self.map.lock();
        let (next, result) = f(map.get(key).cloned())?;
        if let Some(next) = next {
            map.insert(key.to_string(), next);
        }
        Ok(result)
    }
}

/// Single JSON file holding a string map, shared between processes.
///
/// Writers hold an exclusive lock on a sidecar lock file and replace the data
/// file through a temp file + rename.
pub struct FileKv {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileKv {
    /// Open or create the key/value file.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let kv = Self {
            lock_path: path.with_extension("lock"),
            path,
        };

        let lock = kv.lock()?;
        if kv.path.exists() {
            // Refuse to start on top of a file we cannot parse.
            kv.read_map()?;
        } else {
            kv.write_map(&HashMap::new())?;
        }
        lock.unlock()?;

        Ok(kv)
    }

    fn lock(&self) -> StorageResult<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }

    fn read_map(&self) -> StorageResult<HashMap<String, String>> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::InvalidFormat(format!("{}: {}", self.path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_map(&self, map: &HashMap<String, String>) -> StorageResult<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(map)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn modify(&self, f: impl FnOnce(&mut HashMap<String, String>)) -> StorageResult<()> {
        let lock = self.lock()?;
        let mut map = self.read_map()?;
        f(&mut map);
        self.write_map(&map)?;
        lock.unlock()?;
        Ok(())
    }
}

impl KeyValueBackend for FileKv {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let lock = self.lock()?;
        let value = self.read_map()?.remove(key);
        lock.unlock()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: String) -> StorageResult<()> {
        self.modify(|map| {
            map.insert(key.to_string(), value);
        })
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.modify(|map| {
            map.remove(key);
        })
    }

    fn update<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<String>) -> StorageResult<(Option<String>, R)>,
    ) -> StorageResult<R> {
        let lock = self.lock()?;
        let mut map = self.read_map()?;
        let (next, result) = f(map.get(key).cloned())?;
        if let Some(next) = next {
            map.insert(key.to_string(), next);
            self.write_map(&map)?;
        }
        lock.unlock()?;
        Ok(result)
    }
}

/// Serialized form of one collection entry.
#[derive(Serialize, Deserialize)]
struct Entry {
    key: StorageKey,
    value: Value,
}

/// Storage adapter over a flat key/value backend.
pub struct KeyValueAdapter<B> {
    backend: B,
    quota_bytes: usize,
}

impl<B: KeyValueBackend> KeyValueAdapter<B> {
    pub fn new(backend: B, quota_bytes: usize) -> Self {
        Self {
            backend,
            quota_bytes,
        }
    }

    fn collection_key(store: StoreName) -> String {
        format!("sdk.{}", store)
    }

    fn version_key(store: StoreName) -> String {
        format!("sdk.{}.version", store)
    }

    fn decode(store: StoreName, raw: Option<String>) -> StorageResult<BTreeMap<StorageKey, Value>> {
        let Some(raw) = raw else {
            return Ok(BTreeMap::new());
        };

        let entries: Vec<Entry> = serde_json::from_str(&raw)
            .map_err(|e| StorageError::Deserialization(format!("{}: {}", store, e)))?;
        Ok(entries.into_iter().map(|e| (e.key, e.value)).collect())
    }

    fn encode(&self, store: StoreName, records: BTreeMap<StorageKey, Value>) -> StorageResult<String> {
        let entries: Vec<Entry> = records
            .into_iter()
            .map(|(key, value)| Entry { key, value })
            .collect();
        let raw = serde_json::to_string(&entries)?;

        if raw.len() > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                store: store.to_string(),
                size: raw.len(),
                limit: self.quota_bytes,
            });
        }
        Ok(raw)
    }

    fn load(&self, store: StoreName) -> StorageResult<BTreeMap<StorageKey, Value>> {
        Self::decode(store, self.backend.get(&Self::collection_key(store))?)
    }

    /// Apply `f` to a store's collection as one read-modify-write. `f` reports
    /// whether it changed anything; unchanged collections are not written.
    fn modify<R>(
        &self,
        store: StoreName,
        f: impl FnOnce(&mut BTreeMap<StorageKey, Value>) -> (bool, R),
    ) -> StorageResult<R> {
        self.backend.update(&Self::collection_key(store), |raw| {
            let mut records = Self::decode(store, raw)?;
            let (changed, result) = f(&mut records);
            if !changed {
                return Ok((None, result));
            }
            Ok((Some(self.encode(store, records)?), result))
        })
    }
}

impl<B: KeyValueBackend> StorageAdapter for KeyValueAdapter<B> {
    fn kind(&self) -> AdapterKind {
        AdapterKind::KeyValue
    }

    fn get_all(&self, store: StoreName) -> StorageResult<Vec<StorageRecord>> {
        Ok(self
            .load(store)?
            .into_iter()
            .map(|(key, value)| StorageRecord { store, key, value })
            .collect())
    }

    fn get(&self, store: StoreName, key: &StorageKey) -> StorageResult<Option<StorageRecord>> {
        Ok(self.load(store)?.remove(key).map(|value| StorageRecord {
            store,
            key: key.clone(),
            value,
        }))
    }

    fn put(&self, record: StorageRecord) -> StorageResult<()> {
        self.modify(record.store, |records| {
            records.insert(record.key, record.value);
            (true, ())
        })
    }

    fn insert(&self, record: StorageRecord) -> StorageResult<Option<StorageRecord>> {
        self.modify(record.store, |records| match record.conflict_in(records) {
            Some(existing) => (false, Some(existing)),
            None => {
                records.insert(record.key, record.value);
                (true, None)
            }
        })
    }

    fn update(&self, record: StorageRecord) -> StorageResult<bool> {
        self.modify(record.store, |records| match records.get_mut(&record.key) {
            Some(value) => {
                *value = record.value;
                (true, true)
            }
            None => (false, false),
        })
    }

    fn delete(&self, store: StoreName, key: &StorageKey) -> StorageResult<bool> {
        self.modify(store, |records| {
            let existed = records.remove(key).is_some();
            (existed, existed)
        })
    }

    fn clear(&self, store: StoreName) -> StorageResult<()> {
        self.backend.remove(&Self::collection_key(store))
    }

    fn schema_version(&self, store: StoreName) -> StorageResult<u32> {
        match self.backend.get(&Self::version_key(store))? {
            Some(raw) => raw
                .parse()
                .map_err(|_| StorageError::InvalidFormat(format!("{}: bad version '{}'", store, raw))),
            None => Ok(0),
        }
    }

    fn rewrite(
        &self,
        store: StoreName,
        records: Vec<StorageRecord>,
        version: u32,
    ) -> StorageResult<()> {
        let records = records.into_iter().map(|r| (r.key, r.value)).collect();
        let raw = self.encode(store, records)?;
        self.backend.set(&Self::collection_key(store), raw)?;
        // Written last: an interrupted rewrite re-runs the migration.
        self.backend
            .set(&Self::version_key(store), version.to_string())
    }
}
