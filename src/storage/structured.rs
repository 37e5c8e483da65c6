//! Structured adapter: one append-only record log per store.
//!
//! Layout of a storage directory:
//!
//! ```text
//! MANIFEST               magic + format version
//! <store>.log            header (magic, version, generation) + frames
//! <store>.lock           writer lock, never renamed
//! ```
//!
//! Each frame is `len: u32 | MessagePack(LogEntry) | crc32: u32`. The in-memory
//! view of a store is rebuilt by replaying frames; before every operation the
//! adapter replays whatever other contexts appended since it last looked. A
//! torn trailing frame is ignored on read and truncated before the next append.
//! Compaction and migrations write a fresh log under a new generation and swap
//! it in with a rename, so either the old or the new content is visible.

use super::adapter::{AdapterKind, StorageAdapter};
use super::scheme::{StorageKey, StorageRecord, StoreName};
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for the storage manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"SDK\0";

/// Magic bytes for a store log.
const LOG_MAGIC: &[u8; 4] = b"SLG\0";

/// Current on-disk format version.
const FORMAT_VERSION: u8 = 1;

/// Header size: magic + version + generation.
const HEADER_SIZE: u64 = 4 + 1 + 8;

/// Frame overhead: length prefix + checksum.
const FRAME_OVERHEAD: u64 = 4 + 4;

/// One logged mutation.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum LogEntry {
    Put { key: StorageKey, value: Value },
    Delete { key: StorageKey },
    Clear,
    Schema { version: u32 },
}

/// Replayed view of one store.
#[derive(Default)]
struct StoreState {
    records: BTreeMap<StorageKey, Value>,
    /// Encoded size of each record, for quota accounting.
    sizes: HashMap<StorageKey, usize>,
    version: u32,
    /// Generation of the log file this view was built from.
    generation: u64,
    /// End of the last valid frame.
    offset: u64,
    /// Frames appended since the log was last rewritten.
    entries: usize,
}

impl StoreState {
    fn fresh(generation: u64) -> Self {
        Self {
            generation,
            offset: HEADER_SIZE,
            ..Default::default()
        }
    }

    fn total_bytes(&self) -> usize {
        self.sizes.values().sum()
    }

    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Put { key, value } => {
                let size = encoded_len(&value);
                self.sizes.insert(key.clone(), size);
                self.records.insert(key, value);
            }
            LogEntry::Delete { key } => {
                self.sizes.remove(&key);
                self.records.remove(&key);
            }
            LogEntry::Clear => {
                self.sizes.clear();
                self.records.clear();
            }
            LogEntry::Schema { version } => self.version = version,
        }
        self.entries += 1;
    }

    fn to_records(&self, store: StoreName) -> Vec<StorageRecord> {
        self.records
            .iter()
            .map(|(key, value)| StorageRecord {
                store,
                key: key.clone(),
                value: value.clone(),
            })
            .collect()
    }
}

fn encoded_len(value: &Value) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Adapter storing each store as an append-only log in a directory.
pub struct StructuredAdapter {
    root: PathBuf,
    quota_bytes: usize,
    compact_after: usize,
    stores: HashMap<StoreName, Mutex<StoreState>>,
}

impl StructuredAdapter {
    /// Open or create a structured store rooted at `root`.
    ///
    /// Fails if the directory cannot be created or written, or if it holds a
    /// store written in an unknown format.
    pub fn open(
        root: impl AsRef<Path>,
        quota_bytes: usize,
        compact_after: usize,
    ) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let manifest = root.join("MANIFEST");
        if manifest.exists() {
            Self::verify_manifest(&manifest)?;
        } else {
            Self::write_manifest(&manifest)?;
        }

        // Capability probe: the directory must accept new files.
        let probe = root.join(".probe");
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;

        let stores = StoreName::ALL
            .iter()
            .map(|store| (*store, Mutex::new(StoreState::default())))
            .collect();

        Ok(Self {
            root,
            quota_bytes,
            compact_after: compact_after.max(1),
            stores,
        })
    }

    fn write_manifest(path: &Path) -> StorageResult<()> {
        let mut file = File::create(path)?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> StorageResult<()> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(StorageError::InvalidFormat("Invalid storage magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "Unsupported storage format: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn log_path(&self, store: StoreName) -> PathBuf {
        self.root.join(format!("{}.log", store))
    }

    fn lock_path(&self, store: StoreName) -> PathBuf {
        self.root.join(format!("{}.lock", store))
    }

    fn state(&self, store: StoreName) -> StorageResult<&Mutex<StoreState>> {
        self.stores
            .get(&store)
            .ok_or_else(|| StorageError::AdapterUnavailable(format!("unknown store {}", store)))
    }

    /// Run `f` against an up-to-date view of `store` while holding its file lock.
    fn with_store<R>(
        &self,
        store: StoreName,
        f: impl FnOnce(&Self, &mut StoreState, &mut File) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let mut state = self.state(store)?.lock();

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.lock_path(store))?;
        lock.lock_exclusive()?;

        let mut log = self.open_log(store)?;
        Self::refresh(store, &mut state, &mut log)?;
        let result = f(self, &mut state, &mut log);

        lock.unlock()?;
        result
    }

    /// Open the store log, writing a header if the file is new.
    fn open_log(&self, store: StoreName) -> StorageResult<File> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.log_path(store))?;

        if file.metadata()?.len() < HEADER_SIZE {
            file.set_len(0)?;
            Self::write_header(&mut file, 1)?;
            file.sync_all()?;
        }

        Ok(file)
    }

    fn write_header(file: &mut File, generation: u64) -> StorageResult<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.write_all(&generation.to_le_bytes())?;
        Ok(())
    }

    fn read_generation(file: &mut File) -> StorageResult<u64> {
        file.seek(SeekFrom::Start(0))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StorageError::InvalidFormat("Invalid log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StorageError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        let mut generation = [0u8; 8];
        file.read_exact(&mut generation)?;
        Ok(u64::from_le_bytes(generation))
    }

    /// Catch up with frames written since `state` was last refreshed.
    fn refresh(store: StoreName, state: &mut StoreState, file: &mut File) -> StorageResult<()> {
        let generation = Self::read_generation(file)?;
        let len = file.metadata()?.len();

        if generation != state.generation || len < state.offset {
            debug!(%store, generation, "Reloading store log");
            *state = StoreState::fresh(generation);
        }

        file.seek(SeekFrom::Start(state.offset))?;
        while state.offset < len {
            match Self::read_frame(file, len - state.offset)? {
                Some((entry, frame_len)) => {
                    state.apply(entry);
                    state.offset += frame_len;
                }
                None => {
                    warn!(%store, offset = state.offset, "Ignoring torn tail of store log");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Read one frame at the current position. `None` if it is incomplete or corrupt.
    fn read_frame(file: &mut File, remaining: u64) -> StorageResult<Option<(LogEntry, u64)>> {
        if remaining < FRAME_OVERHEAD {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as u64;
        if remaining < len + FRAME_OVERHEAD {
            return Ok(None);
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);
        if stored_checksum != computed_checksum {
            warn!(
                expected = stored_checksum,
                got = computed_checksum,
                "Checksum mismatch in store log"
            );
            return Ok(None);
        }

        match rmp_serde::from_slice(&payload) {
            Ok(entry) => Ok(Some((entry, len + FRAME_OVERHEAD))),
            Err(e) => {
                warn!(error = %e, "Undecodable frame in store log");
                Ok(None)
            }
        }
    }

    fn write_frame(file: &mut File, entry: &LogEntry) -> StorageResult<u64> {
        let payload = rmp_serde::to_vec_named(entry)?;
        file.write_all(&(payload.len() as u32).to_le_bytes())?;
        file.write_all(&payload)?;
        file.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        Ok(payload.len() as u64 + FRAME_OVERHEAD)
    }

    /// Append `entry` after the last valid frame and apply it.
    fn append(
        &self,
        store: StoreName,
        state: &mut StoreState,
        file: &mut File,
        entry: LogEntry,
    ) -> StorageResult<()> {
        // Drop any torn tail before writing.
        file.set_len(state.offset)?;
        file.seek(SeekFrom::Start(state.offset))?;

        let written = Self::write_frame(file, &entry)?;
        file.sync_data()?;

        state.offset += written;
        state.apply(entry);

        if state.entries > self.compact_after {
            let records = state.to_records(store);
            let version = state.version;
            self.swap_in(store, state, records, version)?;
        }

        Ok(())
    }

    /// Write a complete new log for `store` and rename it over the old one.
    fn swap_in(
        &self,
        store: StoreName,
        state: &mut StoreState,
        records: Vec<StorageRecord>,
        version: u32,
    ) -> StorageResult<()> {
        let generation = state.generation + 1;
        let tmp_path = self.root.join(format!("{}.log.tmp", store));

        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;
        Self::write_header(&mut tmp, generation)?;

        let mut fresh = StoreState::fresh(generation);
        for record in records {
            let entry = LogEntry::Put {
                key: record.key,
                value: record.value,
            };
            fresh.offset += Self::write_frame(&mut tmp, &entry)?;
            fresh.apply(entry);
        }

        // Version marker goes last.
        let marker = LogEntry::Schema { version };
        fresh.offset += Self::write_frame(&mut tmp, &marker)?;
        fresh.apply(marker);
        tmp.sync_all()?;

        fs::rename(&tmp_path, self.log_path(store))?;
        debug!(%store, generation, records = fresh.records.len(), "Rewrote store log");

        fresh.entries = 0;
        *state = fresh;
        Ok(())
    }

    fn check_quota(&self, store: StoreName, state: &StoreState, key: &StorageKey, value: &Value) -> StorageResult<()> {
        let current = state.total_bytes() - state.sizes.get(key).copied().unwrap_or(0);
        let size = current + encoded_len(value);
        if size > self.quota_bytes {
            return Err(StorageError::QuotaExceeded {
                store: store.to_string(),
                size,
                limit: self.quota_bytes,
            });
        }
        Ok(())
    }
}

impl StorageAdapter for StructuredAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Structured
    }

    fn get_all(&self, store: StoreName) -> StorageResult<Vec<StorageRecord>> {
        self.with_store(store, |_, state, _| Ok(state.to_records(store)))
    }

    fn get(&self, store: StoreName, key: &StorageKey) -> StorageResult<Option<StorageRecord>> {
        self.with_store(store, |_, state, _| {
            Ok(state.records.get(key).map(|value| StorageRecord {
                store,
                key: key.clone(),
                value: value.clone(),
            }))
        })
    }

    fn put(&self, record: StorageRecord) -> StorageResult<()> {
        let store = record.store;
        self.with_store(store, |this, state, file| {
            this.check_quota(store, state, &record.key, &record.value)?;
            this.append(
                store,
                state,
                file,
                LogEntry::Put {
                    key: record.key,
                    value: record.value,
                },
            )
        })
    }

    fn insert(&self, record: StorageRecord) -> StorageResult<Option<StorageRecord>> {
        let store = record.store;
        self.with_store(store, |this, state, file| {
            if let Some(existing) = record.conflict_in(&state.records) {
                return Ok(Some(existing));
            }
            this.check_quota(store, state, &record.key, &record.value)?;
            this.append(
                store,
                state,
                file,
                LogEntry::Put {
                    key: record.key,
                    value: record.value,
                },
            )?;
            Ok(None)
        })
    }

    fn update(&self, record: StorageRecord) -> StorageResult<bool> {
        let store = record.store;
        self.with_store(store, |this, state, file| {
            if !state.records.contains_key(&record.key) {
                return Ok(false);
            }
            this.check_quota(store, state, &record.key, &record.value)?;
            this.append(
                store,
                state,
                file,
                LogEntry::Put {
                    key: record.key,
                    value: record.value,
                },
            )?;
            Ok(true)
        })
    }

    fn delete(&self, store: StoreName, key: &StorageKey) -> StorageResult<bool> {
        self.with_store(store, |this, state, file| {
            if !state.records.contains_key(key) {
                return Ok(false);
            }
            this.append(store, state, file, LogEntry::Delete { key: key.clone() })?;
            Ok(true)
        })
    }

    fn clear(&self, store: StoreName) -> StorageResult<()> {
        self.with_store(store, |this, state, file| {
            this.append(store, state, file, LogEntry::Clear)
        })
    }

    fn schema_version(&self, store: StoreName) -> StorageResult<u32> {
        self.with_store(store, |_, state, _| Ok(state.version))
    }

    fn rewrite(
        &self,
        store: StoreName,
        records: Vec<StorageRecord>,
        version: u32,
    ) -> StorageResult<()> {
        self.with_store(store, |this, state, _| {
            this.swap_in(store, state, records, version)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> StructuredAdapter {
        StructuredAdapter::open(dir.path(), usize::MAX, 1000).unwrap()
    }

    fn queue_record(created_at: i64, url: &str) -> StorageRecord {
        StorageRecord::new(StoreName::Queue, json!({"created_at": created_at, "url": url})).unwrap()
    }

    #[test]
    fn test_put_and_get_all_ordered() {
        let dir = TempDir::new().unwrap();
        let adapter = open(&dir);

        adapter.put(queue_record(3, "/c")).unwrap();
        adapter.put(queue_record(1, "/a")).unwrap();
        adapter.put(queue_record(2, "/b")).unwrap();

        let urls: Vec<_> = adapter
            .get_all(StoreName::Queue)
            .unwrap()
            .into_iter()
            .map(|r| r.value["url"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(urls, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let adapter = open(&dir);
            adapter.put(queue_record(1, "/a")).unwrap();
            adapter.put(queue_record(2, "/b")).unwrap();
            adapter.delete(StoreName::Queue, &StorageKey::Int(1)).unwrap();
        }

        let adapter = open(&dir);
        let all = adapter.get_all(StoreName::Queue).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].key, StorageKey::Int(2));
    }

    #[test]
    fn test_insert_refuses_taken_key_across_contexts() {
        let dir = TempDir::new().unwrap();
        let a = open(&dir);
        let b = open(&dir);

        assert!(a.insert(queue_record(7, "/a")).unwrap().is_none());
        let taken = b.insert(queue_record(7, "/b")).unwrap().unwrap();
        assert_eq!(taken.value["url"], "/a");
        assert!(b.insert(queue_record(8, "/b")).unwrap().is_none());
        assert_eq!(a.get_all(StoreName::Queue).unwrap().len(), 2);
    }

    #[test]
    fn test_second_context_sees_appends() {
        let dir = TempDir::new().unwrap();
        let a = open(&dir);
        let b = open(&dir);

        assert!(b.get_all(StoreName::Queue).unwrap().is_empty());
        a.put(queue_record(1, "/a")).unwrap();
        assert_eq!(b.get_all(StoreName::Queue).unwrap().len(), 1);

        b.clear(StoreName::Queue).unwrap();
        assert!(a.get_all(StoreName::Queue).unwrap().is_empty());
    }

    #[test]
    fn test_torn_tail_is_ignored_and_truncated() {
        let dir = TempDir::new().unwrap();
        {
            let adapter = open(&dir);
            adapter.put(queue_record(1, "/a")).unwrap();
        }

        // Simulate a crash halfway through the next frame.
        let log = dir.path().join("queue.log");
        let mut file = OpenOptions::new().append(true).open(&log).unwrap();
        file.write_all(&[42, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let adapter = open(&dir);
        assert_eq!(adapter.get_all(StoreName::Queue).unwrap().len(), 1);

        adapter.put(queue_record(2, "/b")).unwrap();
        drop(adapter);

        let adapter = open(&dir);
        assert_eq!(adapter.get_all(StoreName::Queue).unwrap().len(), 2);
    }

    #[test]
    fn test_compaction_keeps_content() {
        let dir = TempDir::new().unwrap();
        let adapter = StructuredAdapter::open(dir.path(), usize::MAX, 4).unwrap();

        for i in 0..10 {
            adapter.put(queue_record(i, "/x")).unwrap();
            if i % 2 == 0 {
                adapter.delete(StoreName::Queue, &StorageKey::Int(i)).unwrap();
            }
        }

        let reader = open(&dir);
        let keys: Vec<_> = reader
            .get_all(StoreName::Queue)
            .unwrap()
            .into_iter()
            .map(|r| r.key)
            .collect();
        assert_eq!(
            keys,
            vec![1, 3, 5, 7, 9].into_iter().map(StorageKey::Int).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_rewrite_sets_version_atomically() {
        let dir = TempDir::new().unwrap();
        let adapter = open(&dir);
        adapter.put(queue_record(1, "/old")).unwrap();
        assert_eq!(adapter.schema_version(StoreName::Queue).unwrap(), 0);

        adapter
            .rewrite(StoreName::Queue, vec![queue_record(1, "/new")], 2)
            .unwrap();

        let reader = open(&dir);
        assert_eq!(reader.schema_version(StoreName::Queue).unwrap(), 2);
        let all = reader.get_all(StoreName::Queue).unwrap();
        assert_eq!(all[0].value["url"], "/new");
    }

    #[test]
    fn test_quota_exceeded() {
        let dir = TempDir::new().unwrap();
        let adapter = StructuredAdapter::open(dir.path(), 100, 1000).unwrap();

        adapter.put(queue_record(1, "/a")).unwrap();
        let big = StorageRecord::new(
            StoreName::Queue,
            json!({"created_at": 2, "url": "x".repeat(200)}),
        )
        .unwrap();
        let err = adapter.put(big).unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { .. }));
        assert_eq!(adapter.get_all(StoreName::Queue).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_manifest() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("MANIFEST"), b"XXXX\x01").unwrap();
        let result = StructuredAdapter::open(dir.path(), usize::MAX, 1000);
        assert!(matches!(result, Err(StorageError::InvalidFormat(_))));
    }
}
