use super::adapter::{probe, AdapterKind, StorageAdapter};
use super::migration;
use super::scheme::{StorageKey, StorageRecord, StoreName, SCHEMA_VERSION};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Typed, per-store serialized access to the selected storage adapter.
///
/// Writers to the same store queue behind that store's lock; different stores
/// proceed independently.
pub struct StorageManager {
    adapter: Arc<dyn StorageAdapter>,
    locks: [Mutex<()>; 4],
}

impl StorageManager {
    /// Probe for an adapter according to `config` and run migrations.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        Self::with_adapter(probe(config)?)
    }

    /// Use an explicit adapter and run migrations.
    pub fn with_adapter(adapter: Arc<dyn StorageAdapter>) -> StorageResult<Self> {
        migration::run(adapter.as_ref())?;
        Ok(Self {
            adapter,
            locks: Default::default(),
        })
    }

    pub fn adapter_kind(&self) -> AdapterKind {
        self.adapter.kind()
    }

    fn lock(&self, store: StoreName) -> &Mutex<()> {
        let index = StoreName::ALL
            .iter()
            .position(|s| *s == store)
            .unwrap_or_default();
        &self.locks[index]
    }

    fn decode<T: DeserializeOwned>(record: StorageRecord) -> StorageResult<T> {
        serde_json::from_value(record.value)
            .map_err(|e| StorageError::Deserialization(format!("{}: {}", record.store, e)))
    }

    fn encode<T: Serialize>(store: StoreName, item: &T) -> StorageResult<StorageRecord> {
        StorageRecord::new(store, serde_json::to_value(item)?)
    }

    fn not_found(store: StoreName, key: &StorageKey) -> StorageError {
        StorageError::NotFound {
            store: store.to_string(),
            key: key.to_string(),
        }
    }

    /// Run `f` against the adapter on the blocking pool. Adapters do file IO
    /// and may wait on another process's file lock.
    async fn blocking<R, F>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&dyn StorageAdapter) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let adapter = self.adapter.clone();
        tokio::task::spawn_blocking(move || f(adapter.as_ref())).await?
    }

    /// The lowest-keyed record of `store`.
    pub async fn get_first<T: DeserializeOwned>(&self, store: StoreName) -> StorageResult<Option<T>> {
        let _guard = self.lock(store).lock().await;
        self.blocking(move |adapter| adapter.get_all(store))
            .await?
            .into_iter()
            .next()
            .map(Self::decode)
            .transpose()
    }

    /// Every record of `store`, ascending by key.
    pub async fn get_all<T: DeserializeOwned>(&self, store: StoreName) -> StorageResult<Vec<T>> {
        let _guard = self.lock(store).lock().await;
        self.blocking(move |adapter| adapter.get_all(store))
            .await?
            .into_iter()
            .map(Self::decode)
            .collect()
    }

    pub async fn get_item<T: DeserializeOwned>(
        &self,
        store: StoreName,
        key: impl Into<StorageKey>,
    ) -> StorageResult<Option<T>> {
        let key = key.into();
        let _guard = self.lock(store).lock().await;
        self.blocking(move |adapter| adapter.get(store, &key))
            .await?
            .map(Self::decode)
            .transpose()
    }

    /// Insert or replace `item`, returning its key.
    pub async fn add_item<T: Serialize>(&self, store: StoreName, item: &T) -> StorageResult<StorageKey> {
        let record = Self::encode(store, item)?;
        let key = record.key.clone();
        let _guard = self.lock(store).lock().await;
        self.blocking(move |adapter| adapter.put(record)).await?;
        debug!(%store, %key, "Added record");
        Ok(key)
    }

    /// Like [`add_item`](Self::add_item), but only if `wanted` still holds once
    /// the store lock is taken. Returns whether the record was written.
    pub async fn add_item_if<T: Serialize>(
        &self,
        store: StoreName,
        item: &T,
        wanted: impl FnOnce() -> bool,
    ) -> StorageResult<bool> {
        let record = Self::encode(store, item)?;
        let key = record.key.clone();
        let _guard = self.lock(store).lock().await;
        if !wanted() {
            debug!(%store, %key, "Write no longer wanted, skipped");
            return Ok(false);
        }
        self.blocking(move |adapter| adapter.put(record)).await?;
        debug!(%store, %key, "Added record");
        Ok(true)
    }

    /// Insert `item` unless the store already holds a colliding record: one
    /// with the same key or, for single-record stores, any record. The
    /// colliding record is returned instead. Safe against other contexts
    /// sharing the store.
    pub async fn insert_item<T: Serialize + DeserializeOwned>(
        &self,
        store: StoreName,
        item: &T,
    ) -> StorageResult<Option<T>> {
        let record = Self::encode(store, item)?;
        let key = record.key.clone();
        let _guard = self.lock(store).lock().await;
        match self.blocking(move |adapter| adapter.insert(record)).await? {
            Some(existing) => {
                debug!(%store, %key, existing = %existing.key, "Insert collided");
                Self::decode(existing).map(Some)
            }
            None => {
                debug!(%store, %key, "Added record");
                Ok(None)
            }
        }
    }

    /// Replace an existing record. Fails with `NotFound` if its key is absent.
    pub async fn update_item<T: Serialize>(&self, store: StoreName, item: &T) -> StorageResult<StorageKey> {
        let record = Self::encode(store, item)?;
        let key = record.key.clone();
        let _guard = self.lock(store).lock().await;
        if !self.blocking(move |adapter| adapter.update(record)).await? {
            return Err(Self::not_found(store, &key));
        }
        Ok(key)
    }

    /// Remove a record. Fails with `NotFound` if it is absent.
    pub async fn delete_item(&self, store: StoreName, key: impl Into<StorageKey>) -> StorageResult<()> {
        let key = key.into();
        let _guard = self.lock(store).lock().await;
        let target = key.clone();
        if !self.blocking(move |adapter| adapter.delete(store, &target)).await? {
            return Err(Self::not_found(store, &key));
        }
        debug!(%store, %key, "Deleted record");
        Ok(())
    }

    /// Replace the whole content of `store` with `items` in one step.
    pub async fn replace_all<T: Serialize>(&self, store: StoreName, items: &[T]) -> StorageResult<()> {
        let records = items
            .iter()
            .map(|item| Self::encode(store, item))
            .collect::<StorageResult<Vec<_>>>()?;
        let _guard = self.lock(store).lock().await;
        self.blocking(move |adapter| adapter.rewrite(store, records, SCHEMA_VERSION))
            .await
    }

    pub async fn clear(&self, store: StoreName) -> StorageResult<()> {
        let _guard = self.lock(store).lock().await;
        self.blocking(move |adapter| adapter.clear(store)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageErrorKind;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Item {
        created_at: i64,
        url: String,
    }

    fn item(created_at: i64, url: &str) -> Item {
        Item {
            created_at,
            url: url.to_string(),
        }
    }

    fn manager() -> StorageManager {
        StorageManager::open(&StorageConfig::in_memory()).unwrap()
    }

    #[tokio::test]
    async fn test_get_first_is_lowest_key() {
        let storage = manager();
        assert!(storage.get_first::<Item>(StoreName::Queue).await.unwrap().is_none());

        storage.add_item(StoreName::Queue, &item(20, "/b")).await.unwrap();
        storage.add_item(StoreName::Queue, &item(10, "/a")).await.unwrap();

        let first: Item = storage.get_first(StoreName::Queue).await.unwrap().unwrap();
        assert_eq!(first, item(10, "/a"));
    }

    #[tokio::test]
    async fn test_update_missing_is_not_found() {
        let storage = manager();
        let err = storage
            .update_item(StoreName::Queue, &item(1, "/a"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);

        storage.add_item(StoreName::Queue, &item(1, "/a")).await.unwrap();
        storage.update_item(StoreName::Queue, &item(1, "/z")).await.unwrap();
        let stored: Option<Item> = storage.get_item(StoreName::Queue, 1i64).await.unwrap();
        assert_eq!(stored, Some(item(1, "/z")));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let storage = manager();
        storage.add_item(StoreName::Queue, &item(1, "/a")).await.unwrap();
        storage.delete_item(StoreName::Queue, 1i64).await.unwrap();

        let err = storage.delete_item(StoreName::Queue, 1i64).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_add_replaces() {
        let storage = manager();
        storage.add_item(StoreName::Queue, &item(1, "/a")).await.unwrap();
        storage.add_item(StoreName::Queue, &item(1, "/b")).await.unwrap();

        let all: Vec<Item> = storage.get_all(StoreName::Queue).await.unwrap();
        assert_eq!(all, vec![item(1, "/b")]);
    }

    #[tokio::test]
    async fn test_clear_only_affects_one_store() {
        let storage = manager();
        storage.add_item(StoreName::Queue, &item(1, "/a")).await.unwrap();
        storage
            .add_item(StoreName::Attribution, &serde_json::json!({"network": "n"}))
            .await
            .unwrap();

        storage.clear(StoreName::Queue).await.unwrap();
        assert!(storage.get_all::<Item>(StoreName::Queue).await.unwrap().is_empty());
        let attribution: Option<serde_json::Value> = storage
            .get_item(StoreName::Attribution, "attribution")
            .await
            .unwrap();
        assert!(attribution.is_some());
    }

    #[tokio::test]
    async fn test_insert_item_reports_collision() {
        let storage = manager();
        assert!(storage
            .insert_item(StoreName::Queue, &item(1, "/a"))
            .await
            .unwrap()
            .is_none());

        let existing = storage
            .insert_item(StoreName::Queue, &item(1, "/b"))
            .await
            .unwrap();
        assert_eq!(existing, Some(item(1, "/a")));
        let all: Vec<Item> = storage.get_all(StoreName::Queue).await.unwrap();
        assert_eq!(all, vec![item(1, "/a")]);
    }

    #[tokio::test]
    async fn test_add_item_if_checks_under_lock() {
        let storage = manager();
        let value = serde_json::json!({"network": "n"});
        assert!(!storage
            .add_item_if(StoreName::Attribution, &value, || false)
            .await
            .unwrap());
        assert!(storage.get_all::<serde_json::Value>(StoreName::Attribution).await.unwrap().is_empty());

        assert!(storage
            .add_item_if(StoreName::Attribution, &value, || true)
            .await
            .unwrap());
        assert_eq!(
            storage.get_all::<serde_json::Value>(StoreName::Attribution).await.unwrap(),
            vec![value]
        );
    }

    #[tokio::test]
    async fn test_replace_all() {
        let storage = manager();
        storage.add_item(StoreName::Queue, &item(1, "/a")).await.unwrap();
        storage.add_item(StoreName::Queue, &item(2, "/b")).await.unwrap();

        storage
            .replace_all(StoreName::Queue, &[item(3, "/c")])
            .await
            .unwrap();
        let all: Vec<Item> = storage.get_all(StoreName::Queue).await.unwrap();
        assert_eq!(all, vec![item(3, "/c")]);
    }

    #[tokio::test]
    async fn test_waiting_on_file_lock_leaves_runtime_free() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = Arc::new(StorageManager::open(&StorageConfig::at(dir.path())).unwrap());

        // Another process holds the queue's writer lock.
        let held = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(dir.path().join("queue.lock"))
            .unwrap();
        fs2::FileExt::lock_exclusive(&held).unwrap();

        let write = tokio::spawn({
            let storage = storage.clone();
            async move { storage.add_item(StoreName::Queue, &item(1, "/a")).await }
        });

        // Single-threaded runtime: this only wakes if the write is parked off-thread.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!write.is_finished());

        fs2::FileExt::unlock(&held).unwrap();
        write.await.unwrap().unwrap();
        let all: Vec<Item> = storage.get_all(StoreName::Queue).await.unwrap();
        assert_eq!(all, vec![item(1, "/a")]);
    }

    #[tokio::test]
    async fn test_concurrent_writers_do_not_lose_updates() {
        let storage = Arc::new(manager());
        let mut handles = Vec::new();
        for i in 0..20 {
            let storage = storage.clone();
            handles.push(tokio::spawn(async move {
                storage.add_item(StoreName::Queue, &item(i, "/x")).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let all: Vec<Item> = storage.get_all(StoreName::Queue).await.unwrap();
        assert_eq!(all.len(), 20);
    }
}
