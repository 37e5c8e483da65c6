//! Shared SDK context.
//!
//! One [`SdkContext`] owns the state every component consults: configuration,
//! storage, lifecycle, the pub/sub bus and the transport. Components receive an
//! `Arc<SdkContext>` at construction instead of reaching for globals.

use crate::config::SdkConfig;
use crate::error::{Result, StorageError};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::pubsub::PubSub;
use crate::storage::{StorageAdapter, StorageManager, StoreName};
use crate::transport::Transport;
use std::sync::Arc;
use tracing::debug;

pub struct SdkContext {
    pub config: SdkConfig,
    pub storage: StorageManager,
    pub lifecycle: Lifecycle,
    pub bus: PubSub,
    pub transport: Arc<dyn Transport>,
}

impl SdkContext {
    /// Open storage per `config` and restore the persisted lifecycle.
    ///
    /// Probing and migrations run on the blocking pool.
    pub async fn open(config: SdkConfig, transport: Arc<dyn Transport>) -> Result<Arc<Self>> {
        let storage_config = config.storage.clone();
        let storage = tokio::task::spawn_blocking(move || StorageManager::open(&storage_config))
            .await
            .map_err(StorageError::from)??;
        Self::assemble(config, storage, transport).await
    }

    /// Like [`open`](Self::open) with an explicit storage adapter.
    pub async fn with_adapter(
        config: SdkConfig,
        adapter: Arc<dyn StorageAdapter>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let storage = tokio::task::spawn_blocking(move || StorageManager::with_adapter(adapter))
            .await
            .map_err(StorageError::from)??;
        Self::assemble(config, storage, transport).await
    }

    async fn assemble(
        config: SdkConfig,
        storage: StorageManager,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let restored: Option<LifecycleState> = storage
            .get_item(StoreName::Preferences, "preferences")
            .await?;
        debug!(?restored, adapter = ?storage.adapter_kind(), "Context opened");

        Ok(Arc::new(Self {
            config,
            storage,
            lifecycle: Lifecycle::restore(restored.unwrap_or_default()),
            bus: PubSub::new(),
            transport,
        }))
    }

    /// Write the current lifecycle state to the `preferences` store.
    pub async fn persist_lifecycle(&self) -> Result<()> {
        self.storage
            .add_item(StoreName::Preferences, &self.lifecycle.snapshot())
            .await?;
        Ok(())
    }
}
