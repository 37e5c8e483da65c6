//! Keyed record storage with pluggable backing adapters.
//!
//! The storage layer exposes four named stores (`activity_state`, `queue`,
//! `attribution`, `preferences`) through an async [`StorageManager`]. At
//! startup a capability probe selects one backing adapter:
//!
//! - [`StructuredAdapter`]: per-store append-only logs with per-record writes
//! - [`KeyValueAdapter`]: a flat string map, whole-collection read-modify-write
//!
//! Schema migrations run once when the manager is opened.
//!
//! # Example
//!
//! ```ignore
//! let storage = StorageManager::open(&StorageConfig::at("./sdk-data"))?;
//!
//! storage.add_item(StoreName::Queue, &entry).await?;
//! let head: Option<QueueEntry> = storage.get_first(StoreName::Queue).await?;
//! ```

mod adapter;
mod keyvalue;
mod manager;
pub mod migration;
mod scheme;
mod structured;

pub use adapter::{probe, AdapterKind, StorageAdapter, KV_FILE};
pub use keyvalue::{FileKv, KeyValueAdapter, KeyValueBackend, MemoryKv};
pub use manager::StorageManager;
pub use scheme::{KeyPath, StorageKey, StorageRecord, StoreName, SCHEMA_VERSION};
pub use structured::StructuredAdapter;
