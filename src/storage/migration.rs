//! Startup schema migrations.
//!
//! Every store carries a version marker. A store without a marker is either
//! brand new (no records: stamped with [`SCHEMA_VERSION`] directly) or was
//! written before markers existed (records present: treated as version 1).
//! Migrations rewrite the whole store and stamp the new version in the same
//! adapter call, so an interrupted run is simply repeated on the next start.

use super::adapter::StorageAdapter;
use super::scheme::{StorageRecord, StoreName, SCHEMA_VERSION};
use crate::error::{StorageError, StorageResult};
use serde_json::Value;
use tracing::info;

/// One step moving a store from `version - 1` to `version`.
pub struct Migration {
    pub store: StoreName,
    pub version: u32,
    pub description: &'static str,
    /// Must be idempotent: applying it to an already-migrated value is a no-op.
    pub apply: fn(Value) -> Value,
}

/// All known migrations, in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        store: StoreName::Queue,
        version: 2,
        description: "rename timestamp to created_at, default retry_count",
        apply: queue_v2,
    },
    Migration {
        store: StoreName::ActivityState,
        version: 2,
        description: "rename lastActive to last_active",
        apply: activity_state_v2,
    },
];

fn rename_field(value: &mut Value, from: &str, to: &str) {
    if let Value::Object(map) = value {
        if let Some(v) = map.remove(from) {
            map.entry(to.to_string()).or_insert(v);
        }
    }
}

fn queue_v2(mut value: Value) -> Value {
    rename_field(&mut value, "timestamp", "created_at");
    if let Value::Object(map) = &mut value {
        map.entry("retry_count").or_insert(Value::from(0));
    }
    value
}

fn activity_state_v2(mut value: Value) -> Value {
    rename_field(&mut value, "lastActive", "last_active");
    value
}

/// Bring every store up to [`SCHEMA_VERSION`].
pub fn run(adapter: &dyn StorageAdapter) -> StorageResult<()> {
    for store in StoreName::ALL {
        migrate_store(adapter, store)?;
    }
    Ok(())
}

fn migrate_store(adapter: &dyn StorageAdapter, store: StoreName) -> StorageResult<()> {
    let stored = adapter.schema_version(store)?;

    if stored > SCHEMA_VERSION {
        return Err(StorageError::SchemaMismatch {
            store: store.to_string(),
            stored,
            supported: SCHEMA_VERSION,
        });
    }
    if stored == SCHEMA_VERSION {
        return Ok(());
    }

    let records = adapter.get_all(store)?;
    let from = if stored == 0 && !records.is_empty() {
        1
    } else {
        stored
    };

    if records.is_empty() {
        return adapter.rewrite(store, Vec::new(), SCHEMA_VERSION);
    }

    let steps: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| m.store == store && m.version > from && m.version <= SCHEMA_VERSION)
        .collect();

    let mut values: Vec<Value> = records.into_iter().map(|r| r.value).collect();
    for step in &steps {
        info!(%store, version = step.version, "Migrating: {}", step.description);
        values = values.into_iter().map(step.apply).collect();
    }

    // Keys may come from renamed fields.
    let migrated = values
        .into_iter()
        .map(|value| StorageRecord::new(store, value))
        .collect::<StorageResult<Vec<_>>>()?;

    adapter.rewrite(store, migrated, SCHEMA_VERSION)
}
