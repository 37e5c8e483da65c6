//! SDK configuration.

use crate::error::{Result, SdkError};
use crate::types::Params;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which storage adapter to use.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterPreference {
    /// Probe capabilities: structured, then file key/value, then memory.
    #[default]
    Auto,
    Structured,
    KeyValue,
    Memory,
}

/// Storage configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for on-disk stores. `None` keeps everything in memory.
    pub path: Option<PathBuf>,

    /// Adapter selection.
    pub adapter: AdapterPreference,

    /// Max bytes per store before writes fail with `QuotaExceeded`.
    /// Default: 5MB
    pub quota_bytes: usize,

    /// Compact a structured store log after this many appended entries.
    /// Default: 256
    pub compact_after: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: None,
            adapter: AdapterPreference::Auto,
            quota_bytes: 5 * 1024 * 1024, // 5MB
            compact_after: 256,
        }
    }
}

impl StorageConfig {
    /// Volatile storage, mostly useful in tests.
    pub fn in_memory() -> Self {
        Self {
            adapter: AdapterPreference::Memory,
            ..Default::default()
        }
    }

    /// Persistent storage rooted at `path`.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            ..Default::default()
        }
    }
}

/// Retry backoff: the n-th consecutive failure waits `min(n * step, max)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub step_ms: u64,
    pub max_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            step_ms: 100,
            max_ms: 300,
        }
    }
}

impl BackoffConfig {
    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }
}

/// Top-level SDK configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub storage: StorageConfig,
    pub backoff: BackoffConfig,

    /// Base parameters sent with every attribution poll.
    pub base_params: Params,
}

impl SdkConfig {
    /// Parse a JSON config document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SdkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SdkError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }

    fn validate(&self) -> Result<()> {
        if self.backoff.step_ms == 0 {
            return Err(SdkError::Config("backoff.step_ms must be positive".into()));
        }
        if self.backoff.max_ms < self.backoff.step_ms {
            return Err(SdkError::Config(
                "backoff.max_ms must be at least backoff.step_ms".into(),
            ));
        }
        if self.storage.adapter == AdapterPreference::Structured && self.storage.path.is_none() {
            return Err(SdkError::Config(
                "structured storage requires storage.path".into(),
            ));
        }
        Ok(())
    }
}
