//! Error types for the SDK core.

use std::fmt;
use thiserror::Error;

/// Coarse classification of storage failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageErrorKind {
    NotFound,
    AdapterUnavailable,
    QuotaExceeded,
    SchemaMismatch,
}

/// Errors raised by the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found in {store}: {key}")]
    NotFound { store: String, key: String },

    #[error("Storage adapter unavailable: {0}")]
    AdapterUnavailable(String),

    #[error("Quota exceeded for {store}: {size} bytes (limit {limit})")]
    QuotaExceeded {
        store: String,
        size: usize,
        limit: usize,
    },

    #[error("Schema mismatch in {store}: stored version {stored}, supported {supported}")]
    SchemaMismatch {
        store: String,
        stored: u32,
        supported: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),
}

impl StorageError {
    /// Map the error onto the four storage failure kinds callers branch on.
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            StorageError::NotFound { .. } => StorageErrorKind::NotFound,
            StorageError::AdapterUnavailable(_) | StorageError::Io(_) => {
                StorageErrorKind::AdapterUnavailable
            }
            StorageError::QuotaExceeded { .. } => StorageErrorKind::QuotaExceeded,
            StorageError::SchemaMismatch { .. }
            | StorageError::Serialization(_)
            | StorageError::Deserialization(_)
            | StorageError::ChecksumMismatch { .. }
            | StorageError::InvalidFormat(_) => StorageErrorKind::SchemaMismatch,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == StorageErrorKind::NotFound
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(e: tokio::task::JoinError) -> Self {
        StorageError::AdapterUnavailable(format!("storage task failed: {}", e))
    }
}

impl Clone for StorageError {
    fn clone(&self) -> Self {
        match self {
            StorageError::NotFound { store, key } => StorageError::NotFound {
                store: store.clone(),
                key: key.clone(),
            },
            StorageError::AdapterUnavailable(msg) => StorageError::AdapterUnavailable(msg.clone()),
            StorageError::QuotaExceeded { store, size, limit } => StorageError::QuotaExceeded {
                store: store.clone(),
                size: *size,
                limit: *limit,
            },
            StorageError::SchemaMismatch {
                store,
                stored,
                supported,
            } => StorageError::SchemaMismatch {
                store: store.clone(),
                stored: *stored,
                supported: *supported,
            },
            // io::Error is not Clone; keep its kind and message.
            StorageError::Io(e) => StorageError::Io(std::io::Error::new(e.kind(), e.to_string())),
            StorageError::Serialization(msg) => StorageError::Serialization(msg.clone()),
            StorageError::Deserialization(msg) => StorageError::Deserialization(msg.clone()),
            StorageError::ChecksumMismatch { expected, got } => StorageError::ChecksumMismatch {
                expected: *expected,
                got: *got,
            },
            StorageError::InvalidFormat(msg) => StorageError::InvalidFormat(msg.clone()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StorageError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StorageError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StorageError::Deserialization(e.to_string())
    }
}

/// Failure reported by the transport collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub struct TransportError {
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "Transport error ({}): {}", status, self.message),
            None => write!(f, "Transport error: {}", self.message),
        }
    }
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }
}

/// Top-level error type for SDK operations.
#[derive(Clone, Debug, Error)]
pub enum SdkError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for SdkError {
    fn from(e: serde_json::Error) -> Self {
        SdkError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type for SDK operations.
pub type Result<T> = std::result::Result<T, SdkError>;
