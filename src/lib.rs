//! # Attribution SDK core
//!
//! Delivery and state coordination for an install attribution SDK.
//!
//! ## Core Concepts
//!
//! - **Storage**: keyed record stores behind a probed backing adapter
//! - **Pub/Sub**: in-process topic bus between decoupled components
//! - **Lifecycle**: enabled / disabled / GDPR-forgotten, consulted before every side effect
//! - **Queue**: durable, ordered, retried outbound requests
//! - **Attribution**: server-directed polling with change detection
//!
//! ## Example
//!
//! ```ignore
//! use attribution_sdk::{LifecycleCoordinator, Request, SdkConfig, SdkContext, StorageConfig};
//!
//! let config = SdkConfig {
//!     storage: StorageConfig::at("./sdk-data"),
//!     ..Default::default()
//! };
//! let ctx = SdkContext::open(config, Arc::new(my_transport)).await?;
//! let sdk = LifecycleCoordinator::new(ctx);
//! sdk.start().await?;
//!
//! sdk.track(Request::post("/event").with_params(params)).await?;
//! sdk.queue().set_offline(true);
//! sdk.gdpr_forget_me().await?;
//! ```

pub mod attribution;
pub mod backoff;
pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod pubsub;
pub mod queue;
pub mod storage;
pub mod transport;
pub mod types;

// Re-exports
pub use attribution::{Attribution, AttributionData, AttributionReconciler, AttributionResponse};
pub use backoff::Backoff;
pub use config::{AdapterPreference, BackoffConfig, SdkConfig, StorageConfig};
pub use context::SdkContext;
pub use error::{Result, SdkError, StorageError, StorageErrorKind, StorageResult, TransportError};
pub use identity::Identity;
pub use lifecycle::{
    Lifecycle, LifecycleCoordinator, LifecycleState, Status, ThirdPartySharingStatus,
};
pub use pubsub::{topics, BusEvent, PubSub, SubscriptionHandle, SubscriptionId};
pub use queue::{Delivered, DeliveryQueue, QueueEntry};
pub use storage::{AdapterKind, StorageAdapter, StorageKey, StorageManager, StorageRecord, StoreName};
pub use transport::{Method, Request, Transport};
pub use types::*;
