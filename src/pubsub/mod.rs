//! In-process pub/sub bus.
//!
//! Components announce state changes on named topics instead of calling each
//! other directly. Subscribers are either callbacks, invoked synchronously
//! inside `publish`, or bounded channels for consumers on other threads.
//!
//! # Example
//!
//! ```ignore
//! let bus = PubSub::new();
//!
//! let id = bus.subscribe(topics::ATTRIBUTION_CHANGE, |_, attribution| {
//!     println!("New attribution: {}", attribution);
//! });
//!
//! bus.publish(topics::ATTRIBUTION_CHANGE, &json!({"network": "organic"}));
//! bus.unsubscribe(id);
//! ```

mod manager;
mod types;

pub use manager::PubSub;
pub use types::{topics, BusEvent, Handler, SubscriptionHandle, SubscriptionId};
