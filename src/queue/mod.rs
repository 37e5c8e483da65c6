//! Delivery queue.
//!
//! Requests are persisted before they are sent, so a request pushed while
//! offline, or still pending when the process exits, is delivered later in
//! the original order. Every successful delivery is announced on
//! `queue:delivered`.

mod manager;
mod types;

pub use manager::DeliveryQueue;
pub use types::{Delivered, QueueEntry};
