//! Pub/sub types.

use serde_json::Value;
use std::sync::Arc;

/// Well-known topics.
pub mod topics {
    /// A changed attribution was persisted. Payload: the attribution.
    pub const ATTRIBUTION_CHANGE: &str = "attribution:change";
    /// A delivered response asked for an attribution check. Payload: the response.
    pub const ATTRIBUTION_CHECK: &str = "attribution:check";
    /// The queue delivered a request. Payload: `{url, method, params, response}`.
    pub const QUEUE_DELIVERED: &str = "queue:delivered";
    /// A GDPR forget-me request was confirmed.
    pub const GDPR_FORGET_ME: &str = "sdk:gdpr-forget-me";
    /// A third-party sharing opt-out was confirmed.
    pub const THIRD_PARTY_SHARING_OPT_OUT: &str = "sdk:third-party-sharing-opt-out";
}

/// Unique identifier for a subscription. Ids grow with subscription order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Callback invoked synchronously on publish.
pub type Handler = Arc<dyn Fn(&str, &Value) + Send + Sync>;

/// An event delivered to channel subscribers.
#[derive(Clone, Debug, PartialEq)]
pub struct BusEvent {
    pub topic: String,
    pub payload: Value,
}

/// Handle to a channel-backed subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<BusEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<BusEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<BusEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<BusEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
