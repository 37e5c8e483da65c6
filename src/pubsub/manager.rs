//! Topic bus for broadcasting state changes between components.

use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::types::{BusEvent, Handler, SubscriptionHandle, SubscriptionId};

/// Where a subscription's events go.
#[derive(Clone)]
enum Sink {
    Handler(Handler),
    Channel(Sender<BusEvent>),
}

/// Internal subscription state.
struct Subscription {
    topic: String,
    sink: Sink,
}

/// In-process publish/subscribe bus.
///
/// Delivery is synchronous and follows subscription order. Handlers run
/// without the subscription lock held, so they may subscribe, unsubscribe or
/// publish themselves.
pub struct PubSub {
    /// Active subscriptions, ordered by id.
    subscriptions: RwLock<BTreeMap<SubscriptionId, Subscription>>,
    /// Counter for generating subscription ids.
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

impl PubSub {
    pub fn new() -> Self {
        Self {
            subscriptions: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            destroyed: AtomicBool::new(false),
        }
    }

    fn insert(&self, topic: &str, sink: Sink) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.write().insert(
            id,
            Subscription {
                topic: topic.to_string(),
                sink,
            },
        );
        id
    }

    /// Register a callback for `topic`.
    pub fn subscribe<F>(&self, topic: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&str, &Value) + Send + Sync + 'static,
    {
        self.insert(topic, Sink::Handler(Arc::new(handler)))
    }

    /// Register a bounded channel for `topic`.
    ///
    /// If the channel fills up the subscription is dropped.
    pub fn subscribe_channel(&self, topic: &str, buffer_size: usize) -> SubscriptionHandle {
        let (sender, receiver) = bounded(buffer_size);
        let id = self.insert(topic, Sink::Channel(sender));
        SubscriptionHandle { id, receiver }
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions.write().remove(&id).is_some()
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Deliver `payload` to every subscriber of `topic`.
    ///
    /// Returns how many subscribers received it. After [`destroy`](Self::destroy)
    /// this does nothing.
    pub fn publish(&self, topic: &str, payload: &Value) -> usize {
        if self.destroyed.load(Ordering::SeqCst) {
            debug!(topic, "Publish after destroy ignored");
            return 0;
        }

        let sinks: Vec<(SubscriptionId, Sink)> = self
            .subscriptions
            .read()
            .iter()
            .filter(|(_, sub)| sub.topic == topic)
            .map(|(id, sub)| (*id, sub.sink.clone()))
            .collect();

        let mut delivered = 0;
        let mut to_remove = Vec::new();

        for (id, sink) in sinks {
            match sink {
                Sink::Handler(handler) => {
                    let result = catch_unwind(AssertUnwindSafe(|| handler(topic, payload)));
                    match result {
                        Ok(()) => delivered += 1,
                        Err(_) => error!(topic, subscription = id.0, "Subscriber panicked"),
                    }
                }
                Sink::Channel(sender) => {
                    let event = BusEvent {
                        topic: topic.to_string(),
                        payload: payload.clone(),
                    };
                    match sender.try_send(event) {
                        Ok(()) => delivered += 1,
                        Err(TrySendError::Full(_)) => {
                            warn!(topic, subscription = id.0, "Dropping slow subscriber");
                            to_remove.push(id);
                        }
                        Err(TrySendError::Disconnected(_)) => to_remove.push(id),
                    }
                }
            }
        }

        // Remove dropped subscriptions
        if !to_remove.is_empty() {
            let mut subs = self.subscriptions.write();
            for id in to_remove {
                subs.remove(&id);
            }
        }

        delivered
    }

    /// Remove every subscription and turn later publishes into no-ops.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.subscriptions.write().clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Default for PubSub {
    fn default() -> Self {
        Self::new()
    }
}
