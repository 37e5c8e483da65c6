//! Durable FIFO of outbound requests with a single send loop.

use super::types::{Delivered, QueueEntry};
use crate::backoff::Backoff;
use crate::context::SdkContext;
use crate::error::Result;
use crate::pubsub::topics;
use crate::storage::StoreName;
use crate::transport::Request;
use crate::types::Timestamp;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared between the queue handle and its send loop.
struct Shared {
    ctx: Arc<SdkContext>,
    offline: watch::Sender<bool>,
    /// Signalled when an entry is pushed.
    wake: Notify,
    /// Bumped by `clear`; responses from an older generation are discarded.
    generation: AtomicU64,
    /// Last `created_at` handed out.
    last_key: Mutex<i64>,
}

struct Worker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Outbound request queue.
///
/// Entries are persisted in the `queue` store and sent one at a time, oldest
/// first, while the SDK is enabled and not offline. A failed send is retried
/// with backoff until it succeeds or the queue is cleared.
pub struct DeliveryQueue {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl DeliveryQueue {
    pub fn new(ctx: Arc<SdkContext>) -> Self {
        let (offline, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                ctx,
                offline,
                wake: Notify::new(),
                generation: AtomicU64::new(0),
                last_key: Mutex::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Start the send loop if it is not running. Entries persisted by an
    /// earlier session are sent first.
    pub fn start(&self) {
        let mut worker = self.worker.lock();
        if let Some(w) = worker.as_ref() {
            if !w.handle.is_finished() && !w.token.is_cancelled() {
                return;
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run(self.shared.clone(), token.clone()));
        *worker = Some(Worker { token, handle });
        debug!("Queue send loop started");
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map(|w| !w.handle.is_finished() && !w.token.is_cancelled())
            .unwrap_or(false)
    }

    /// Persist `request` and wake the send loop.
    ///
    /// Returns `false` without queueing anything while the SDK is disabled.
    pub async fn push(&self, request: Request) -> Result<bool> {
        if let Some(reason) = self.shared.ctx.lifecycle.disabled_reason() {
            info!(url = %request.url, %reason, "SDK is disabled, request not queued");
            return Ok(false);
        }

        let created_at = {
            let mut last = self.shared.last_key.lock();
            let key = Timestamp::now().0.max(*last + 1);
            *last = key;
            key
        };

        // Another context sharing the store may have taken the key.
        let mut entry = QueueEntry::new(request, created_at);
        loop {
            let taken = self
                .shared
                .ctx
                .storage
                .insert_item(StoreName::Queue, &entry)
                .await?;
            let Some(taken) = taken else { break };
            debug!(created_at = taken.created_at, "Queue key taken, bumping");
            entry.created_at += 1;
        }
        {
            let mut last = self.shared.last_key.lock();
            *last = (*last).max(entry.created_at);
        }
        debug!(url = %entry.url, created_at = entry.created_at, "Request queued");

        self.start();
        self.shared.wake.notify_one();
        Ok(true)
    }

    /// Pause or resume sending. Queued entries are kept either way.
    pub fn set_offline(&self, offline: bool) {
        let previous = self.shared.offline.send_replace(offline);
        if previous == offline {
            return;
        }
        if offline {
            info!("The queue is paused (offline)");
        } else {
            info!("The queue is resumed (online)");
        }
    }

    pub fn is_offline(&self) -> bool {
        *self.shared.offline.borrow()
    }

    /// Drop every queued entry. An in-flight send may still reach the
    /// backend, but its result is discarded.
    pub async fn clear(&self) -> Result<()> {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.ctx.storage.clear(StoreName::Queue).await?;
        info!("Queue cleared");
        Ok(())
    }

    /// Entries waiting to be sent, oldest first.
    pub async fn pending(&self) -> Result<Vec<QueueEntry>> {
        Ok(self.shared.ctx.storage.get_all(StoreName::Queue).await?)
    }

    /// Stop the send loop. Persisted entries stay for the next session.
    pub fn destroy(&self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.token.cancel();
            debug!("Queue send loop stopped");
        }
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Wait until the queue may send. Returns `false` when cancelled.
async fn wait_until_open(
    token: &CancellationToken,
    offline: &mut watch::Receiver<bool>,
    lifecycle: &mut watch::Receiver<crate::lifecycle::LifecycleState>,
) -> bool {
    loop {
        let blocked =
            *offline.borrow_and_update() || lifecycle.borrow_and_update().disabled.is_some();
        if !blocked {
            return true;
        }

        tokio::select! {
            _ = token.cancelled() => return false,
            changed = offline.changed() => if changed.is_err() { return false },
            changed = lifecycle.changed() => if changed.is_err() { return false },
        }
    }
}

async fn run(shared: Arc<Shared>, token: CancellationToken) {
    let ctx = &shared.ctx;
    let mut backoff = Backoff::new(ctx.config.backoff);
    let mut offline = shared.offline.subscribe();
    let mut lifecycle = ctx.lifecycle.watch();

    loop {
        if !wait_until_open(&token, &mut offline, &mut lifecycle).await {
            return;
        }

        let generation = shared.generation.load(Ordering::SeqCst);
        let head: Option<QueueEntry> = match ctx.storage.get_first(StoreName::Queue).await {
            Ok(head) => head,
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    error = %e,
                    attempt = backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Could not read queue"
                );
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }
        };

        let Some(mut entry) = head else {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = shared.wake.notified() => {}
            }
            continue;
        };

        let request = entry.request();
        debug!(url = %entry.url, retry_count = entry.retry_count, "Sending request");
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = ctx.transport.request(&request) => result,
        };

        if shared.generation.load(Ordering::SeqCst) != generation {
            debug!(url = %entry.url, "Queue was cleared, response discarded");
            continue;
        }

        match result {
            Ok(response) => {
                backoff.reset();
                match ctx.storage.delete_item(StoreName::Queue, entry.created_at).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => error!(error = %e, url = %entry.url, "Could not remove sent request"),
                }
                info!(url = %entry.url, "Request delivered");

                let delivered = Delivered {
                    url: entry.url,
                    method: entry.method,
                    params: entry.params,
                    response,
                };
                match serde_json::to_value(&delivered) {
                    Ok(payload) => {
                        ctx.bus.publish(topics::QUEUE_DELIVERED, &payload);
                    }
                    Err(e) => error!(error = %e, "Could not encode delivery"),
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                entry.retry_count += 1;
                warn!(
                    url = %entry.url,
                    retry_count = entry.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Request failed, retrying"
                );

                match ctx.storage.update_item(StoreName::Queue, &entry).await {
                    Ok(_) => {}
                    // Cleared meanwhile.
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => error!(error = %e, url = %entry.url, "Could not update retry count"),
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
