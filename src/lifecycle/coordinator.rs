//! Cross-component lifecycle transitions.
//!
//! The coordinator owns the queue, the reconciler and the identity and routes
//! privacy requests (GDPR forget-me, third-party sharing opt-out) through the
//! queue. Their confirmation arrives as a `queue:delivered` event, after which
//! the coordinator applies the state change to every component.

use crate::attribution::{AttributionReconciler, AttributionResponse};
use crate::context::SdkContext;
use crate::error::Result;
use crate::identity::Identity;
use crate::pubsub::{topics, SubscriptionId};
use crate::queue::{Delivered, DeliveryQueue};
use crate::transport::Request;
use crate::types::DisableReason;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use super::state::ThirdPartySharingStatus;

/// Endpoint confirming a GDPR forget-me request.
pub const GDPR_FORGET_ENDPOINT: &str = "/gdpr_forget_device";

/// Endpoint confirming a third-party sharing opt-out.
pub const THIRD_PARTY_SHARING_ENDPOINT: &str = "/disable_third_party_sharing";

pub struct LifecycleCoordinator {
    ctx: Arc<SdkContext>,
    queue: DeliveryQueue,
    reconciler: AttributionReconciler,
    identity: Identity,
    started: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionId>>,
}

/// Run `work` on the current runtime, logging its failure.
fn spawn_logged<F>(what: &'static str, work: F)
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = work.await {
                    error!(error = %e, "{} failed", what);
                }
            });
        }
        Err(_) => warn!("No async runtime, {} skipped", what),
    }
}

impl LifecycleCoordinator {
    pub fn new(ctx: Arc<SdkContext>) -> Arc<Self> {
        Arc::new(Self {
            queue: DeliveryQueue::new(ctx.clone()),
            reconciler: AttributionReconciler::new(ctx.clone()),
            identity: Identity::new(ctx.clone()),
            ctx,
            started: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Arc<SdkContext> {
        &self.ctx
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn reconciler(&self) -> &AttributionReconciler {
        &self.reconciler
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Load the identity, start the queue and run privacy requests that were
    /// made before start or left unconfirmed by an earlier session.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("Already started");
            return Ok(());
        }

        if !self.ctx.lifecycle.is_gdpr_forgotten() {
            self.identity.start().await?;
        }

        let delivered = self.ctx.bus.subscribe(topics::QUEUE_DELIVERED, {
            let weak = Arc::downgrade(self);
            move |_: &str, payload: &Value| on_delivered_event(&weak, payload)
        });
        let check = self.ctx.bus.subscribe(topics::ATTRIBUTION_CHECK, {
            let weak = Arc::downgrade(self);
            move |_: &str, payload: &Value| on_check_event(&weak, payload)
        });
        self.subscriptions.lock().extend([delivered, check]);

        if !self.ctx.lifecycle.is_gdpr_forgotten() {
            self.queue.start();
        }
        self.run_pending().await
    }

    /// Queue a tracked request. Returns `false` while the SDK is disabled.
    pub async fn track(&self, request: Request) -> Result<bool> {
        if !self.ctx.lifecycle.is_enabled() {
            info!(url = %request.url, "SDK is disabled, request not tracked");
            return Ok(false);
        }
        self.identity.persist().await?;
        self.queue.push(request).await
    }

    /// Disable the SDK until [`enable`](Self::enable) is called.
    pub async fn disable(&self) -> Result<bool> {
        if !self.ctx.lifecycle.disable(DisableReason::General) {
            return Ok(false);
        }
        self.reconciler.destroy();
        self.ctx.persist_lifecycle().await?;
        Ok(true)
    }

    /// Re-enable after [`disable`](Self::disable). Never undoes a GDPR forget.
    pub async fn enable(&self) -> Result<bool> {
        if !self.ctx.lifecycle.enable() {
            return Ok(false);
        }
        self.ctx.persist_lifecycle().await?;
        if self.is_started() {
            self.run_pending().await?;
        }
        Ok(true)
    }

    /// Ask the backend to forget this device.
    ///
    /// The SDK is disabled for good once the backend confirms.
    pub async fn gdpr_forget_me(&self) -> Result<bool> {
        let lifecycle = &self.ctx.lifecycle;

        if lifecycle.is_gdpr_forgotten() {
            info!("SDK is already GDPR forgotten");
            return Ok(false);
        }
        if !lifecycle.mark_gdpr_forget_pending() {
            info!("SDK already sent GDPR Forget Me request");
            return Ok(false);
        }
        self.ctx.persist_lifecycle().await?;

        if !self.is_started() {
            info!("SDK will run GDPR Forget Me request after initialisation");
            return Ok(true);
        }

        self.push_privacy_request(GDPR_FORGET_ENDPOINT).await?;
        Ok(true)
    }

    /// Ask the backend to stop sharing data with third parties.
    pub async fn disable_third_party_sharing(&self) -> Result<bool> {
        let lifecycle = &self.ctx.lifecycle;

        match lifecycle.third_party_sharing_status() {
            ThirdPartySharingStatus::Pending => {
                info!("SDK already queued third-party sharing opt-out request");
                return Ok(false);
            }
            ThirdPartySharingStatus::Off => {
                info!("Third-party sharing opt-out is already done");
                return Ok(false);
            }
            ThirdPartySharingStatus::On => {}
        }

        lifecycle.mark_third_party_sharing_pending();
        self.ctx.persist_lifecycle().await?;

        if !self.is_started() {
            info!("SDK will run third-party sharing opt-out request after initialisation");
            return Ok(true);
        }

        self.push_privacy_request(THIRD_PARTY_SHARING_ENDPOINT).await?;
        Ok(true)
    }

    async fn push_privacy_request(&self, endpoint: &str) -> Result<()> {
        if self.queue.pending().await?.iter().any(|e| e.url == endpoint) {
            debug!(endpoint, "Request already queued");
            return Ok(());
        }
        if !self.queue.push(Request::post(endpoint)).await? {
            info!(endpoint, "Request will be sent once the SDK is enabled");
        }
        Ok(())
    }

    /// Issue privacy requests that are marked pending but not yet confirmed.
    async fn run_pending(&self) -> Result<()> {
        let lifecycle = &self.ctx.lifecycle;

        if lifecycle.is_gdpr_forget_pending() && !lifecycle.is_gdpr_forgotten() {
            info!("SDK is running pending GDPR Forget Me request");
            self.push_privacy_request(GDPR_FORGET_ENDPOINT).await?;
        }
        if lifecycle.third_party_sharing_status() == ThirdPartySharingStatus::Pending {
            info!("SDK is running pending third-party sharing opt-out request");
            self.push_privacy_request(THIRD_PARTY_SHARING_ENDPOINT).await?;
        }
        Ok(())
    }

    async fn on_delivered(&self, delivered: Delivered) -> Result<()> {
        match delivered.url.as_str() {
            GDPR_FORGET_ENDPOINT => self.forget_device().await?,
            THIRD_PARTY_SHARING_ENDPOINT => self.finish_third_party_sharing().await?,
            _ => {}
        }

        if delivered.response.get("ask_in").is_some() && self.ctx.lifecycle.is_enabled() {
            self.ctx
                .bus
                .publish(topics::ATTRIBUTION_CHECK, &delivered.response);
        }
        Ok(())
    }

    /// Apply a confirmed GDPR forget-me to every component.
    async fn forget_device(&self) -> Result<()> {
        self.ctx.lifecycle.confirm_gdpr_forget();

        self.queue.clear().await?;
        self.queue.destroy();
        self.reconciler.destroy();
        self.reconciler.forget().await?;
        self.identity.clear().await?;
        self.ctx.persist_lifecycle().await?;

        info!("SDK has been GDPR forgotten");
        self.ctx.bus.publish(topics::GDPR_FORGET_ME, &json!({}));
        Ok(())
    }

    async fn finish_third_party_sharing(&self) -> Result<()> {
        if !self.ctx.lifecycle.finish_third_party_sharing() {
            return Ok(());
        }
        self.ctx.persist_lifecycle().await?;
        self.ctx
            .bus
            .publish(topics::THIRD_PARTY_SHARING_OPT_OUT, &json!({}));
        Ok(())
    }

    /// Stop every component. Persisted state is kept.
    pub fn destroy(&self) {
        for id in self.subscriptions.lock().drain(..) {
            self.ctx.bus.unsubscribe(id);
        }
        self.queue.destroy();
        self.reconciler.destroy();
        self.identity.destroy();
        self.ctx.bus.destroy();
        self.started.store(false, Ordering::SeqCst);
        info!("SDK instance has been destroyed");
    }
}

fn on_delivered_event(weak: &Weak<LifecycleCoordinator>, payload: &Value) {
    let Some(this) = weak.upgrade() else {
        return;
    };
    match serde_json::from_value::<Delivered>(payload.clone()) {
        Ok(delivered) => spawn_logged("Delivery handling", async move {
            this.on_delivered(delivered).await
        }),
        Err(e) => warn!(error = %e, "Malformed delivery event"),
    }
}

fn on_check_event(weak: &Weak<LifecycleCoordinator>, payload: &Value) {
    let Some(this) = weak.upgrade() else {
        return;
    };
    let hint = match serde_json::from_value::<AttributionResponse>(payload.clone()) {
        Ok(hint) => hint,
        Err(e) => {
            warn!(error = %e, "Malformed attribution hint");
            return;
        }
    };

    let params = this.ctx.config.base_params.clone();
    let pending = this.reconciler.check_attribution(hint, params);
    spawn_logged("Attribution check", async move {
        pending.await?;
        Ok(())
    });
}
