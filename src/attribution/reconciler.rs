//! Server-directed attribution polling.
//!
//! A cycle moves `Idle -> Scheduled -> InFlight -> {Idle | Scheduled}`. Only
//! one timer and at most one request exist at a time. Every cycle carries a
//! number; `destroy` bumps it, and any timer or response belonging to an
//! older cycle is ignored.

use super::types::{Attribution, AttributionResponse};
use crate::backoff::Backoff;
use crate::context::SdkContext;
use crate::error::{Result, SdkError};
use crate::pubsub::topics;
use crate::storage::StoreName;
use crate::transport::Request;
use crate::types::{Params, Timestamp};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Endpoint polled for attribution.
pub const ATTRIBUTION_ENDPOINT: &str = "/attribution";

/// Key of the single record in the `attribution` store.
const ATTRIBUTION_KEY: &str = "attribution";

type Waiter = oneshot::Sender<Result<AttributionResponse>>;

enum Phase {
    Idle,
    Scheduled(CancellationToken),
    InFlight,
}

struct Inner {
    phase: Phase,
    cycle: u64,
    params: Params,
    backoff: Backoff,
    waiters: Vec<Waiter>,
}

struct Shared {
    ctx: Arc<SdkContext>,
    inner: Mutex<Inner>,
}

/// Polls the attribution endpoint when the backend asks for it and persists
/// changed attributions.
pub struct AttributionReconciler {
    shared: Arc<Shared>,
}

impl AttributionReconciler {
    pub fn new(ctx: Arc<SdkContext>) -> Self {
        let backoff = Backoff::new(ctx.config.backoff);
        Self {
            shared: Arc::new(Shared {
                ctx,
                inner: Mutex::new(Inner {
                    phase: Phase::Idle,
                    cycle: 0,
                    params: Params::new(),
                    backoff,
                    waiters: Vec::new(),
                }),
            }),
        }
    }

    /// React to a server hint.
    ///
    /// Without `ask_in` the returned future resolves with `hint` and nothing is
    /// scheduled. With `ask_in` a poll is scheduled after that many
    /// milliseconds, replacing any timer that has not fired yet; if a poll is
    /// already in flight the caller shares its outcome instead. The future
    /// resolves once a terminal response arrives; transport failures are
    /// retried with backoff and never reach the caller.
    ///
    /// A timer firing while the SDK is disabled holds the poll until the SDK
    /// is enabled again. Fails with [`SdkError::Cancelled`] only if
    /// [`destroy`](Self::destroy) runs first.
    pub fn check_attribution(
        &self,
        hint: AttributionResponse,
        params: Params,
    ) -> impl Future<Output = Result<AttributionResponse>> + Send + 'static {
        let (tx, rx) = oneshot::channel();

        match hint.ask_in {
            None => {
                let _ = tx.send(Ok(hint));
            }
            Some(ask_in) => {
                let mut inner = self.shared.inner.lock();
                inner.params = params;
                inner.waiters.push(tx);

                if matches!(inner.phase, Phase::InFlight) {
                    debug!("Attribution request in flight, waiting for it");
                } else {
                    if let Phase::Scheduled(token) = &inner.phase {
                        token.cancel();
                    }
                    schedule(&self.shared, &mut inner, Duration::from_millis(ask_in));
                }
            }
        }

        async move { rx.await.unwrap_or(Err(SdkError::Cancelled)) }
    }

    /// The persisted attribution, if any.
    pub async fn current(&self) -> Result<Option<Attribution>> {
        Ok(self
            .shared
            .ctx
            .storage
            .get_item(StoreName::Attribution, ATTRIBUTION_KEY)
            .await?)
    }

    /// Delete the persisted attribution.
    pub async fn forget(&self) -> Result<()> {
        match self
            .shared
            .ctx
            .storage
            .delete_item(StoreName::Attribution, ATTRIBUTION_KEY)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a timer or request is outstanding.
    pub fn is_active(&self) -> bool {
        !matches!(self.shared.inner.lock().phase, Phase::Idle)
    }

    /// Cancel the pending timer and ignore any in-flight response. Pending
    /// `check_attribution` futures fail with [`SdkError::Cancelled`].
    pub fn destroy(&self) {
        let mut inner = self.shared.inner.lock();
        inner.cycle += 1;
        if let Phase::Scheduled(token) = &inner.phase {
            token.cancel();
        }
        inner.phase = Phase::Idle;
        inner.backoff.reset();
        inner.waiters.clear();
        debug!(cycle = inner.cycle, "Attribution polling cancelled");
    }
}

impl Drop for AttributionReconciler {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn schedule(shared: &Arc<Shared>, inner: &mut Inner, delay: Duration) {
    let token = CancellationToken::new();
    inner.phase = Phase::Scheduled(token.clone());
    debug!(delay_ms = delay.as_millis() as u64, "Attribution check scheduled");
    tokio::spawn(fire(shared.clone(), inner.cycle, token, delay));
}

/// Build the request parameters: `base` is flattened into the top level and
/// `created_at` is added.
fn request_params(params: &Params, now: Timestamp) -> Params {
    let mut out = Params::new();
    for (key, value) in params {
        match (key.as_str(), value) {
            ("base", Value::Object(base)) => {
                out.extend(base.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out.insert("created_at".to_string(), Value::from(now.to_created_at()));
    out
}

/// Finish the cycle and hand `outcome` to every waiter.
fn settle(inner: &mut Inner, outcome: Result<AttributionResponse>) {
    inner.phase = Phase::Idle;
    for waiter in inner.waiters.drain(..) {
        let _ = waiter.send(outcome.clone());
    }
}

async fn fire(shared: Arc<Shared>, cycle: u64, token: CancellationToken, delay: Duration) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut lifecycle = shared.ctx.lifecycle.watch();
    let params = loop {
        {
            let mut inner = shared.inner.lock();
            if token.is_cancelled() || inner.cycle != cycle {
                return;
            }
            if shared.ctx.lifecycle.is_enabled() {
                inner.phase = Phase::InFlight;
                break inner.params.clone();
            }
        }

        info!("SDK is disabled, attribution check waits until it is enabled");
        tokio::select! {
            _ = token.cancelled() => return,
            changed = lifecycle.changed() => if changed.is_err() { return },
        }
    };

    let request = Request::get(ATTRIBUTION_ENDPOINT).with_params(request_params(&params, Timestamp::now()));
    let result = shared.ctx.transport.request(&request).await;

    let response = {
        let mut inner = shared.inner.lock();
        if inner.cycle != cycle {
            debug!("Ignoring attribution response from a cancelled cycle");
            return;
        }

        let parsed = result.map_err(SdkError::from).and_then(|value| {
            serde_json::from_value::<AttributionResponse>(value).map_err(SdkError::from)
        });

        match parsed {
            Err(e) => {
                let delay = inner.backoff.next_delay();
                warn!(
                    error = %e,
                    attempt = inner.backoff.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Attribution request failed, retrying"
                );
                schedule(&shared, &mut inner, delay);
                return;
            }
            Ok(response) => {
                inner.backoff.reset();
                if let Some(ask_in) = response.ask_in {
                    schedule(&shared, &mut inner, Duration::from_millis(ask_in));
                    return;
                }
                response
            }
        }
    };

    let outcome = reconcile(&shared, cycle, &response).await;

    let mut inner = shared.inner.lock();
    if inner.cycle != cycle {
        return;
    }
    match outcome {
        Ok(()) => settle(&mut inner, Ok(response)),
        Err(e) => {
            error!(error = %e, "Could not store attribution");
            settle(&mut inner, Err(e));
        }
    }
}

/// Persist and announce `response` if it differs from the stored attribution.
async fn reconcile(shared: &Shared, cycle: u64, response: &AttributionResponse) -> Result<()> {
    let Some(attribution) = response.to_attribution() else {
        return Ok(());
    };

    let storage = &shared.ctx.storage;
    let stored: Option<Attribution> = storage
        .get_item(StoreName::Attribution, ATTRIBUTION_KEY)
        .await?;
    if stored.as_ref() == Some(&attribution) {
        debug!("Attribution unchanged");
        return Ok(());
    }

    // Checked under the store lock so a cancelled cycle cannot write after
    // the attribution was forgotten.
    let current = || shared.inner.lock().cycle == cycle;
    if !storage
        .add_item_if(StoreName::Attribution, &attribution, current)
        .await?
    {
        debug!("Ignoring attribution from a cancelled cycle");
        return Ok(());
    }

    if !current() {
        return Ok(());
    }
    info!(network = ?attribution.data.network, "Attribution changed");
    shared
        .ctx
        .bus
        .publish(topics::ATTRIBUTION_CHANGE, &serde_json::to_value(response)?);
    Ok(())
}
