//! Enable/disable, GDPR forget-me and third-party sharing through the
//! coordinator.

mod common;

use attribution_sdk::{
    topics, ActivityState, DisableReason, LifecycleCoordinator, Request, SdkConfig, SdkContext,
    Status, StorageConfig, StoreName, ThirdPartySharingStatus,
};
use common::{advance, in_memory_config, in_memory_context, MockTransport};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

const GDPR: &str = "/gdpr_forget_device";
const THIRD_PARTY: &str = "/disable_third_party_sharing";

async fn started(transport: Arc<MockTransport>) -> Arc<LifecycleCoordinator> {
    let sdk = LifecycleCoordinator::new(in_memory_context(transport).await);
    sdk.start().await.unwrap();
    sdk
}

// --- Enable / disable ---

#[tokio::test(start_paused = true)]
async fn test_general_disable_then_enable() {
    let sdk = started(Arc::new(MockTransport::new())).await;

    assert!(sdk.disable().await.unwrap());
    assert!(!sdk.disable().await.unwrap());
    assert_eq!(
        sdk.context().lifecycle.status(),
        Status::Disabled(DisableReason::General)
    );

    assert!(sdk.enable().await.unwrap());
    assert!(!sdk.enable().await.unwrap());
    assert_eq!(sdk.context().lifecycle.status(), Status::Enabled);
}

#[tokio::test(start_paused = true)]
async fn test_track_is_dropped_while_disabled() {
    let transport = Arc::new(MockTransport::new());
    let sdk = started(transport.clone()).await;

    sdk.disable().await.unwrap();
    assert!(!sdk.track(Request::post("/event")).await.unwrap());
    advance(1_000).await;
    assert!(transport.urls().is_empty());
    assert!(sdk.queue().pending().await.unwrap().is_empty());

    sdk.enable().await.unwrap();
    assert!(sdk.track(Request::post("/event")).await.unwrap());
    advance(100).await;
    assert_eq!(transport.urls(), vec!["/event"]);
}

#[tokio::test(start_paused = true)]
async fn test_disable_holds_queued_entries() {
    let transport = Arc::new(MockTransport::new());
    let sdk = started(transport.clone()).await;

    sdk.queue().set_offline(true);
    sdk.track(Request::post("/event")).await.unwrap();
    sdk.disable().await.unwrap();
    sdk.queue().set_offline(false);
    advance(1_000).await;
    assert!(transport.urls().is_empty());

    sdk.enable().await.unwrap();
    advance(100).await;
    assert_eq!(transport.urls(), vec!["/event"]);
}

#[tokio::test(start_paused = true)]
async fn test_disable_is_persisted() {
    let dir = TempDir::new().unwrap();
    let config = SdkConfig {
        storage: StorageConfig::at(dir.path()),
        ..Default::default()
    };

    {
        let ctx = SdkContext::open(config.clone(), Arc::new(MockTransport::new()))
            .await
            .unwrap();
        let sdk = LifecycleCoordinator::new(ctx);
        sdk.start().await.unwrap();
        sdk.disable().await.unwrap();
        sdk.destroy();
    }

    let ctx = SdkContext::open(config, Arc::new(MockTransport::new()))
        .await
        .unwrap();
    assert_eq!(
        ctx.lifecycle.status(),
        Status::Disabled(DisableReason::General)
    );
}

// --- GDPR forget-me ---

#[tokio::test(start_paused = true)]
async fn test_gdpr_forget_disables_for_good() {
    let transport = Arc::new(MockTransport::new());
    let sdk = started(transport.clone()).await;
    let ctx = sdk.context().clone();
    let forgotten = ctx.bus.subscribe_channel(topics::GDPR_FORGET_ME, 10);

    ctx.storage
        .add_item(StoreName::Attribution, &json!({"adid": "123", "network": "n"}))
        .await
        .unwrap();
    let uuid = sdk.identity().current().unwrap().uuid;
    assert_ne!(uuid, "unknown");

    assert!(sdk.gdpr_forget_me().await.unwrap());
    assert!(!sdk.gdpr_forget_me().await.unwrap());
    advance(100).await;

    assert_eq!(transport.calls_to(GDPR).len(), 1);
    assert_eq!(transport.calls_to(GDPR)[0].request.method.to_string(), "POST");
    assert!(forgotten.try_recv().is_ok());

    assert!(ctx.lifecycle.is_gdpr_forgotten());
    assert_eq!(sdk.identity().current().unwrap(), ActivityState::unknown());
    assert!(sdk.reconciler().current().await.unwrap().is_none());
    assert!(sdk.queue().pending().await.unwrap().is_empty());
    assert!(!sdk.queue().is_running());

    // Nothing brings it back.
    assert!(!sdk.enable().await.unwrap());
    assert!(!sdk.disable().await.unwrap());
    assert!(!sdk.track(Request::post("/event")).await.unwrap());
    assert!(!sdk.gdpr_forget_me().await.unwrap());
    advance(1_000).await;
    assert_eq!(transport.urls(), vec![GDPR]);
}

#[tokio::test(start_paused = true)]
async fn test_gdpr_forget_waits_behind_queued_requests() {
    let transport = Arc::new(MockTransport::new());
    let sdk = started(transport.clone()).await;

    sdk.queue().set_offline(true);
    sdk.track(Request::post("/event")).await.unwrap();
    sdk.gdpr_forget_me().await.unwrap();
    assert!(sdk.context().lifecycle.is_enabled());

    sdk.queue().set_offline(false);
    advance(1_000).await;

    assert_eq!(transport.urls(), vec!["/event", GDPR]);
    assert!(sdk.context().lifecycle.is_gdpr_forgotten());
}

#[tokio::test(start_paused = true)]
async fn test_gdpr_forget_before_start_runs_after_start() {
    let transport = Arc::new(MockTransport::new());
    let sdk = LifecycleCoordinator::new(in_memory_context(transport.clone()).await);

    assert!(sdk.gdpr_forget_me().await.unwrap());
    advance(1_000).await;
    assert!(transport.urls().is_empty());
    assert!(sdk.context().lifecycle.is_gdpr_forget_pending());

    sdk.start().await.unwrap();
    advance(100).await;
    assert_eq!(transport.urls(), vec![GDPR]);
    assert!(sdk.context().lifecycle.is_gdpr_forgotten());
    assert!(!sdk.context().lifecycle.is_gdpr_forget_pending());
}

#[tokio::test(start_paused = true)]
async fn test_gdpr_forget_while_disabled_waits_for_enable() {
    let transport = Arc::new(MockTransport::new());
    let sdk = started(transport.clone()).await;

    sdk.disable().await.unwrap();
    assert!(sdk.gdpr_forget_me().await.unwrap());
    advance(1_000).await;
    assert!(transport.urls().is_empty());

    assert!(sdk.enable().await.unwrap());
    advance(100).await;
    assert_eq!(transport.urls(), vec![GDPR]);
    assert_eq!(
        sdk.context().lifecycle.status(),
        Status::Disabled(DisableReason::Gdpr)
    );
}

#[tokio::test(start_paused = true)]
async fn test_gdpr_forget_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = SdkConfig {
        storage: StorageConfig::at(dir.path()),
        ..Default::default()
    };

    {
        let ctx = SdkContext::open(config.clone(), Arc::new(MockTransport::new()))
            .await
            .unwrap();
        ctx.storage
            .add_item(StoreName::Attribution, &json!({"adid": "123"}))
            .await
            .unwrap();
        let sdk = LifecycleCoordinator::new(ctx);
        sdk.start().await.unwrap();
        sdk.gdpr_forget_me().await.unwrap();
        advance(100).await;
        assert!(sdk.context().lifecycle.is_gdpr_forgotten());
        sdk.destroy();
    }

    let transport = Arc::new(MockTransport::new());
    let ctx = SdkContext::open(config, transport.clone()).await.unwrap();
    assert!(ctx.lifecycle.is_gdpr_forgotten());

    let identities: Vec<ActivityState> = ctx.storage.get_all(StoreName::ActivityState).await.unwrap();
    assert_eq!(identities, vec![ActivityState::unknown()]);
    let attribution: Option<serde_json::Value> = ctx
        .storage
        .get_item(StoreName::Attribution, "attribution")
        .await
        .unwrap();
    assert!(attribution.is_none());

    let sdk = LifecycleCoordinator::new(ctx);
    sdk.start().await.unwrap();
    assert!(!sdk.track(Request::post("/event")).await.unwrap());
    advance(1_000).await;
    assert!(transport.urls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_pending_gdpr_forget_resumes_after_restart() {
    let dir = TempDir::new().unwrap();
    let config = SdkConfig {
        storage: StorageConfig::at(dir.path()),
        ..Default::default()
    };

    {
        let ctx = SdkContext::open(config.clone(), Arc::new(MockTransport::new()))
            .await
            .unwrap();
        let sdk = LifecycleCoordinator::new(ctx);
        sdk.start().await.unwrap();
        sdk.queue().set_offline(true);
        sdk.gdpr_forget_me().await.unwrap();
        assert_eq!(sdk.queue().pending().await.unwrap().len(), 1);
        sdk.destroy();
    }

    let transport = Arc::new(MockTransport::new());
    let sdk = LifecycleCoordinator::new(SdkContext::open(config, transport.clone()).await.unwrap());
    sdk.start().await.unwrap();
    advance(100).await;

    // The restored pending flag finds the entry already queued.
    assert_eq!(transport.calls_to(GDPR).len(), 1);
    assert!(sdk.context().lifecycle.is_gdpr_forgotten());
}

// --- Third-party sharing ---

#[tokio::test(start_paused = true)]
async fn test_third_party_sharing_opt_out() {
    let transport = Arc::new(MockTransport::new().with_latency(std::time::Duration::from_millis(50)));
    let sdk = started(transport.clone()).await;
    let ctx = sdk.context().clone();
    let opted_out = ctx.bus.subscribe_channel(topics::THIRD_PARTY_SHARING_OPT_OUT, 10);

    assert!(sdk.disable_third_party_sharing().await.unwrap());
    assert_eq!(
        ctx.lifecycle.third_party_sharing_status(),
        ThirdPartySharingStatus::Pending
    );
    assert!(!sdk.disable_third_party_sharing().await.unwrap());

    advance(100).await;
    assert_eq!(transport.calls_to(THIRD_PARTY).len(), 1);
    assert_eq!(
        ctx.lifecycle.third_party_sharing_status(),
        ThirdPartySharingStatus::Off
    );
    assert!(opted_out.try_recv().is_ok());
    assert!(!sdk.disable_third_party_sharing().await.unwrap());

    // Opting out of sharing leaves the SDK enabled.
    assert!(ctx.lifecycle.is_enabled());
}

// --- Attribution hand-off ---

#[tokio::test(start_paused = true)]
async fn test_delivered_ask_in_triggers_attribution_check() {
    let transport = Arc::new(
        MockTransport::new()
            .script("/session", vec![Ok(json!({"ask_in": 1000}))])
            .script(
                "/attribution",
                vec![Ok(json!({"adid": "123", "attribution": {"network": "organic"}}))],
            ),
    );
    let mut config = in_memory_config();
    config.base_params = serde_json::from_value(json!({
        "base": {"app_token": "abc", "environment": "sandbox"}
    }))
    .unwrap();
    let ctx = SdkContext::open(config, transport.clone()).await.unwrap();
    let changes = ctx.bus.subscribe_channel(topics::ATTRIBUTION_CHANGE, 10);
    let sdk = LifecycleCoordinator::new(ctx);
    sdk.start().await.unwrap();

    sdk.track(Request::post("/session")).await.unwrap();
    advance(500).await;
    assert!(transport.calls_to("/attribution").is_empty());

    advance(1_000).await;
    let calls = transport.calls_to("/attribution");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].request.params["app_token"], "abc");
    assert_eq!(calls[0].request.params["environment"], "sandbox");

    assert!(changes.try_recv().is_ok());
    let stored = sdk.reconciler().current().await.unwrap().unwrap();
    assert_eq!(stored.data.network.as_deref(), Some("organic"));
}

#[tokio::test(start_paused = true)]
async fn test_disable_cancels_attribution_check() {
    let transport = Arc::new(MockTransport::new().script("/session", vec![Ok(json!({"ask_in": 1000}))]));
    let sdk = started(transport.clone()).await;

    sdk.track(Request::post("/session")).await.unwrap();
    advance(500).await;
    assert!(sdk.reconciler().is_active());

    sdk.disable().await.unwrap();
    advance(2_000).await;
    assert!(transport.calls_to("/attribution").is_empty());
    assert!(!sdk.reconciler().is_active());
}
