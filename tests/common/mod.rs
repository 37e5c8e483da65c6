//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use attribution_sdk::{Request, SdkConfig, SdkContext, StorageConfig, Transport, TransportError};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// One request seen by the mock transport.
#[derive(Clone, Debug)]
pub struct Call {
    pub request: Request,
    pub at: Instant,
}

/// Transport answering from per-endpoint scripts and recording every call.
///
/// Endpoints without a script (or whose script ran out) answer `{}`.
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Result<Value, TransportError>>>>,
    calls: Mutex<Vec<Call>>,
    latency: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    started: Instant,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Append responses for `url`, served in order.
    pub fn script(self, url: &str, responses: Vec<Result<Value, TransportError>>) -> Self {
        self.scripts
            .lock()
            .entry(url.to_string())
            .or_default()
            .extend(responses);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.request.url.clone()).collect()
    }

    pub fn calls_to(&self, url: &str) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.request.url == url)
            .cloned()
            .collect()
    }

    /// Milliseconds since the mock was built at which `url` was requested.
    pub fn call_times_ms(&self, url: &str) -> Vec<u64> {
        self.calls_to(url)
            .iter()
            .map(|c| (c.at - self.started).as_millis() as u64)
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&self, request: &Request) -> Result<Value, TransportError> {
        self.calls.lock().push(Call {
            request: request.clone(),
            at: Instant::now(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .get_mut(&request.url)
            .and_then(|responses| responses.pop_front());
        scripted.unwrap_or_else(|| Ok(json!({})))
    }
}

pub fn failure() -> Result<Value, TransportError> {
    Err(TransportError::with_status(500, "server error"))
}

/// Route SDK debug logs to the test harness. Repeated calls are ignored.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn in_memory_config() -> SdkConfig {
    SdkConfig {
        storage: StorageConfig::in_memory(),
        ..Default::default()
    }
}

pub async fn in_memory_context(transport: Arc<MockTransport>) -> Arc<SdkContext> {
    init_tracing();
    SdkContext::open(in_memory_config(), transport).await.unwrap()
}

/// Let spawned tasks run and timers advance by `ms` milliseconds.
pub async fn advance(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}
