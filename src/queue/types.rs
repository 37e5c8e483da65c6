use crate::transport::{Method, Request};
use crate::types::Params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted outbound request, keyed by `created_at`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub url: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub params: Params,
    /// Enqueue time in milliseconds; unique and strictly increasing.
    pub created_at: i64,
    #[serde(default)]
    pub retry_count: u32,
}

impl QueueEntry {
    pub fn new(request: Request, created_at: i64) -> Self {
        Self {
            url: request.url,
            method: request.method,
            params: request.params,
            created_at,
            retry_count: 0,
        }
    }

    pub fn request(&self) -> Request {
        Request {
            url: self.url.clone(),
            method: self.method,
            params: self.params.clone(),
        }
    }
}

/// Payload published on `queue:delivered`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Delivered {
    pub url: String,
    pub method: Method,
    pub params: Params,
    pub response: Value,
}
