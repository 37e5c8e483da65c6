//! Core types shared across the SDK core.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Loose key/value parameter bag sent with requests.
pub type Params = serde_json::Map<String, serde_json::Value>;

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as i64)
    }

    /// Format as the `created_at` value attached to outbound requests,
    /// e.g. `2024-03-01T10:15:30.250Z+0000`.
    pub fn to_created_at(self) -> String {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ%z").to_string(),
            None => String::new(),
        }
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Why the SDK was disabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisableReason {
    /// Disabled by the application; can be re-enabled.
    General,
    /// Disabled by a GDPR forget-me request; terminal.
    Gdpr,
}

impl fmt::Display for DisableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisableReason::General => write!(f, "general"),
            DisableReason::Gdpr => write!(f, "gdpr"),
        }
    }
}

/// Device installation identity.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityState {
    pub uuid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_active: Option<i64>,
}

impl ActivityState {
    /// Fresh state with a random v4 uuid.
    pub fn generate() -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            last_active: None,
        }
    }

    /// Placeholder identity left behind after a GDPR forget.
    pub fn unknown() -> Self {
        Self {
            uuid: "unknown".to_string(),
            last_active: None,
        }
    }
}
