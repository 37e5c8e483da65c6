use crate::types::Params;
use serde::{Deserialize, Serialize};

/// Attribution fields as returned by the backend.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracker_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Any further fields (campaign, adgroup, ...).
    #[serde(flatten)]
    pub extra: Params,
}

/// The persisted attribution record: the attribution fields plus `adid`.
///
/// Two attributions are equal when every field is equal.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adid: Option<String>,
    #[serde(flatten)]
    pub data: AttributionData,
}

/// Body of an attribution endpoint response, or a server hint carrying `ask_in`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributionResponse {
    /// Milliseconds until the backend wants to be asked again.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<AttributionData>,
    #[serde(flatten)]
    pub extra: Params,
}

impl AttributionResponse {
    pub fn ask_in(ms: u64) -> Self {
        Self {
            ask_in: Some(ms),
            ..Default::default()
        }
    }

    /// The record to persist, if this response carries an attribution.
    pub fn to_attribution(&self) -> Option<Attribution> {
        self.attribution.as_ref().map(|data| Attribution {
            adid: self.adid.clone(),
            data: data.clone(),
        })
    }
}
