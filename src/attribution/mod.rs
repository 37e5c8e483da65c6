//! Attribution reconciliation.
//!
//! The backend tells the SDK when to ask for attribution (`ask_in`). The
//! [`AttributionReconciler`] waits, polls `/attribution`, follows further
//! `ask_in` hints, retries failures with backoff, and persists the result
//! when it differs from the stored attribution. Changes are announced on
//! `attribution:change`.

mod reconciler;
mod types;

pub use reconciler::{AttributionReconciler, ATTRIBUTION_ENDPOINT};
pub use types::{Attribution, AttributionData, AttributionResponse};
