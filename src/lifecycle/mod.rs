//! SDK lifecycle.
//!
//! [`Lifecycle`] is the single source of truth for whether the SDK may act:
//!
//! ```text
//! Enabled --disable(general)--> Disabled(general) --enable--> Enabled
//! Enabled --disable(gdpr)-----> Disabled(gdpr)     (terminal)
//! ```
//!
//! [`LifecycleCoordinator`] drives the transitions that touch several
//! components at once.

mod coordinator;
mod state;

pub use coordinator::{LifecycleCoordinator, GDPR_FORGET_ENDPOINT, THIRD_PARTY_SHARING_ENDPOINT};
pub use state::{Lifecycle, LifecycleState, Status, ThirdPartySharing, ThirdPartySharingStatus};
