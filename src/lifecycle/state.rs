//! Process-wide enabled/disabled status.

use crate::types::DisableReason;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Persisted third-party sharing opt-out.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThirdPartySharing {
    pub reason: DisableReason,
    /// Requested but not yet confirmed by the backend.
    pub pending: bool,
}

/// Snapshot of the lifecycle, as persisted in the `preferences` store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleState {
    pub disabled: Option<DisableReason>,
    /// A GDPR forget-me request was queued but not yet confirmed.
    pub gdpr_forget_pending: bool,
    pub third_party_sharing: Option<ThirdPartySharing>,
}

/// Externally visible lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Enabled,
    Disabled(DisableReason),
}

/// Third-party sharing status derived from [`ThirdPartySharing`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThirdPartySharingStatus {
    On,
    Pending,
    Off,
}

/// Owner of the [`LifecycleState`]; every component reads it before a side effect.
///
/// `Disabled(Gdpr)` is terminal: no call on this type leaves it.
pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::restore(LifecycleState::default())
    }

    /// Start from a previously persisted state.
    pub fn restore(state: LifecycleState) -> Self {
        let (sender, _) = watch::channel(state);
        Self { state: sender }
    }

    /// Current state snapshot.
    pub fn snapshot(&self) -> LifecycleState {
        self.state.borrow().clone()
    }

    /// Subscribe to state changes.
    pub fn watch(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn status(&self) -> Status {
        match self.state.borrow().disabled {
            Some(reason) => Status::Disabled(reason),
            None => Status::Enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.status() == Status::Enabled
    }

    pub fn disabled_reason(&self) -> Option<DisableReason> {
        self.state.borrow().disabled
    }

    /// Disable the SDK. Returns `false` if it was already disabled.
    pub fn disable(&self, reason: DisableReason) -> bool {
        let suffix = if reason == DisableReason::Gdpr {
            " due to GDPR-Forget-Me request"
        } else {
            ""
        };

        let mut changed = false;
        self.state.send_if_modified(|state| {
            if let Some(existing) = state.disabled {
                info!(reason = %existing, "SDK is already disabled{}", suffix);
                return false;
            }
            info!("SDK has been disabled{}", suffix);
            state.disabled = Some(reason);
            if reason == DisableReason::Gdpr {
                state.gdpr_forget_pending = false;
            }
            changed = true;
            true
        });
        changed
    }

    /// Re-enable after a general disable. GDPR disables are permanent.
    pub fn enable(&self) -> bool {
        let mut changed = false;
        self.state.send_if_modified(|state| match state.disabled {
            Some(DisableReason::Gdpr) => {
                info!("SDK is disabled due to GDPR-Forget-me request and it can not be re-enabled");
                false
            }
            None => {
                info!("SDK is already enabled");
                false
            }
            Some(DisableReason::General) => {
                info!("SDK has been enabled");
                state.disabled = None;
                changed = true;
                true
            }
        });
        changed
    }

    // --- GDPR ---

    pub fn is_gdpr_forgotten(&self) -> bool {
        self.disabled_reason() == Some(DisableReason::Gdpr)
    }

    pub fn is_gdpr_forget_pending(&self) -> bool {
        self.state.borrow().gdpr_forget_pending
    }

    /// Apply a forget-me confirmed by the backend.
    ///
    /// Unlike [`disable`](Self::disable) this also overrides a general disable.
    pub fn confirm_gdpr_forget(&self) -> bool {
        self.state.send_if_modified(|state| {
            state.gdpr_forget_pending = false;
            if state.disabled == Some(DisableReason::Gdpr) {
                return false;
            }
            info!("SDK has been disabled due to GDPR-Forget-Me request");
            state.disabled = Some(DisableReason::Gdpr);
            true
        })
    }

    /// Record that a forget-me request is outstanding. Returns `false` if it
    /// already was.
    pub fn mark_gdpr_forget_pending(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.gdpr_forget_pending {
                return false;
            }
            state.gdpr_forget_pending = true;
            true
        })
    }

    // --- Third-party sharing ---

    pub fn third_party_sharing_status(&self) -> ThirdPartySharingStatus {
        match self.state.borrow().third_party_sharing {
            Some(ThirdPartySharing { pending: true, .. }) => ThirdPartySharingStatus::Pending,
            Some(ThirdPartySharing { pending: false, .. }) => ThirdPartySharingStatus::Off,
            None => ThirdPartySharingStatus::On,
        }
    }

    /// Record an outstanding opt-out. Returns `false` if one exists already.
    pub fn mark_third_party_sharing_pending(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.third_party_sharing.is_some() {
                info!("Third-party sharing opt-out is already done");
                return false;
            }
            info!("Third-party sharing disabled state is pending");
            state.third_party_sharing = Some(ThirdPartySharing {
                reason: DisableReason::General,
                pending: true,
            });
            true
        })
    }

    /// Confirm the opt-out. Returns `false` if it was already final.
    pub fn finish_third_party_sharing(&self) -> bool {
        self.state.send_if_modified(|state| {
            if matches!(state.third_party_sharing, Some(ThirdPartySharing { pending: false, .. })) {
                info!("Third-party sharing opt-out is already done");
                return false;
            }
            info!("Third-party sharing disabled state is now persisted");
            state.third_party_sharing = Some(ThirdPartySharing {
                reason: DisableReason::General,
                pending: false,
            });
            true
        })
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
