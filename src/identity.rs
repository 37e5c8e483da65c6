//! Device identity (`ActivityState`) kept in memory and in the
//! `activity_state` store.
//!
//! Several contexts may share one store. Each keeps its own in-memory copy and
//! calls [`Identity::sync`] to adopt a copy another context persisted more
//! recently; the record with the larger `last_active` wins.

use crate::context::SdkContext;
use crate::error::Result;
use crate::storage::StoreName;
use crate::types::{ActivityState, Timestamp};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Identity {
    ctx: Arc<SdkContext>,
    current: RwLock<Option<ActivityState>>,
}

impl Identity {
    pub fn new(ctx: Arc<SdkContext>) -> Self {
        Self {
            ctx,
            current: RwLock::new(None),
        }
    }

    /// In-memory copy, if started.
    pub fn current(&self) -> Option<ActivityState> {
        self.current.read().clone()
    }

    /// Load the stored identity, creating and persisting one if there is none.
    pub async fn start(&self) -> Result<ActivityState> {
        let stored: Option<ActivityState> = self.ctx.storage.get_first(StoreName::ActivityState).await?;

        let state = match stored {
            Some(state) => state,
            None => {
                let state = self.current().unwrap_or_else(ActivityState::generate);
                let existing = self
                    .ctx
                    .storage
                    .insert_item(StoreName::ActivityState, &state)
                    .await?;
                match existing {
                    Some(existing) => {
                        debug!(uuid = %existing.uuid, "Identity created by another context");
                        existing
                    }
                    None => {
                        info!(uuid = %state.uuid, "Created device identity");
                        state
                    }
                }
            }
        };

        *self.current.write() = Some(state.clone());
        Ok(state)
    }

    /// Stamp `last_active` and write the in-memory copy back.
    ///
    /// If another context replaced the stored record meanwhile (a different
    /// identity or the GDPR placeholder), that record is adopted instead and
    /// nothing is written. Returns the record now stored. Does nothing after a
    /// GDPR forget.
    pub async fn persist(&self) -> Result<Option<ActivityState>> {
        if self.ctx.lifecycle.is_gdpr_forgotten() {
            return Ok(None);
        }

        let Some(mut state) = self.current() else {
            return Ok(None);
        };
        state.last_active = Some(Timestamp::now().0);

        match self.ctx.storage.update_item(StoreName::ActivityState, &state).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                if let Some(stored) = self
                    .ctx
                    .storage
                    .insert_item(StoreName::ActivityState, &state)
                    .await?
                {
                    info!(uuid = %stored.uuid, "Stored identity was replaced, adopting it");
                    *self.current.write() = Some(stored.clone());
                    return Ok(Some(stored));
                }
            }
            Err(e) => return Err(e.into()),
        }

        *self.current.write() = Some(state.clone());
        Ok(Some(state))
    }

    /// Adopt the stored identity if it was active more recently than ours.
    ///
    /// Only while the SDK is enabled. Returns the stored record.
    pub async fn sync(&self) -> Result<Option<ActivityState>> {
        let stored: Option<ActivityState> = self.ctx.storage.get_first(StoreName::ActivityState).await?;

        if let Some(stored) = &stored {
            let ours = self
                .current()
                .and_then(|state| state.last_active)
                .unwrap_or(0);
            let theirs = stored.last_active.unwrap_or(0);

            if self.ctx.lifecycle.is_enabled() && ours < theirs {
                debug!(uuid = %stored.uuid, ours, theirs, "Adopting newer stored identity");
                *self.current.write() = Some(stored.clone());
            }
        }

        Ok(stored)
    }

    /// Replace the identity with the `unknown` placeholder.
    pub async fn clear(&self) -> Result<()> {
        let unknown = ActivityState::unknown();
        *self.current.write() = Some(unknown.clone());

        self.ctx
            .storage
            .replace_all(StoreName::ActivityState, &[unknown])
            .await?;
        info!("Device identity cleared");
        Ok(())
    }

    /// Drop the in-memory copy.
    pub fn destroy(&self) {
        *self.current.write() = None;
    }
}
