use chrono::{DateTime, Utc};
use log::{debug, error, info};

use super::SubscriptionEngine;
use crate::error::EngineError;
use crate::ledger::LedgerTx;
use crate::models::{NewUser, Subscription, SubscriptionUpsert};
use crate::panel::{PanelUser, ACTIVE_STATUS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoTelegramId,
    NoPanelIdentity,
    MissingExpiry,
    BadDate(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The remote grant was upserted locally.
    Synced { subscription: Subscription },
    /// The remote account has no grant; local active rows were retired.
    Retired { deactivated: u64 },
    /// The remote identity belongs to another local user. Nothing written.
    Conflict { panel_identity: String, owner: i64 },
    Skipped(SkipReason),
}

impl SubscriptionEngine {
    /// Merges one remote account snapshot into the ledger. Reads the panel
    /// data it is given and never writes to the panel. Applying the same
    /// snapshot twice leaves the ledger unchanged.
    pub async fn merge_remote_account(
        &self,
        tx: &mut dyn LedgerTx,
        remote: &PanelUser,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome, EngineError> {
        let Some(user_id) = remote.telegram_id else {
            debug!("Panel account {:?} has no telegram id; skipping", remote.uuid);
            return Ok(MergeOutcome::Skipped(SkipReason::NoTelegramId));
        };
        let Some(identity) = remote.uuid.as_deref().filter(|uuid| !uuid.is_empty()) else {
            return Ok(MergeOutcome::Skipped(SkipReason::NoPanelIdentity));
        };

        if let Some(owner) = tx.user_by_panel_identity(identity).await? {
            if owner.user_id != user_id {
                error!(
                    "Sync: panel identity {} (telegram id {}) is linked to local user {}; skipping",
                    identity, user_id, owner.user_id
                );
                return Ok(MergeOutcome::Conflict {
                    panel_identity: identity.to_string(),
                    owner: owner.user_id,
                });
            }
        }

        let created = match remote.created() {
            Ok(created) => created,
            Err(e) => return Ok(MergeOutcome::Skipped(SkipReason::BadDate(e.to_string()))),
        };

        let user = match tx.get_user(user_id).await? {
            Some(user) => user,
            None => {
                info!("Sync: creating local user {} for panel account {}", user_id, identity);
                tx.insert_user(&NewUser {
                    user_id,
                    username: None,
                    panel_identity: None,
                    referred_by_id: None,
                    language: None,
                    registered_at: created.unwrap_or(now),
                })
                .await?
            }
        };
        if user.panel_identity.as_deref() != Some(identity) {
            info!(
                "Sync: linking user {} to panel identity {} (was {:?})",
                user_id, identity, user.panel_identity
            );
            tx.set_panel_identity(user_id, Some(identity)).await?;
        }

        let Some(link) = remote.subscription_link() else {
            let deactivated = self.retire_identity(tx, identity).await?;
            return Ok(MergeOutcome::Retired { deactivated });
        };

        let end = match remote.expires_at() {
            Ok(Some(end)) => end,
            Ok(None) => return Ok(MergeOutcome::Skipped(SkipReason::MissingExpiry)),
            Err(e) => return Ok(MergeOutcome::Skipped(SkipReason::BadDate(e.to_string()))),
        };

        let existing = tx.subscription_by_link(link).await?;
        let status_label = remote.status_label();
        let grant = SubscriptionUpsert {
            user_id: Some(user_id),
            panel_identity: identity.to_string(),
            panel_subscription_link: link.to_string(),
            start_time: created
                .or_else(|| existing.as_ref().map(|s| s.start_time))
                .unwrap_or(now),
            end_time: end,
            duration_months: existing.as_ref().map_or(0, |s| s.duration_months),
            is_active: status_label == ACTIVE_STATUS && end > now,
            status_label,
            traffic_limit_bytes: remote.traffic_limit_bytes,
            traffic_used_bytes: remote.used_traffic_bytes,
            provider: existing.as_ref().and_then(|s| s.provider.clone()),
            skip_notifications: existing.as_ref().map_or(false, |s| s.skip_notifications),
        };
        let subscription = self.install_grant(tx, &grant).await?;
        Ok(MergeOutcome::Synced { subscription })
    }

    /// Deactivates every active local grant of a panel identity.
    pub async fn retire_identity(
        &self,
        tx: &mut dyn LedgerTx,
        panel_identity: &str,
    ) -> Result<u64, EngineError> {
        let deactivated = tx.deactivate_siblings(panel_identity, None).await?;
        if deactivated > 0 {
            info!(
                "Deactivated {} local subscription(s) of panel identity {} with no remote grant",
                deactivated, panel_identity
            );
        }
        Ok(deactivated)
    }
}
