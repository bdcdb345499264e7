//! Subscription timeline: activation, extension and the merge primitives
//! shared with reconciliation.
//!
//! Every operation runs inside the caller's [`LedgerTx`]; the caller decides
//! when to commit. Panel pushes happen after the local write and, unless
//! `PANEL_PUSH_STRICT` is set, a failed push is logged and left for the next
//! reconciliation pass.

mod merge;
mod panel_link;
mod promo;
mod referral;

pub use merge::{MergeOutcome, SkipReason};
pub use panel_link::PanelLink;
pub use promo::{PromoIneligible, PromoOutcome};
pub use referral::ReferralBonuses;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::config::Settings;
use crate::error::EngineError;
use crate::ledger::LedgerTx;
use crate::models::{Provider, Subscription, SubscriptionUpsert};
use crate::panel::{format_panel_time, PanelApi, PanelUser, PanelUserUpdate, ACTIVE_STATUS};

pub const TRIAL_STATUS: &str = "TRIAL";
pub const EXTENDED_STATUS: &str = "ACTIVE_EXTENDED_BY_BOT";

/// Days granted per paid month.
pub const DAYS_PER_MONTH: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BonusReason {
    Promo,
    ReferralInviter,
    ReferralReferee,
    Admin,
    TributeRenewal,
}

impl fmt::Display for BonusReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BonusReason::Promo => "promo code",
            BonusReason::ReferralInviter => "referral (inviter)",
            BonusReason::ReferralReferee => "referral (referee)",
            BonusReason::Admin => "admin",
            BonusReason::TributeRenewal => "tribute renewal",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExtendOutcome {
    Extended {
        subscription_id: i64,
        new_end: DateTime<Utc>,
    },
    /// The user is unknown or has no active subscription.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialIneligible {
    Disabled,
    UnknownUser,
    AlreadyHadSubscription,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Activated(Activation),
    Ineligible(TrialIneligible),
    /// The panel account could not be resolved; nothing was written.
    Failed(String),
}

/// Result of a trial or paid activation.
#[derive(Debug, Clone, PartialEq)]
pub struct Activation {
    pub subscription: Subscription,
    pub end_time: DateTime<Utc>,
    pub panel_identity: String,
    pub subscription_url: Option<String>,
    pub applied_promo_days: i64,
}

/// Paid activation request, normalised from a payment row.
#[derive(Debug, Clone, PartialEq)]
pub struct PaidActivation {
    pub user_id: i64,
    pub months: i32,
    pub payment_id: i64,
    pub promo_code_id: Option<i64>,
    pub provider: Provider,
}

#[derive(Clone)]
pub struct SubscriptionEngine {
    panel: Arc<dyn PanelApi>,
    settings: Arc<Settings>,
}

impl SubscriptionEngine {
    pub fn new(panel: Arc<dyn PanelApi>, settings: Arc<Settings>) -> Self {
        SubscriptionEngine { panel, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn panel(&self) -> &Arc<dyn PanelApi> {
        &self.panel
    }

    /// Pushes `max(now, end) + days` onto the user's active subscription.
    /// Never creates a subscription.
    pub async fn extend(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: i64,
        bonus_days: i64,
        reason: BonusReason,
    ) -> Result<ExtendOutcome, EngineError> {
        if bonus_days <= 0 {
            return Err(EngineError::InvalidDays(bonus_days));
        }
        let Some(active) = self.active_grant(tx, user_id).await? else {
            info!(
                "No active subscription for user {}; {} bonus of {} days not applied",
                user_id, reason, bonus_days
            );
            return Ok(ExtendOutcome::NotFound);
        };

        let new_end = extended_end(active.end_time, Utc::now(), bonus_days)?;
        let updated = tx
            .extend_subscription(active.id, new_end, EXTENDED_STATUS)
            .await?;

        let mut update = PanelUserUpdate::new(updated.panel_identity.clone());
        update.expire_at = Some(format_panel_time(new_end));
        self.push(update).await?;

        info!(
            "Subscription {} of user {} extended by {} days ({}); new end {}",
            updated.id, user_id, bonus_days, reason, new_end
        );
        Ok(ExtendOutcome::Extended {
            subscription_id: updated.id,
            new_end,
        })
    }

    /// The active subscription `extend` would move, if the user has one.
    pub(crate) async fn active_grant(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: i64,
    ) -> Result<Option<Subscription>, EngineError> {
        let Some(user) = tx.get_user(user_id).await? else {
            warn!("User {} not found", user_id);
            return Ok(None);
        };
        let active = match user.panel_identity.as_deref() {
            Some(identity) => tx.active_subscription_by_identity(identity).await?,
            None => tx.active_subscription_for_user(user_id).await?,
        };
        Ok(active)
    }

    /// Operator-granted days; same rules as any other bonus.
    pub async fn admin_extend(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: i64,
        days: i64,
    ) -> Result<ExtendOutcome, EngineError> {
        self.extend(tx, user_id, days, BonusReason::Admin).await
    }

    pub async fn activate_trial(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: i64,
    ) -> Result<TrialOutcome, EngineError> {
        let settings = &self.settings;
        if !settings.trial_enabled || settings.trial_duration_days <= 0 {
            return Ok(TrialOutcome::Ineligible(TrialIneligible::Disabled));
        }
        let Some(user) = tx.get_user(user_id).await? else {
            return Ok(TrialOutcome::Ineligible(TrialIneligible::UnknownUser));
        };
        if tx.has_any_subscription(user_id).await? {
            return Ok(TrialOutcome::Ineligible(TrialIneligible::AlreadyHadSubscription));
        }

        let link = match self.resolve_panel_account(tx, &user).await {
            Ok(link) => link,
            Err(EngineError::TransientUpstream(e)) => {
                warn!("Trial for user {} failed: panel account unavailable: {}", user_id, e);
                return Ok(TrialOutcome::Failed(e.to_string()));
            }
            Err(e) => return Err(e),
        };

        let start = Utc::now();
        let end = add_days(start, settings.trial_duration_days)?;
        let traffic_limit = settings.trial_traffic_limit_bytes();

        let subscription = self
            .install_grant(
                tx,
                &SubscriptionUpsert {
                    user_id: Some(user_id),
                    panel_identity: link.panel_identity.clone(),
                    panel_subscription_link: link.subscription_link.clone(),
                    start_time: start,
                    end_time: end,
                    duration_months: 0,
                    is_active: true,
                    status_label: TRIAL_STATUS.to_string(),
                    traffic_limit_bytes: Some(traffic_limit),
                    traffic_used_bytes: None,
                    provider: None,
                    skip_notifications: false,
                },
            )
            .await?;

        let pushed = self
            .push(self.activation_update(&link.panel_identity, end, traffic_limit))
            .await?;

        info!("Trial activated for user {} until {}", user_id, end);
        Ok(TrialOutcome::Activated(Activation {
            subscription,
            end_time: end,
            panel_identity: link.panel_identity,
            subscription_url: pushed
                .and_then(|p| p.subscription_url)
                .or(link.subscription_url),
            applied_promo_days: 0,
        }))
    }

    /// Activates or renews a paid subscription. Renewals extend from the
    /// current end when it is still in the future.
    pub async fn activate_paid(
        &self,
        tx: &mut dyn LedgerTx,
        request: &PaidActivation,
    ) -> Result<Activation, EngineError> {
        let user_id = request.user_id;
        let user = tx
            .get_user(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", user_id)))?;

        let link = self.resolve_panel_account(tx, &user).await?;

        let now = Utc::now();
        let start = match tx.active_subscription_by_identity(&link.panel_identity).await? {
            Some(current) if current.end_time > now => current.end_time,
            _ => now,
        };

        let mut days = DAYS_PER_MONTH * i64::from(request.months);
        let mut applied_promo_days = 0;
        if let Some(promo_id) = request.promo_code_id {
            applied_promo_days = self
                .consume_payment_promo(tx, promo_id, user_id, request.payment_id, now)
                .await?;
            days += applied_promo_days;
        }
        let end = add_days(start, days)?;
        let traffic_limit = self.settings.user_traffic_limit_bytes();

        let subscription = self
            .install_grant(
                tx,
                &SubscriptionUpsert {
                    user_id: Some(user_id),
                    panel_identity: link.panel_identity.clone(),
                    panel_subscription_link: link.subscription_link.clone(),
                    start_time: start,
                    end_time: end,
                    duration_months: request.months,
                    is_active: true,
                    status_label: ACTIVE_STATUS.to_string(),
                    traffic_limit_bytes: Some(traffic_limit),
                    traffic_used_bytes: None,
                    provider: Some(request.provider.as_str().to_string()),
                    skip_notifications: request.provider == Provider::Tribute,
                },
            )
            .await?;

        let pushed = self
            .push(self.activation_update(&link.panel_identity, end, traffic_limit))
            .await?;

        info!(
            "Paid subscription for user {} ({} months, payment {}) active until {}",
            user_id, request.months, request.payment_id, end
        );
        Ok(Activation {
            subscription,
            end_time: end,
            panel_identity: link.panel_identity,
            subscription_url: pushed
                .and_then(|p| p.subscription_url)
                .or(link.subscription_url),
            applied_promo_days,
        })
    }

    /// Retires every other active grant of the identity, then upserts this one.
    pub async fn install_grant(
        &self,
        tx: &mut dyn LedgerTx,
        grant: &SubscriptionUpsert,
    ) -> Result<Subscription, EngineError> {
        let retired = tx
            .deactivate_siblings(&grant.panel_identity, Some(&grant.panel_subscription_link))
            .await?;
        if retired > 0 {
            info!(
                "Deactivated {} sibling subscription(s) of panel identity {}",
                retired, grant.panel_identity
            );
        }
        Ok(tx.upsert_subscription(grant).await?)
    }

    /// Flips the local ban flag and mirrors it on the panel (best effort).
    pub async fn set_banned(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: i64,
        banned: bool,
    ) -> Result<(), EngineError> {
        let user = tx
            .get_user(user_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("user {}", user_id)))?;
        tx.set_banned(user_id, banned).await?;

        if let Some(identity) = user.panel_identity.as_deref() {
            if let Err(e) = self.panel.set_enabled(identity, !banned).await {
                warn!(
                    "Panel {} for user {} ({}) failed: {}",
                    if banned { "disable" } else { "enable" },
                    user_id,
                    identity,
                    e
                );
            }
        }
        info!("User {} banned={}", user_id, banned);
        Ok(())
    }

    fn activation_update(
        &self,
        panel_identity: &str,
        end: DateTime<Utc>,
        traffic_limit: i64,
    ) -> PanelUserUpdate {
        let mut update = PanelUserUpdate::new(panel_identity);
        update.expire_at = Some(format_panel_time(end));
        update.status = Some(ACTIVE_STATUS.to_string());
        update.traffic_limit_bytes = Some(traffic_limit);
        update.traffic_limit_strategy = Some(self.settings.user_traffic_strategy.clone());
        if !self.settings.user_squad_uuids.is_empty() {
            update.active_internal_squads = Some(self.settings.user_squad_uuids.clone());
        }
        update
    }

    /// Sends an update to the panel after the local write. Returns the
    /// panel's view of the account, or `None` when the push failed and was
    /// left for reconciliation.
    async fn push(&self, update: PanelUserUpdate) -> Result<Option<PanelUser>, EngineError> {
        match self.panel.update_user(&update).await {
            Ok(user) => Ok(Some(user)),
            Err(e) if self.settings.panel_push_strict => Err(EngineError::TransientUpstream(e)),
            Err(e) => {
                warn!(
                    "Panel update for {} failed, local state kept until next sync: {}",
                    update.uuid, e
                );
                Ok(None)
            }
        }
    }
}

/// `start + days`, or [`EngineError::InvalidDays`] when the result falls
/// outside the representable range.
pub fn add_days(start: DateTime<Utc>, days: i64) -> Result<DateTime<Utc>, EngineError> {
    Duration::try_days(days)
        .and_then(|delta| start.checked_add_signed(delta))
        .ok_or(EngineError::InvalidDays(days))
}

/// New end for an extension: relative to the later of `now` and `current_end`.
pub fn extended_end(
    current_end: DateTime<Utc>,
    now: DateTime<Utc>,
    days: i64,
) -> Result<DateTime<Utc>, EngineError> {
    add_days(current_end.max(now), days)
}

#[cfg(test)]
mod tests;
