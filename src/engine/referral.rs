use chrono::{DateTime, Utc};
use log::info;

use super::{BonusReason, ExtendOutcome, SubscriptionEngine};
use crate::error::EngineError;
use crate::ledger::LedgerTx;

/// New end times granted by a referral payout, if any.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferralBonuses {
    pub inviter_id: Option<i64>,
    pub inviter_days: i64,
    pub inviter_new_end: Option<DateTime<Utc>>,
    pub referee_days: i64,
    pub referee_new_end: Option<DateTime<Utc>>,
}

impl SubscriptionEngine {
    /// Pays out referral days for a completed purchase of `months`.
    /// Both sides go through [`SubscriptionEngine::extend`], so an inviter
    /// without an active subscription receives nothing.
    pub async fn apply_referral_bonuses(
        &self,
        tx: &mut dyn LedgerTx,
        referee_id: i64,
        months: i32,
    ) -> Result<ReferralBonuses, EngineError> {
        let mut bonuses = ReferralBonuses::default();
        let Some(referee) = tx.get_user(referee_id).await? else {
            return Ok(bonuses);
        };
        let Some(inviter_id) = referee.referred_by_id else {
            return Ok(bonuses);
        };
        bonuses.inviter_id = Some(inviter_id);

        if let Some(days) = self.settings.inviter_bonus_days(months) {
            if let ExtendOutcome::Extended { new_end, .. } = self
                .extend(tx, inviter_id, days, BonusReason::ReferralInviter)
                .await?
            {
                bonuses.inviter_days = days;
                bonuses.inviter_new_end = Some(new_end);
            }
        }
        if let Some(days) = self.settings.referee_bonus_days(months) {
            if let ExtendOutcome::Extended { new_end, .. } = self
                .extend(tx, referee_id, days, BonusReason::ReferralReferee)
                .await?
            {
                bonuses.referee_days = days;
                bonuses.referee_new_end = Some(new_end);
            }
        }

        info!(
            "Referral payout for user {} (inviter {}): {:?}",
            referee_id, inviter_id, bonuses
        );
        Ok(bonuses)
    }
}
