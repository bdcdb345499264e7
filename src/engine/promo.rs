use chrono::{DateTime, Utc};
use log::{info, warn};

use super::{BonusReason, ExtendOutcome, SubscriptionEngine};
use crate::error::EngineError;
use crate::ledger::LedgerTx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromoIneligible {
    UnknownCode,
    /// Inactive, expired or out of activations.
    NotRedeemable,
    AlreadyUsed,
    NoActiveSubscription,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromoOutcome {
    Applied {
        bonus_days: i64,
        new_end: DateTime<Utc>,
    },
    Ineligible(PromoIneligible),
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

impl SubscriptionEngine {
    /// Redeems a bonus-day promo code against the user's active subscription.
    /// The activation slot is claimed before the extension; a failed extension
    /// is an error so the caller's rollback releases it.
    pub async fn apply_promo_code(
        &self,
        tx: &mut dyn LedgerTx,
        user_id: i64,
        code: &str,
    ) -> Result<PromoOutcome, EngineError> {
        let code = normalize_code(code);
        let Some(promo) = tx.promo_by_code(&code).await? else {
            return Ok(PromoOutcome::Ineligible(PromoIneligible::UnknownCode));
        };
        if !promo.is_redeemable(Utc::now()) {
            return Ok(PromoOutcome::Ineligible(PromoIneligible::NotRedeemable));
        }
        if tx.promo_activation(promo.id, user_id).await?.is_some() {
            return Ok(PromoOutcome::Ineligible(PromoIneligible::AlreadyUsed));
        }

        if self.active_grant(tx, user_id).await?.is_none() {
            return Ok(PromoOutcome::Ineligible(
                PromoIneligible::NoActiveSubscription,
            ));
        }
        if tx
            .record_promo_activation(promo.id, user_id, None)
            .await?
            .is_none()
        {
            info!("Promo {} ran out of activations before user {} redeemed it", code, user_id);
            return Ok(PromoOutcome::Ineligible(PromoIneligible::NotRedeemable));
        }

        let bonus_days = i64::from(promo.bonus_days);
        match self.extend(tx, user_id, bonus_days, BonusReason::Promo).await? {
            ExtendOutcome::Extended { new_end, .. } => {
                info!("Promo {} redeemed by user {} (+{} days)", code, user_id, bonus_days);
                Ok(PromoOutcome::Applied {
                    bonus_days,
                    new_end,
                })
            }
            // the caller rolls back, releasing the claimed slot
            ExtendOutcome::NotFound => Err(EngineError::NotFound(format!(
                "active subscription of user {}",
                user_id
            ))),
        }
    }

    /// Consumes the promo attached to a payment and returns its bonus days,
    /// or zero when it can no longer be applied.
    pub(super) async fn consume_payment_promo(
        &self,
        tx: &mut dyn LedgerTx,
        promo_id: i64,
        user_id: i64,
        payment_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, EngineError> {
        let promo = match tx.promo_by_id(promo_id).await? {
            Some(promo) if promo.is_redeemable(now) => promo,
            _ => {
                warn!(
                    "Promo {} attached to payment {} is missing or no longer redeemable",
                    promo_id, payment_id
                );
                return Ok(0);
            }
        };
        if tx.promo_activation(promo_id, user_id).await?.is_some() {
            warn!(
                "Promo {} already redeemed by user {}; payment {} gets no bonus",
                promo.code, user_id, payment_id
            );
            return Ok(0);
        }
        if tx
            .record_promo_activation(promo_id, user_id, Some(payment_id))
            .await?
            .is_none()
        {
            warn!(
                "Promo {} ran out of activations; payment {} gets no bonus",
                promo.code, payment_id
            );
            return Ok(0);
        }
        Ok(i64::from(promo.bonus_days))
    }
}
