use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{error, info};

use crate::engine::{BonusReason, ExtendOutcome, SubscriptionEngine, DAYS_PER_MONTH};
use crate::error::EngineError;
use crate::ledger::Ledger;
use crate::models::Provider;

const RENEWAL_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RenewalReport {
    pub checked: usize,
    pub renewed: usize,
}

/// Extends Tribute subscriptions that are about to lapse. Tribute bills on
/// its own schedule, so the local grant is carried forward once the user
/// has paid through Tribute at least once.
pub struct TributeRenewal {
    ledger: Arc<dyn Ledger>,
    engine: SubscriptionEngine,
}

impl TributeRenewal {
    pub fn new(ledger: Arc<dyn Ledger>, engine: SubscriptionEngine) -> Self {
        TributeRenewal { ledger, engine }
    }

    pub async fn renew_tribute_subscriptions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<RenewalReport, EngineError> {
        let mut tx = self.ledger.begin().await?;
        let mut report = RenewalReport::default();

        let result = async {
            let due = tx
                .expiring_subscriptions(Provider::Tribute, now + chrono::Duration::days(1))
                .await?;
            for sub in due {
                report.checked += 1;
                let Some(user_id) = sub.user_id else {
                    continue;
                };
                if !sub.skip_notifications {
                    if !tx.has_succeeded_payment(user_id, Provider::Tribute).await? {
                        continue;
                    }
                    tx.set_skip_notifications(sub.id, true).await?;
                }

                let months = i64::from(sub.duration_months.max(1));
                let outcome = self
                    .engine
                    .extend(
                        tx.as_mut(),
                        user_id,
                        months * DAYS_PER_MONTH,
                        BonusReason::TributeRenewal,
                    )
                    .await?;
                if let ExtendOutcome::Extended { new_end, .. } = outcome {
                    info!("Tribute subscription of user {} renewed until {}", user_id, new_end);
                    report.renewed += 1;
                }
            }
            Ok::<(), EngineError>(())
        }
        .await;

        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(report)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    error!("Tribute renewal rollback failed: {}", rb);
                }
                Err(e)
            }
        }
    }

    pub async fn run_daily(self: Arc<Self>) {
        let mut interval = tokio::time::interval(RENEWAL_PERIOD);
        loop {
            interval.tick().await;
            match self.renew_tribute_subscriptions(Utc::now()).await {
                Ok(report) => info!(
                    "Tribute renewal: {} checked, {} renewed",
                    report.checked, report.renewed
                ),
                Err(e) => error!("Tribute renewal failed: {}", e),
            }
        }
    }
}
