//! Payment webhook ingestion.
//!
//! Each provider module verifies and normalises its own wire payload into a
//! [`PaymentEvent`]; [`PaymentIngestor::ingest`] then runs the shared
//! dedup / activate / notify pipeline inside one ledger transaction.
//! Expiry events from the panel itself are handled in [`panel`].

pub mod cryptopay;
pub mod panel;
pub mod signature;
pub mod stars;
pub mod tribute;
pub mod yookassa;

use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::engine::{Activation, PaidActivation, ReferralBonuses, SubscriptionEngine};
use crate::error::EngineError;
use crate::ledger::{Ledger, LedgerTx};
use crate::models::{NewPayment, Payment, PaymentStatus, Provider};
use crate::notify::{Notification, Notifier};

lazy_static! {
    /// Serialises activation side effects of every provider, including the
    /// dedup read that precedes them. Payment volume is low; shard per panel
    /// identity if that stops being true.
    static ref PAYMENT_LOCK: Mutex<()> = Mutex::new(());
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("missing signature")]
    MissingSignature,

    #[error("invalid signature")]
    InvalidSignature,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("{0} webhooks are not configured")]
    Disabled(Provider),

    #[error("panel webhooks are not configured")]
    PanelDisabled,
}

impl ResponseError for WebhookError {
    fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::MissingSignature | WebhookError::InvalidSignature => StatusCode::FORBIDDEN,
            WebhookError::Malformed(_) => StatusCode::BAD_REQUEST,
            WebhookError::Disabled(_) | WebhookError::PanelDisabled => {
                StatusCode::SERVICE_UNAVAILABLE
            }
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEventKind {
    Succeeded,
    Canceled,
}

/// Provider-independent view of a payment notification.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentEvent {
    pub provider: Provider,
    pub kind: PaymentEventKind,
    pub user_id: i64,
    pub months: i32,
    pub amount: f64,
    pub currency: String,
    pub provider_payment_id: String,
    /// Local pending row opened before the invoice was issued. Absent for
    /// providers that bill on their own schedule (Tribute).
    pub payment_id: Option<i64>,
    pub promo_code_id: Option<i64>,
}

/// What a delivery did. Every variant is acknowledged with `200`.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Activated { user_id: i64, end_time: DateTime<Utc> },
    /// Already processed under this provider payment id.
    Replay,
    Canceled { payment_id: i64 },
    UnknownUser { user_id: i64 },
    Ignored(String),
    /// Rolled back and logged; the provider is not asked to retry.
    Failed(String),
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Activated { .. } => "activated",
            WebhookOutcome::Replay => "replay",
            WebhookOutcome::Canceled { .. } => "canceled",
            WebhookOutcome::UnknownUser { .. } => "unknown_user",
            WebhookOutcome::Ignored(_) => "ignored",
            WebhookOutcome::Failed(_) => "failed",
        }
    }
}

enum Applied {
    Replay,
    Activated {
        user_id: i64,
        months: i32,
        activation: Activation,
        bonuses: ReferralBonuses,
    },
    Canceled {
        user_id: i64,
        payment_id: i64,
    },
    UnknownUser {
        user_id: i64,
    },
    Ignored(String),
}

#[derive(Clone)]
pub struct PaymentIngestor {
    ledger: Arc<dyn Ledger>,
    engine: SubscriptionEngine,
    notifier: Arc<dyn Notifier>,
}

impl PaymentIngestor {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        engine: SubscriptionEngine,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        PaymentIngestor {
            ledger,
            engine,
            notifier,
        }
    }

    /// Creates the pending payment row an invoice refers back to.
    pub async fn open_payment(
        &self,
        user_id: i64,
        provider: Provider,
        amount: f64,
        currency: &str,
        months: i32,
        promo_code_id: Option<i64>,
    ) -> Result<Payment, EngineError> {
        let mut tx = self.ledger.begin().await?;
        if tx.get_user(user_id).await?.is_none() {
            tx.rollback().await?;
            return Err(EngineError::NotFound(format!("user {}", user_id)));
        }
        let payment = tx
            .insert_payment(&NewPayment {
                user_id,
                provider,
                provider_payment_id: None,
                idempotence_key: Some(Uuid::new_v4().to_string()),
                status: PaymentStatus::Pending,
                amount,
                currency: currency.to_string(),
                subscription_months: months,
                promo_code_id,
            })
            .await?;
        tx.commit().await?;
        info!(
            "Opened {} payment {} for user {} ({} months, {:.2} {})",
            provider, payment.id, user_id, months, amount, currency
        );
        Ok(payment)
    }

    pub async fn ingest(&self, event: PaymentEvent) -> WebhookOutcome {
        let _guard = PAYMENT_LOCK.lock().await;
        info!(
            "{} webhook: payment {} ({:?}) for user {}",
            event.provider, event.provider_payment_id, event.kind, event.user_id
        );

        let mut tx = match self.ledger.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("Cannot open transaction for {} webhook: {}", event.provider, e);
                return WebhookOutcome::Failed(e.to_string());
            }
        };

        let applied = match self.apply(tx.as_mut(), &event).await {
            Ok(applied) => applied,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    error!("Rollback after failed {} webhook: {}", event.provider, rb);
                }
                error!(
                    "{} webhook {} for user {} rolled back: {}",
                    event.provider, event.provider_payment_id, event.user_id, e
                );
                if e.is_conflict() {
                    self.notifier
                        .notify(&Notification::AdminAlert {
                            message: format!(
                                "Payment {} ({}) for user {} not activated: {}",
                                event.provider_payment_id, event.provider, event.user_id, e
                            ),
                        })
                        .await;
                }
                return WebhookOutcome::Failed(e.to_string());
            }
        };

        if let Applied::Replay = applied {
            if let Err(e) = tx.rollback().await {
                warn!("Rollback of read-only replay check failed: {}", e);
            }
            info!(
                "{} payment {} already processed; replay ignored",
                event.provider, event.provider_payment_id
            );
            return WebhookOutcome::Replay;
        }

        if let Err(e) = tx.commit().await {
            error!(
                "Commit of {} webhook {} failed: {}",
                event.provider, event.provider_payment_id, e
            );
            return WebhookOutcome::Failed(e.to_string());
        }

        self.announce(&event, applied).await
    }

    async fn apply(
        &self,
        tx: &mut dyn LedgerTx,
        event: &PaymentEvent,
    ) -> Result<Applied, EngineError> {
        let ppid = event.provider_payment_id.as_str();
        let by_provider_id = tx.payment_by_provider_id(ppid).await?;
        if by_provider_id
            .as_ref()
            .map_or(false, |p| p.status().is_terminal())
        {
            return Ok(Applied::Replay);
        }

        let payment = match event.payment_id {
            Some(id) => match tx.payment_by_id(id).await? {
                Some(row) if row.status().is_terminal() => return Ok(Applied::Replay),
                Some(row) => Some(row),
                None => return Ok(Applied::Ignored(format!("unknown payment {}", id))),
            },
            None => by_provider_id,
        };

        if event.kind == PaymentEventKind::Canceled {
            let Some(row) = payment else {
                return Ok(Applied::Ignored("cancellation without a local payment".to_string()));
            };
            tx.update_payment_status(row.id, PaymentStatus::Canceled, Some(ppid))
                .await?;
            return Ok(Applied::Canceled {
                user_id: row.user_id,
                payment_id: row.id,
            });
        }

        let user_id = payment.as_ref().map_or(event.user_id, |p| p.user_id);
        if user_id != event.user_id {
            warn!(
                "{} payment {} names user {} but local payment belongs to {}",
                event.provider, ppid, event.user_id, user_id
            );
        }
        if tx.get_user(user_id).await?.is_none() {
            if let Some(row) = &payment {
                tx.update_payment_status(row.id, PaymentStatus::Failed, Some(ppid))
                    .await?;
            }
            warn!("{} payment {} for unknown user {}", event.provider, ppid, user_id);
            return Ok(Applied::UnknownUser { user_id });
        }

        let payment = match payment {
            Some(row) => {
                tx.update_payment_status(row.id, PaymentStatus::Succeeded, Some(ppid))
                    .await?
            }
            None => {
                tx.insert_payment(&NewPayment {
                    user_id,
                    provider: event.provider,
                    provider_payment_id: Some(ppid.to_string()),
                    idempotence_key: None,
                    status: PaymentStatus::Succeeded,
                    amount: event.amount,
                    currency: event.currency.clone(),
                    subscription_months: event.months,
                    promo_code_id: event.promo_code_id,
                })
                .await?
            }
        };

        let months = if event.months > 0 {
            event.months
        } else {
            payment.subscription_months.max(1)
        };
        let activation = self
            .engine
            .activate_paid(
                tx,
                &PaidActivation {
                    user_id,
                    months,
                    payment_id: payment.id,
                    promo_code_id: event.promo_code_id.or(payment.promo_code_id),
                    provider: event.provider,
                },
            )
            .await?;
        let bonuses = self
            .engine
            .apply_referral_bonuses(tx, user_id, months)
            .await?;

        Ok(Applied::Activated {
            user_id,
            months,
            activation,
            bonuses,
        })
    }

    async fn announce(&self, event: &PaymentEvent, applied: Applied) -> WebhookOutcome {
        match applied {
            Applied::Replay => WebhookOutcome::Replay,
            Applied::Ignored(reason) => {
                info!("{} webhook ignored: {}", event.provider, reason);
                WebhookOutcome::Ignored(reason)
            }
            Applied::Canceled {
                user_id,
                payment_id,
            } => {
                info!("{} payment {} canceled", event.provider, payment_id);
                self.notifier
                    .notify(&Notification::PaymentFailed {
                        user_id,
                        payment_id,
                    })
                    .await;
                WebhookOutcome::Canceled { payment_id }
            }
            Applied::UnknownUser { user_id } => {
                self.notifier
                    .notify(&Notification::AdminAlert {
                        message: format!(
                            "{} payment {} received for unknown user {}",
                            event.provider, event.provider_payment_id, user_id
                        ),
                    })
                    .await;
                WebhookOutcome::UnknownUser { user_id }
            }
            Applied::Activated {
                user_id,
                months,
                activation,
                bonuses,
            } => {
                let end_time = bonuses.referee_new_end.unwrap_or(activation.end_time);
                self.notifier
                    .notify(&Notification::PaymentSucceeded {
                        user_id,
                        months,
                        end_time,
                        subscription_url: activation.subscription_url.clone(),
                    })
                    .await;
                if let (Some(inviter), Some(new_end)) = (bonuses.inviter_id, bonuses.inviter_new_end)
                {
                    self.notifier
                        .notify(&Notification::ReferralBonus {
                            user_id: inviter,
                            days: bonuses.inviter_days,
                            new_end,
                        })
                        .await;
                }
                self.notifier
                    .notify(&Notification::AdminNewPayment {
                        user_id,
                        provider: event.provider,
                        amount: event.amount,
                        currency: event.currency.clone(),
                        months,
                    })
                    .await;
                WebhookOutcome::Activated { user_id, end_time }
            }
        }
    }
}

/// Reads an integer that providers send either as a JSON number or a string.
pub(crate) fn lenient_i64(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn lenient_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn parse_json(body: &[u8]) -> Result<Value, WebhookError> {
    serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::testing::{
        panel_account, seed_subscription, seed_user, AutocommitLedger, FakePanel, MemoryLedger,
        RecordingNotifier,
    };
    use chrono::Duration;

    struct Harness {
        ledger: MemoryLedger,
        panel: Arc<FakePanel>,
        notifier: Arc<RecordingNotifier>,
        ingestor: PaymentIngestor,
    }

    fn harness() -> Harness {
        let ledger = MemoryLedger::new();
        let panel = Arc::new(FakePanel::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = SubscriptionEngine::new(panel.clone(), Arc::new(Settings::default()));
        let ingestor = PaymentIngestor::new(Arc::new(ledger.clone()), engine, notifier.clone());
        Harness {
            ledger,
            panel,
            notifier,
            ingestor,
        }
    }

    fn succeeded(user_id: i64, payment_id: Option<i64>, ppid: &str) -> PaymentEvent {
        PaymentEvent {
            provider: Provider::Yookassa,
            kind: PaymentEventKind::Succeeded,
            user_id,
            months: 1,
            amount: 199.0,
            currency: "RUB".to_string(),
            provider_payment_id: ppid.to_string(),
            payment_id,
            promo_code_id: None,
        }
    }

    #[tokio::test]
    async fn replayed_delivery_extends_once() {
        let h = harness();
        seed_user(&h.ledger, 1, None, None).await.unwrap();
        let payment = h
            .ingestor
            .open_payment(1, Provider::Yookassa, 199.0, "RUB", 1, None)
            .await
            .unwrap();
        assert_eq!(payment.status(), PaymentStatus::Pending);

        let first = h.ingestor.ingest(succeeded(1, Some(payment.id), "yk-1")).await;
        let second = h.ingestor.ingest(succeeded(1, Some(payment.id), "yk-1")).await;

        let WebhookOutcome::Activated { end_time, .. } = first else {
            panic!("expected activation, got {:?}", first);
        };
        assert_eq!(second, WebhookOutcome::Replay);
        let state = h.ledger.snapshot().await;
        assert_eq!(state.subscriptions.len(), 1);
        assert_eq!(state.subscriptions[0].end_time, end_time);
        assert_eq!(state.payments[0].status(), PaymentStatus::Succeeded);
        assert_eq!(state.payments[0].provider_payment_id.as_deref(), Some("yk-1"));
        assert_eq!(
            h.notifier
                .sent()
                .iter()
                .filter(|n| matches!(n, Notification::PaymentSucceeded { .. }))
                .count(),
            1
        );
    }

    /// Ingestor over a store whose transactions interleave statement by
    /// statement, leaving the payment lock as the only serialisation.
    fn interleaving_harness() -> (Harness, PaymentIngestor) {
        let h = harness();
        let engine = SubscriptionEngine::new(h.panel.clone(), Arc::new(Settings::default()));
        let ingestor = PaymentIngestor::new(
            Arc::new(AutocommitLedger::new(h.ledger.clone())),
            engine,
            h.notifier.clone(),
        );
        (h, ingestor)
    }

    #[tokio::test]
    async fn concurrent_deliveries_of_one_payment_activate_once() {
        let (h, ingestor) = interleaving_harness();
        seed_user(&h.ledger, 1, None, None).await.unwrap();
        let payment = ingestor
            .open_payment(1, Provider::Yookassa, 199.0, "RUB", 1, None)
            .await
            .unwrap();
        let event = succeeded(1, Some(payment.id), "yk-dup");

        let (a, b) = tokio::join!(ingestor.ingest(event.clone()), ingestor.ingest(event));
        let outcomes = [a, b];

        assert_eq!(
            outcomes
                .iter()
                .filter(|o| matches!(o, WebhookOutcome::Activated { .. }))
                .count(),
            1
        );
        assert!(outcomes.contains(&WebhookOutcome::Replay));
        assert_eq!(h.ledger.snapshot().await.subscriptions.len(), 1);
        assert_eq!(
            h.notifier
                .sent()
                .iter()
                .filter(|n| matches!(n, Notification::PaymentSucceeded { .. }))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn concurrent_payments_of_one_user_stack() {
        let (h, ingestor) = interleaving_harness();
        seed_user(&h.ledger, 1, None, None).await.unwrap();
        let first = ingestor
            .open_payment(1, Provider::Yookassa, 199.0, "RUB", 1, None)
            .await
            .unwrap();
        let second = ingestor
            .open_payment(1, Provider::Yookassa, 199.0, "RUB", 1, None)
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            ingestor.ingest(succeeded(1, Some(first.id), "yk-a")),
            ingestor.ingest(succeeded(1, Some(second.id), "yk-b")),
        );

        assert!(matches!(a, WebhookOutcome::Activated { .. }));
        assert!(matches!(b, WebhookOutcome::Activated { .. }));
        let state = h.ledger.snapshot().await;
        let active: Vec<_> = state.subscriptions.iter().filter(|s| s.is_active).collect();
        assert_eq!(active.len(), 1);
        let expected = Utc::now() + Duration::days(60);
        assert!((expected - active[0].end_time).num_seconds().abs() < 60);
    }

    #[tokio::test]
    async fn tribute_inserts_its_own_payment_row() {
        let h = harness();
        seed_user(&h.ledger, 5, None, None).await.unwrap();
        let mut event = succeeded(5, None, "trb-77");
        event.provider = Provider::Tribute;
        event.months = 3;

        let outcome = h.ingestor.ingest(event.clone()).await;
        assert!(matches!(outcome, WebhookOutcome::Activated { user_id: 5, .. }));
        assert_eq!(h.ingestor.ingest(event).await, WebhookOutcome::Replay);

        let state = h.ledger.snapshot().await;
        assert_eq!(state.payments.len(), 1);
        assert_eq!(state.payments[0].provider, "tribute");
        let sub = &state.subscriptions[0];
        assert!(sub.skip_notifications);
        assert_eq!(sub.duration_months, 3);
    }

    #[tokio::test]
    async fn cancellation_marks_payment_and_notifies_payer() {
        let h = harness();
        seed_user(&h.ledger, 1, None, None).await.unwrap();
        let payment = h
            .ingestor
            .open_payment(1, Provider::Yookassa, 199.0, "RUB", 1, None)
            .await
            .unwrap();
        let mut event = succeeded(1, Some(payment.id), "yk-2");
        event.kind = PaymentEventKind::Canceled;

        let outcome = h.ingestor.ingest(event).await;

        assert_eq!(outcome, WebhookOutcome::Canceled { payment_id: payment.id });
        let state = h.ledger.snapshot().await;
        assert_eq!(state.payments[0].status(), PaymentStatus::Canceled);
        assert!(state.subscriptions.is_empty());
        assert_eq!(
            h.notifier.sent(),
            vec![Notification::PaymentFailed {
                user_id: 1,
                payment_id: payment.id
            }]
        );
    }

    #[tokio::test]
    async fn payment_for_vanished_user_is_marked_failed() {
        let h = harness();
        seed_user(&h.ledger, 1, None, None).await.unwrap();
        let payment = h
            .ingestor
            .open_payment(1, Provider::Cryptopay, 5.0, "USDT", 1, None)
            .await
            .unwrap();
        // the payer row vanished between invoice and payment
        h.ledger.state.lock().await.users.clear();

        let mut event = succeeded(1, Some(payment.id), "inv-9");
        event.provider = Provider::Cryptopay;
        let outcome = h.ingestor.ingest(event).await;

        assert_eq!(outcome, WebhookOutcome::UnknownUser { user_id: 1 });
        let state = h.ledger.snapshot().await;
        assert_eq!(state.payments[0].status(), PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn conflict_rolls_back_everything() {
        let h = harness();
        seed_user(&h.ledger, 1, None, None).await.unwrap();
        seed_user(&h.ledger, 2, Some("p-shared"), None).await.unwrap();
        let theirs = Utc::now() + Duration::days(4);
        seed_subscription(&h.ledger, 2, "p-shared", "l-shared", theirs)
            .await
            .unwrap();
        h.panel
            .add_user(panel_account("p-shared", Some(1), Some("l-shared"), "ACTIVE", Some(theirs)));
        let payment = h
            .ingestor
            .open_payment(1, Provider::Yookassa, 199.0, "RUB", 1, None)
            .await
            .unwrap();

        let outcome = h.ingestor.ingest(succeeded(1, Some(payment.id), "yk-3")).await;

        assert!(matches!(outcome, WebhookOutcome::Failed(_)));
        let state = h.ledger.snapshot().await;
        assert_eq!(state.payments[0].status(), PaymentStatus::Pending);
        assert_eq!(state.subscriptions.len(), 1);
        assert_eq!(state.subscriptions[0].end_time, theirs);
        assert!(matches!(
            h.notifier.sent().as_slice(),
            [Notification::AdminAlert { .. }]
        ));
    }

    #[tokio::test]
    async fn referral_payout_is_announced_to_the_inviter() {
        let h = harness();
        seed_user(&h.ledger, 10, Some("p-10"), None).await.unwrap();
        seed_subscription(&h.ledger, 10, "p-10", "l-10", Utc::now() + Duration::days(10))
            .await
            .unwrap();
        seed_user(&h.ledger, 11, None, Some(10)).await.unwrap();
        let payment = h
            .ingestor
            .open_payment(11, Provider::Yookassa, 199.0, "RUB", 1, None)
            .await
            .unwrap();

        h.ingestor.ingest(succeeded(11, Some(payment.id), "yk-4")).await;

        let sent = h.notifier.sent();
        assert!(sent.iter().any(|n| matches!(
            n,
            Notification::ReferralBonus { user_id: 10, days: 3, .. }
        )));
        assert!(sent
            .iter()
            .any(|n| matches!(n, Notification::AdminNewPayment { user_id: 11, .. })));
    }

    #[tokio::test]
    async fn open_payment_requires_known_user() {
        let h = harness();
        let err = h
            .ingestor
            .open_payment(42, Provider::TelegramStars, 100.0, "XTR", 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn lenient_numbers_accept_strings() {
        let v = json!({"a": "12", "b": 7, "c": "x", "d": "1.50"});
        assert_eq!(lenient_i64(v.get("a")), Some(12));
        assert_eq!(lenient_i64(v.get("b")), Some(7));
        assert_eq!(lenient_i64(v.get("c")), None);
        assert_eq!(lenient_i64(v.get("missing")), None);
        assert_eq!(lenient_f64(v.get("d")), Some(1.5));
    }

    #[test]
    fn signature_failures_map_to_client_errors() {
        assert_eq!(WebhookError::MissingSignature.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            WebhookError::Malformed("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookError::Disabled(Provider::Tribute).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
