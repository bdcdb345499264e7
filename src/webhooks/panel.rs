//! Expiry events pushed by the VPN panel and forwarded to the subscriber.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use log::{error, info, warn};
use serde_json::Value;

use super::signature::verify_hmac_sha256;
use super::{parse_json, WebhookError};
use crate::config::Settings;
use crate::error::LedgerResult;
use crate::ledger::{Ledger, LedgerTx};
use crate::models::Subscription;
use crate::notify::{Notification, Notifier};
use crate::panel::PanelUser;

pub const SIGNATURE_HEADER: &str = "X-Remnawave-Signature";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryEventKind {
    /// The panel warns 72, 48 and 24 hours ahead.
    ExpiresIn { days: i64 },
    Expired,
    ExpiredYesterday,
}

impl ExpiryEventKind {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "user.expires_in_72_hours" => ExpiryEventKind::ExpiresIn { days: 3 },
            "user.expires_in_48_hours" => ExpiryEventKind::ExpiresIn { days: 2 },
            "user.expires_in_24_hours" => ExpiryEventKind::ExpiresIn { days: 1 },
            "user.expired" => ExpiryEventKind::Expired,
            "user.expired_24_hours_ago" => ExpiryEventKind::ExpiredYesterday,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpiryEvent {
    pub kind: ExpiryEventKind,
    pub user_id: i64,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Verifies and normalises a panel event. `Ok(None)` means the delivery is
/// acknowledged without effect.
pub fn parse_request(
    settings: &Settings,
    signature: Option<&str>,
    body: &[u8],
) -> Result<Option<ExpiryEvent>, WebhookError> {
    let secret = settings
        .panel_webhook_secret
        .as_deref()
        .ok_or(WebhookError::PanelDisabled)?;
    verify_hmac_sha256(secret.as_bytes(), body, signature)?;
    let payload = parse_json(body)?;

    let Some(name) = payload
        .get("name")
        .or_else(|| payload.get("event"))
        .and_then(Value::as_str)
    else {
        info!("Panel webhook without event name ignored");
        return Ok(None);
    };
    let Some(kind) = ExpiryEventKind::from_name(name) else {
        info!("Panel event {} ignored", name);
        return Ok(None);
    };
    let Some(user) = user_object(&payload) else {
        warn!("Panel event {} carries no user", name);
        return Ok(None);
    };
    let account: PanelUser = serde_json::from_value(user.clone())
        .map_err(|e| WebhookError::Malformed(e.to_string()))?;
    let Some(user_id) = account.telegram_id else {
        warn!(
            "Panel event {} for account {:?} without telegram id ignored",
            name, account.uuid
        );
        return Ok(None);
    };
    let expire_at = account.expires_at().unwrap_or_else(|e| {
        warn!("Panel event {} has unreadable expireAt: {}", name, e);
        None
    });

    Ok(Some(ExpiryEvent {
        kind,
        user_id,
        expire_at,
    }))
}

/// `payload.user`, `payload`, `data.user` or `data`, first non-empty wins.
fn user_object(payload: &Value) -> Option<&Value> {
    let non_empty = |v: &&Value| v.as_object().map_or(false, |o| !o.is_empty());
    ["payload", "data"].iter().find_map(|key| {
        let container = payload.get(*key).filter(non_empty)?;
        Some(container.get("user").filter(non_empty).unwrap_or(container))
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExpiryOutcome {
    Notified,
    /// Switched off in settings, or not the warning we forward.
    Muted,
    /// The subscription opted out, or the user already heard today.
    Suppressed(String),
    Failed(String),
}

impl ExpiryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExpiryOutcome::Notified => "notified",
            ExpiryOutcome::Muted => "muted",
            ExpiryOutcome::Suppressed(_) => "suppressed",
            ExpiryOutcome::Failed(_) => "failed",
        }
    }
}

enum Delivery {
    Send,
    Suppress(String),
}

#[derive(Clone)]
pub struct ExpiryNotifier {
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    settings: Arc<Settings>,
}

impl ExpiryNotifier {
    pub fn new(ledger: Arc<dyn Ledger>, notifier: Arc<dyn Notifier>, settings: Arc<Settings>) -> Self {
        ExpiryNotifier {
            ledger,
            notifier,
            settings,
        }
    }

    pub async fn handle(&self, event: &ExpiryEvent) -> ExpiryOutcome {
        self.handle_on(event, Utc::now().date_naive()).await
    }

    /// At most one notice per subscription and day; rows flagged
    /// `skip_notifications` (Tribute bills on its own) get none.
    pub async fn handle_on(&self, event: &ExpiryEvent, today: NaiveDate) -> ExpiryOutcome {
        let Some(notification) = self.notification_for(event) else {
            return ExpiryOutcome::Muted;
        };

        let mut tx = match self.ledger.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                error!("Cannot open transaction for panel event: {}", e);
                return ExpiryOutcome::Failed(e.to_string());
            }
        };
        match claim(tx.as_mut(), event.user_id, today).await {
            Ok(Delivery::Send) => {
                if let Err(e) = tx.commit().await {
                    error!("Recording expiry notice for user {} failed: {}", event.user_id, e);
                    return ExpiryOutcome::Failed(e.to_string());
                }
            }
            Ok(Delivery::Suppress(reason)) => {
                if let Err(e) = tx.rollback().await {
                    warn!("Rollback of expiry check failed: {}", e);
                }
                info!("Expiry notice for user {} suppressed: {}", event.user_id, reason);
                return ExpiryOutcome::Suppressed(reason);
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    error!("Rollback after failed expiry check: {}", rb);
                }
                error!("Expiry check for user {} failed: {}", event.user_id, e);
                return ExpiryOutcome::Failed(e.to_string());
            }
        }

        self.notifier.notify(&notification).await;
        info!("Expiry notice {:?} sent to user {}", event.kind, event.user_id);
        ExpiryOutcome::Notified
    }

    fn notification_for(&self, event: &ExpiryEvent) -> Option<Notification> {
        let settings = &self.settings;
        if !settings.subscription_notifications_enabled {
            return None;
        }
        let user_id = event.user_id;
        match event.kind {
            ExpiryEventKind::ExpiresIn { days } if days == settings.subscription_notify_days_before => {
                Some(Notification::SubscriptionExpiring {
                    user_id,
                    days_left: days,
                    end_time: event.expire_at,
                })
            }
            ExpiryEventKind::Expired if settings.subscription_notify_on_expire => {
                Some(Notification::SubscriptionExpired { user_id })
            }
            ExpiryEventKind::ExpiredYesterday if settings.subscription_notify_after_expire => {
                Some(Notification::SubscriptionExpiredYesterday { user_id })
            }
            _ => None,
        }
    }
}

async fn claim(tx: &mut dyn LedgerTx, user_id: i64, today: NaiveDate) -> LedgerResult<Delivery> {
    let Some(sub) = latest_subscription(tx, user_id).await? else {
        return Ok(Delivery::Send);
    };
    if sub.skip_notifications {
        return Ok(Delivery::Suppress(format!(
            "subscription {} skips notifications",
            sub.id
        )));
    }
    if sub.last_notification_sent == Some(today) {
        return Ok(Delivery::Suppress(format!(
            "subscription {} already notified on {}",
            sub.id, today
        )));
    }
    tx.mark_notified(sub.id, today).await?;
    Ok(Delivery::Send)
}

/// Active row first, then the latest end.
async fn latest_subscription(
    tx: &mut dyn LedgerTx,
    user_id: i64,
) -> LedgerResult<Option<Subscription>> {
    let Some(user) = tx.get_user(user_id).await? else {
        return Ok(None);
    };
    let rows = match user.panel_identity.as_deref() {
        Some(identity) => tx.subscriptions_by_identity(identity).await?,
        None => tx
            .active_subscription_for_user(user_id)
            .await?
            .into_iter()
            .collect(),
    };
    Ok(rows.into_iter().max_by_key(|s| (s.is_active, s.end_time)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_subscription, seed_user, MemoryLedger, RecordingNotifier};
    use crate::webhooks::signature::hmac_sha256_hex;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn settings() -> Settings {
        Settings {
            panel_webhook_secret: Some("panel-secret".to_string()),
            ..Settings::default()
        }
    }

    fn signed(body: &Value) -> (Vec<u8>, String) {
        let bytes = serde_json::to_vec(body).unwrap();
        let sig = hmac_sha256_hex(b"panel-secret", &bytes);
        (bytes, sig)
    }

    fn event(kind: ExpiryEventKind, user_id: i64) -> ExpiryEvent {
        ExpiryEvent {
            kind,
            user_id,
            expire_at: None,
        }
    }

    fn notifier_over(
        ledger: &MemoryLedger,
        settings: Settings,
    ) -> (ExpiryNotifier, Arc<RecordingNotifier>) {
        let recorder = Arc::new(RecordingNotifier::new());
        let notifier = ExpiryNotifier::new(
            Arc::new(ledger.clone()),
            recorder.clone(),
            Arc::new(settings),
        );
        (notifier, recorder)
    }

    #[test]
    fn warning_reads_the_panel_user() {
        let (body, sig) = signed(&json!({
            "event": "user.expires_in_72_hours",
            "payload": {
                "user": {
                    "uuid": "p-1",
                    "telegramId": "42",
                    "expireAt": "2025-06-03T12:00:00.000Z",
                    "status": "ACTIVE"
                }
            }
        }));

        let parsed = parse_request(&settings(), Some(&sig), &body).unwrap().unwrap();

        assert_eq!(parsed.kind, ExpiryEventKind::ExpiresIn { days: 3 });
        assert_eq!(parsed.user_id, 42);
        assert_eq!(
            parsed.expire_at,
            Some(Utc.with_ymd_and_hms(2025, 6, 3, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn data_user_and_name_field_are_accepted() {
        let (body, sig) = signed(&json!({
            "name": "user.expired_24_hours_ago",
            "payload": {},
            "data": {"user": {"telegramId": 7}}
        }));
        let parsed = parse_request(&settings(), Some(&sig), &body).unwrap().unwrap();
        assert_eq!(parsed.kind, ExpiryEventKind::ExpiredYesterday);
        assert_eq!(parsed.user_id, 7);
    }

    #[test]
    fn unrelated_or_anonymous_events_are_acknowledged() {
        let (body, sig) = signed(&json!({"event": "user.created", "payload": {"telegramId": 1}}));
        assert_eq!(parse_request(&settings(), Some(&sig), &body).unwrap(), None);

        let (body, sig) = signed(&json!({"event": "user.expired", "payload": {"uuid": "p-9"}}));
        assert_eq!(parse_request(&settings(), Some(&sig), &body).unwrap(), None);

        let (body, sig) = signed(&json!({"payload": {"telegramId": 1}}));
        assert_eq!(parse_request(&settings(), Some(&sig), &body).unwrap(), None);
    }

    #[test]
    fn signature_is_required() {
        let err = parse_request(&settings(), None, b"{}").unwrap_err();
        assert!(matches!(err, WebhookError::MissingSignature));
        let err = parse_request(&settings(), Some("abcd"), b"{}").unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
        let err = parse_request(&Settings::default(), None, b"{}").unwrap_err();
        assert!(matches!(err, WebhookError::PanelDisabled));
    }

    #[tokio::test]
    async fn configured_warning_is_sent_once_a_day() {
        let ledger = MemoryLedger::new();
        seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
        seed_subscription(&ledger, 1, "p-1", "l-1", Utc::now() + Duration::days(3))
            .await
            .unwrap();
        let (expiry, recorder) = notifier_over(&ledger, settings());
        let today = Utc::now().date_naive();
        let warning = event(ExpiryEventKind::ExpiresIn { days: 3 }, 1);

        assert_eq!(expiry.handle_on(&warning, today).await, ExpiryOutcome::Notified);
        assert!(matches!(
            expiry.handle_on(&warning, today).await,
            ExpiryOutcome::Suppressed(_)
        ));

        assert_eq!(
            recorder.sent(),
            vec![Notification::SubscriptionExpiring {
                user_id: 1,
                days_left: 3,
                end_time: None
            }]
        );
        let state = ledger.snapshot().await;
        assert_eq!(state.subscriptions[0].last_notification_sent, Some(today));
    }

    #[tokio::test]
    async fn other_warnings_and_disabled_kinds_are_muted() {
        let ledger = MemoryLedger::new();
        let (expiry, recorder) = notifier_over(
            &ledger,
            Settings {
                subscription_notify_on_expire: false,
                ..settings()
            },
        );
        let today = Utc::now().date_naive();

        let early = event(ExpiryEventKind::ExpiresIn { days: 2 }, 1);
        assert_eq!(expiry.handle_on(&early, today).await, ExpiryOutcome::Muted);
        let expired = event(ExpiryEventKind::Expired, 1);
        assert_eq!(expiry.handle_on(&expired, today).await, ExpiryOutcome::Muted);

        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn opted_out_subscriptions_hear_nothing() {
        let ledger = MemoryLedger::new();
        seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
        let sub = seed_subscription(&ledger, 1, "p-1", "l-1", Utc::now())
            .await
            .unwrap();
        let mut tx = ledger.begin().await.unwrap();
        tx.set_skip_notifications(sub.id, true).await.unwrap();
        tx.commit().await.unwrap();
        let (expiry, recorder) = notifier_over(&ledger, settings());

        let outcome = expiry
            .handle_on(&event(ExpiryEventKind::Expired, 1), Utc::now().date_naive())
            .await;

        assert!(matches!(outcome, ExpiryOutcome::Suppressed(_)));
        assert!(recorder.sent().is_empty());
        assert_eq!(ledger.snapshot().await.subscriptions[0].last_notification_sent, None);
    }

    #[tokio::test]
    async fn next_day_notice_goes_out_again() {
        let ledger = MemoryLedger::new();
        seed_user(&ledger, 1, Some("p-1"), None).await.unwrap();
        seed_subscription(&ledger, 1, "p-1", "l-1", Utc::now())
            .await
            .unwrap();
        let (expiry, recorder) = notifier_over(&ledger, settings());
        let today = Utc::now().date_naive();

        let expired = event(ExpiryEventKind::Expired, 1);
        assert_eq!(expiry.handle_on(&expired, today).await, ExpiryOutcome::Notified);
        let later = event(ExpiryEventKind::ExpiredYesterday, 1);
        let tomorrow = today.succ_opt().unwrap();
        assert_eq!(expiry.handle_on(&later, tomorrow).await, ExpiryOutcome::Notified);

        assert_eq!(recorder.sent().len(), 2);
    }
}
