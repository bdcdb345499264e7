use serde::{Deserialize, Serialize};
use chrono::{DateTime, NaiveDate, Utc};


#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub panel_identity: Option<String>,
    pub is_banned: bool,
    pub referred_by_id: Option<i64>,
    pub language: Option<String>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewUser {
    pub user_id: i64,
    pub username: Option<String>,
    pub panel_identity: Option<String>,
    pub referred_by_id: Option<i64>,
    pub language: Option<String>,
    pub registered_at: DateTime<Utc>,
}

/// One panel-side access grant. Rows are never deleted; retiring a grant
/// flips `is_active` to false.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: i64,
    pub user_id: Option<i64>,
    pub panel_identity: String,
    pub panel_subscription_link: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_months: i32,
    pub is_active: bool,
    pub status_label: Option<String>,
    pub traffic_limit_bytes: Option<i64>,
    pub traffic_used_bytes: Option<i64>,
    /// Day the last expiry notice was sent; cleared whenever the end moves.
    pub last_notification_sent: Option<NaiveDate>,
    pub provider: Option<String>,
    pub skip_notifications: bool,
}

/// Field set written by an upsert keyed on `panel_subscription_link`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpsert {
    pub user_id: Option<i64>,
    pub panel_identity: String,
    pub panel_subscription_link: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_months: i32,
    pub is_active: bool,
    pub status_label: String,
    pub traffic_limit_bytes: Option<i64>,
    pub traffic_used_bytes: Option<i64>,
    pub provider: Option<String>,
    pub skip_notifications: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Yookassa,
    Cryptopay,
    Tribute,
    TelegramStars,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Yookassa => "yookassa",
            Provider::Cryptopay => "cryptopay",
            Provider::Tribute => "tribute",
            Provider::TelegramStars => "telegram_stars",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Canceled => "canceled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "succeeded" => PaymentStatus::Succeeded,
            "failed" => PaymentStatus::Failed,
            "canceled" => PaymentStatus::Canceled,
            _ => PaymentStatus::Pending,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Payment {
    pub id: i64,
    pub user_id: i64,
    pub provider: String,
    pub provider_payment_id: Option<String>,
    pub idempotence_key: Option<String>,
    pub status: String,
    pub amount: f64,
    pub currency: String,
    pub subscription_months: i32,
    pub promo_code_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Payment {
    pub fn status(&self) -> PaymentStatus {
        PaymentStatus::from_string(&self.status)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPayment {
    pub user_id: i64,
    pub provider: Provider,
    pub provider_payment_id: Option<String>,
    pub idempotence_key: Option<String>,
    pub status: PaymentStatus,
    pub amount: f64,
    pub currency: String,
    pub subscription_months: i32,
    pub promo_code_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    pub bonus_days: i32,
    pub max_activations: i32,
    pub current_activations: i32,
    pub is_active: bool,
    pub valid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl PromoCode {
    pub fn is_redeemable(&self, now: DateTime<Utc>) -> bool {
        self.is_active
            && self.current_activations < self.max_activations
            && self.valid_until.map_or(true, |until| until > now)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PromoActivation {
    pub id: i64,
    pub promo_code_id: i64,
    pub user_id: i64,
    pub payment_id: Option<i64>,
    pub activated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Success,
    PartialSuccess,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Success => "success",
            SyncState::PartialSuccess => "partial_success",
            SyncState::Failed => "failed",
        }
    }
}

/// Singleton row summarising the last reconciliation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct SyncStatus {
    pub last_sync_time: DateTime<Utc>,
    pub status: String,
    pub details: String,
    pub users_processed: i32,
    pub subscriptions_synced: i32,
}
