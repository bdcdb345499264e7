//! Local ledger: users, subscriptions, payments and promo codes.
//!
//! All access goes through a [`LedgerTx`]; nothing is visible to other
//! transactions until [`LedgerTx::commit`].

mod memory;
mod postgres;

pub use memory::{AutocommitLedger, MemoryLedger, MemoryState};
pub use postgres::PgLedger;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::error::LedgerResult;
use crate::models::{
    NewPayment, NewUser, Payment, PaymentStatus, PromoActivation, PromoCode, Provider,
    Subscription, SubscriptionUpsert, SyncStatus, User,
};

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>>;
}

#[async_trait]
pub trait LedgerTx: Send {
    // users
    async fn get_user(&mut self, user_id: i64) -> LedgerResult<Option<User>>;
    async fn user_by_panel_identity(&mut self, panel_identity: &str) -> LedgerResult<Option<User>>;
    async fn insert_user(&mut self, user: &NewUser) -> LedgerResult<User>;
    async fn set_panel_identity(&mut self, user_id: i64, panel_identity: Option<&str>)
        -> LedgerResult<()>;
    async fn set_banned(&mut self, user_id: i64, banned: bool) -> LedgerResult<()>;
    /// Every local user currently linked to a panel account.
    async fn users_with_panel_identity(&mut self) -> LedgerResult<Vec<User>>;

    // subscriptions
    async fn active_subscription_by_identity(
        &mut self,
        panel_identity: &str,
    ) -> LedgerResult<Option<Subscription>>;
    async fn active_subscription_for_user(&mut self, user_id: i64)
        -> LedgerResult<Option<Subscription>>;
    async fn subscriptions_by_identity(&mut self, panel_identity: &str)
        -> LedgerResult<Vec<Subscription>>;
    async fn subscription_by_link(&mut self, link: &str) -> LedgerResult<Option<Subscription>>;
    async fn has_any_subscription(&mut self, user_id: i64) -> LedgerResult<bool>;
    /// Flips `is_active` off for every active row of `panel_identity`
    /// except the one keyed by `keep_link`. Returns the number of rows changed.
    async fn deactivate_siblings(
        &mut self,
        panel_identity: &str,
        keep_link: Option<&str>,
    ) -> LedgerResult<u64>;
    /// Insert-or-update keyed by `panel_subscription_link`. `last_notification_sent`
    /// is cleared only when the end time moves.
    async fn upsert_subscription(&mut self, upsert: &SubscriptionUpsert)
        -> LedgerResult<Subscription>;
    /// Moves the end time of an existing row, reactivating it and clearing
    /// `last_notification_sent`.
    async fn extend_subscription(
        &mut self,
        subscription_id: i64,
        end_time: DateTime<Utc>,
        status_label: &str,
    ) -> LedgerResult<Subscription>;
    async fn set_skip_notifications(&mut self, subscription_id: i64, skip: bool)
        -> LedgerResult<()>;
    /// Remembers the day an expiry notice went out for this row.
    async fn mark_notified(&mut self, subscription_id: i64, on: NaiveDate) -> LedgerResult<()>;
    /// Active rows produced by `provider` whose end time is at or before `until`.
    async fn expiring_subscriptions(
        &mut self,
        provider: Provider,
        until: DateTime<Utc>,
    ) -> LedgerResult<Vec<Subscription>>;

    // payments
    async fn insert_payment(&mut self, payment: &NewPayment) -> LedgerResult<Payment>;
    async fn payment_by_id(&mut self, payment_id: i64) -> LedgerResult<Option<Payment>>;
    async fn payment_by_provider_id(&mut self, provider_payment_id: &str)
        -> LedgerResult<Option<Payment>>;
    async fn update_payment_status(
        &mut self,
        payment_id: i64,
        status: PaymentStatus,
        provider_payment_id: Option<&str>,
    ) -> LedgerResult<Payment>;
    async fn has_succeeded_payment(&mut self, user_id: i64, provider: Provider)
        -> LedgerResult<bool>;

    // promo codes
    async fn promo_by_code(&mut self, code: &str) -> LedgerResult<Option<PromoCode>>;
    async fn promo_by_id(&mut self, promo_id: i64) -> LedgerResult<Option<PromoCode>>;
    async fn promo_activation(&mut self, promo_id: i64, user_id: i64)
        -> LedgerResult<Option<PromoActivation>>;
    /// Claims one activation slot and records the activation. The cap is
    /// re-checked by the increment itself; `None` means the code ran out of
    /// activations and nothing was written.
    async fn record_promo_activation(
        &mut self,
        promo_id: i64,
        user_id: i64,
        payment_id: Option<i64>,
    ) -> LedgerResult<Option<PromoActivation>>;

    // sync status
    async fn sync_status(&mut self) -> LedgerResult<Option<SyncStatus>>;
    async fn save_sync_status(&mut self, status: &SyncStatus) -> LedgerResult<()>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;
    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}
