use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{Ledger, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    NewPayment, NewUser, Payment, PaymentStatus, PromoActivation, PromoCode, Provider,
    Subscription, SubscriptionUpsert, SyncStatus, User,
};

/// Whole-store contents of a [`MemoryLedger`].
#[derive(Debug, Clone, Default)]
pub struct MemoryState {
    pub users: Vec<User>,
    pub subscriptions: Vec<Subscription>,
    pub payments: Vec<Payment>,
    pub promo_codes: Vec<PromoCode>,
    pub promo_activations: Vec<PromoActivation>,
    pub sync_status: Option<SyncStatus>,
    next_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_single_active(&self, panel_identity: &str, link: &str) -> LedgerResult<()> {
        let clash = self.subscriptions.iter().any(|s| {
            s.is_active && s.panel_identity == panel_identity && s.panel_subscription_link != link
        });
        if clash {
            return Err(LedgerError::Constraint(format!(
                "second active subscription for {}",
                panel_identity
            )));
        }
        Ok(())
    }
}

/// In-process ledger with the same constraints as the Postgres schema.
///
/// A transaction holds the store lock from `begin` to `commit`/`rollback`
/// and works on a private copy, so transactions are fully serialised.
/// Opening a second transaction from the task that holds one deadlocks.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    pub(crate) state: Arc<Mutex<MemoryState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        MemoryLedger::default()
    }

    /// Copy of the committed state.
    pub async fn snapshot(&self) -> MemoryState {
        self.state.lock().await.clone()
    }

    pub async fn add_promo_code(
        &self,
        code: &str,
        bonus_days: i32,
        max_activations: i32,
        valid_until: Option<DateTime<Utc>>,
    ) -> PromoCode {
        let mut state = self.state.lock().await;
        let promo = PromoCode {
            id: state.next_id(),
            code: code.to_uppercase(),
            bonus_days,
            max_activations,
            current_activations: 0,
            is_active: true,
            valid_until,
            created_at: Utc::now(),
        };
        state.promo_codes.push(promo.clone());
        promo
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
}

impl MemoryTx {
    fn subscription_mut(&mut self, id: i64) -> LedgerResult<&mut Subscription> {
        self.work
            .subscriptions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| LedgerError::NotFound(format!("subscription {}", id)))
    }

    fn user_mut(&mut self, user_id: i64) -> LedgerResult<&mut User> {
        self.work
            .users
            .iter_mut()
            .find(|u| u.user_id == user_id)
            .ok_or_else(|| LedgerError::NotFound(format!("user {}", user_id)))
    }

    fn latest_active<'a>(
        subs: impl Iterator<Item = &'a Subscription>,
    ) -> Option<Subscription> {
        subs.filter(|s| s.is_active).max_by_key(|s| s.end_time).cloned()
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn get_user(&mut self, user_id: i64) -> LedgerResult<Option<User>> {
        Ok(self.work.users.iter().find(|u| u.user_id == user_id).cloned())
    }

    async fn user_by_panel_identity(&mut self, panel_identity: &str) -> LedgerResult<Option<User>> {
        Ok(self
            .work
            .users
            .iter()
            .find(|u| u.panel_identity.as_deref() == Some(panel_identity))
            .cloned())
    }

    async fn insert_user(&mut self, user: &NewUser) -> LedgerResult<User> {
        if self.work.users.iter().any(|u| u.user_id == user.user_id) {
            return Err(LedgerError::Constraint(format!("user {} exists", user.user_id)));
        }
        if let Some(identity) = &user.panel_identity {
            if self.user_by_panel_identity(identity).await?.is_some() {
                return Err(LedgerError::Constraint(format!("panel identity {} taken", identity)));
            }
        }
        let row = User {
            user_id: user.user_id,
            username: user.username.clone(),
            panel_identity: user.panel_identity.clone(),
            is_banned: false,
            referred_by_id: user.referred_by_id,
            language: user.language.clone(),
            registered_at: user.registered_at,
        };
        self.work.users.push(row.clone());
        Ok(row)
    }

    async fn set_panel_identity(
        &mut self,
        user_id: i64,
        panel_identity: Option<&str>,
    ) -> LedgerResult<()> {
        if let Some(identity) = panel_identity {
            let taken = self
                .work
                .users
                .iter()
                .any(|u| u.user_id != user_id && u.panel_identity.as_deref() == Some(identity));
            if taken {
                return Err(LedgerError::Constraint(format!("panel identity {} taken", identity)));
            }
        }
        self.user_mut(user_id)?.panel_identity = panel_identity.map(str::to_string);
        Ok(())
    }

    async fn set_banned(&mut self, user_id: i64, banned: bool) -> LedgerResult<()> {
        self.user_mut(user_id)?.is_banned = banned;
        Ok(())
    }

    async fn users_with_panel_identity(&mut self) -> LedgerResult<Vec<User>> {
        let mut users: Vec<User> = self
            .work
            .users
            .iter()
            .filter(|u| u.panel_identity.is_some())
            .cloned()
            .collect();
        users.sort_by_key(|u| u.user_id);
        Ok(users)
    }

    async fn active_subscription_by_identity(
        &mut self,
        panel_identity: &str,
    ) -> LedgerResult<Option<Subscription>> {
        Ok(Self::latest_active(
            self.work
                .subscriptions
                .iter()
                .filter(|s| s.panel_identity == panel_identity),
        ))
    }

    async fn active_subscription_for_user(
        &mut self,
        user_id: i64,
    ) -> LedgerResult<Option<Subscription>> {
        Ok(Self::latest_active(
            self.work
                .subscriptions
                .iter()
                .filter(|s| s.user_id == Some(user_id)),
        ))
    }

    async fn subscriptions_by_identity(
        &mut self,
        panel_identity: &str,
    ) -> LedgerResult<Vec<Subscription>> {
        Ok(self
            .work
            .subscriptions
            .iter()
            .filter(|s| s.panel_identity == panel_identity)
            .cloned()
            .collect())
    }

    async fn subscription_by_link(&mut self, link: &str) -> LedgerResult<Option<Subscription>> {
        Ok(self
            .work
            .subscriptions
            .iter()
            .find(|s| s.panel_subscription_link == link)
            .cloned())
    }

    async fn has_any_subscription(&mut self, user_id: i64) -> LedgerResult<bool> {
        Ok(self
            .work
            .subscriptions
            .iter()
            .any(|s| s.user_id == Some(user_id)))
    }

    async fn deactivate_siblings(
        &mut self,
        panel_identity: &str,
        keep_link: Option<&str>,
    ) -> LedgerResult<u64> {
        let mut changed = 0;
        for sub in self.work.subscriptions.iter_mut() {
            if sub.is_active
                && sub.panel_identity == panel_identity
                && keep_link != Some(sub.panel_subscription_link.as_str())
            {
                sub.is_active = false;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn upsert_subscription(
        &mut self,
        upsert: &SubscriptionUpsert,
    ) -> LedgerResult<Subscription> {
        if upsert.is_active {
            self.work
                .check_single_active(&upsert.panel_identity, &upsert.panel_subscription_link)?;
        }

        let existing = self
            .work
            .subscriptions
            .iter_mut()
            .find(|s| s.panel_subscription_link == upsert.panel_subscription_link);

        if let Some(row) = existing {
            if row.end_time != upsert.end_time {
                row.last_notification_sent = None;
            }
            if upsert.user_id.is_some() {
                row.user_id = upsert.user_id;
            }
            row.panel_identity = upsert.panel_identity.clone();
            row.start_time = upsert.start_time;
            row.end_time = upsert.end_time;
            row.duration_months = upsert.duration_months;
            row.is_active = upsert.is_active;
            row.status_label = Some(upsert.status_label.clone());
            row.traffic_limit_bytes = upsert.traffic_limit_bytes;
            row.traffic_used_bytes = upsert.traffic_used_bytes;
            row.provider = upsert.provider.clone();
            row.skip_notifications = upsert.skip_notifications;
            return Ok(row.clone());
        }

        let row = Subscription {
            id: self.work.next_id(),
            user_id: upsert.user_id,
            panel_identity: upsert.panel_identity.clone(),
            panel_subscription_link: upsert.panel_subscription_link.clone(),
            start_time: upsert.start_time,
            end_time: upsert.end_time,
            duration_months: upsert.duration_months,
            is_active: upsert.is_active,
            status_label: Some(upsert.status_label.clone()),
            traffic_limit_bytes: upsert.traffic_limit_bytes,
            traffic_used_bytes: upsert.traffic_used_bytes,
            last_notification_sent: None,
            provider: upsert.provider.clone(),
            skip_notifications: upsert.skip_notifications,
        };
        self.work.subscriptions.push(row.clone());
        Ok(row)
    }

    async fn extend_subscription(
        &mut self,
        subscription_id: i64,
        end_time: DateTime<Utc>,
        status_label: &str,
    ) -> LedgerResult<Subscription> {
        let (identity, link) = {
            let row = self.subscription_mut(subscription_id)?;
            (row.panel_identity.clone(), row.panel_subscription_link.clone())
        };
        self.work.check_single_active(&identity, &link)?;

        let row = self.subscription_mut(subscription_id)?;
        row.end_time = end_time;
        row.is_active = true;
        row.status_label = Some(status_label.to_string());
        row.last_notification_sent = None;
        Ok(row.clone())
    }

    async fn set_skip_notifications(&mut self, subscription_id: i64, skip: bool) -> LedgerResult<()> {
        self.subscription_mut(subscription_id)?.skip_notifications = skip;
        Ok(())
    }

    async fn mark_notified(&mut self, subscription_id: i64, on: NaiveDate) -> LedgerResult<()> {
        self.subscription_mut(subscription_id)?.last_notification_sent = Some(on);
        Ok(())
    }

    async fn expiring_subscriptions(
        &mut self,
        provider: Provider,
        until: DateTime<Utc>,
    ) -> LedgerResult<Vec<Subscription>> {
        let mut rows: Vec<Subscription> = self
            .work
            .subscriptions
            .iter()
            .filter(|s| {
                s.is_active
                    && s.user_id.is_some()
                    && s.provider.as_deref() == Some(provider.as_str())
                    && s.end_time <= until
            })
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.end_time);
        Ok(rows)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> LedgerResult<Payment> {
        let duplicate = self.work.payments.iter().any(|p| {
            (payment.provider_payment_id.is_some()
                && p.provider_payment_id == payment.provider_payment_id)
                || (payment.idempotence_key.is_some()
                    && p.idempotence_key == payment.idempotence_key)
        });
        if duplicate {
            return Err(LedgerError::Constraint("duplicate payment key".to_string()));
        }
        let row = Payment {
            id: self.work.next_id(),
            user_id: payment.user_id,
            provider: payment.provider.as_str().to_string(),
            provider_payment_id: payment.provider_payment_id.clone(),
            idempotence_key: payment.idempotence_key.clone(),
            status: payment.status.as_str().to_string(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            subscription_months: payment.subscription_months,
            promo_code_id: payment.promo_code_id,
            created_at: Utc::now(),
            updated_at: None,
        };
        self.work.payments.push(row.clone());
        Ok(row)
    }

    async fn payment_by_id(&mut self, payment_id: i64) -> LedgerResult<Option<Payment>> {
        Ok(self.work.payments.iter().find(|p| p.id == payment_id).cloned())
    }

    async fn payment_by_provider_id(
        &mut self,
        provider_payment_id: &str,
    ) -> LedgerResult<Option<Payment>> {
        Ok(self
            .work
            .payments
            .iter()
            .find(|p| p.provider_payment_id.as_deref() == Some(provider_payment_id))
            .cloned())
    }

    async fn update_payment_status(
        &mut self,
        payment_id: i64,
        status: PaymentStatus,
        provider_payment_id: Option<&str>,
    ) -> LedgerResult<Payment> {
        if let Some(ppid) = provider_payment_id {
            let taken = self
                .work
                .payments
                .iter()
                .any(|p| p.id != payment_id && p.provider_payment_id.as_deref() == Some(ppid));
            if taken {
                return Err(LedgerError::Constraint(format!("provider payment id {} taken", ppid)));
            }
        }
        let row = self
            .work
            .payments
            .iter_mut()
            .find(|p| p.id == payment_id)
            .ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))?;
        row.status = status.as_str().to_string();
        if let Some(ppid) = provider_payment_id {
            row.provider_payment_id = Some(ppid.to_string());
        }
        row.updated_at = Some(Utc::now());
        Ok(row.clone())
    }

    async fn has_succeeded_payment(&mut self, user_id: i64, provider: Provider) -> LedgerResult<bool> {
        Ok(self.work.payments.iter().any(|p| {
            p.user_id == user_id
                && p.provider == provider.as_str()
                && p.status() == PaymentStatus::Succeeded
        }))
    }

    async fn promo_by_code(&mut self, code: &str) -> LedgerResult<Option<PromoCode>> {
        Ok(self.work.promo_codes.iter().find(|p| p.code == code).cloned())
    }

    async fn promo_by_id(&mut self, promo_id: i64) -> LedgerResult<Option<PromoCode>> {
        Ok(self.work.promo_codes.iter().find(|p| p.id == promo_id).cloned())
    }

    async fn promo_activation(
        &mut self,
        promo_id: i64,
        user_id: i64,
    ) -> LedgerResult<Option<PromoActivation>> {
        Ok(self
            .work
            .promo_activations
            .iter()
            .find(|a| a.promo_code_id == promo_id && a.user_id == user_id)
            .cloned())
    }

    async fn record_promo_activation(
        &mut self,
        promo_id: i64,
        user_id: i64,
        payment_id: Option<i64>,
    ) -> LedgerResult<Option<PromoActivation>> {
        if self.promo_activation(promo_id, user_id).await?.is_some() {
            return Err(LedgerError::Constraint(format!(
                "promo {} already activated by {}",
                promo_id, user_id
            )));
        }
        let promo = self
            .work
            .promo_codes
            .iter_mut()
            .find(|p| p.id == promo_id)
            .ok_or_else(|| LedgerError::NotFound(format!("promo code {}", promo_id)))?;
        if promo.current_activations >= promo.max_activations {
            return Ok(None);
        }
        promo.current_activations += 1;
        let id = self.work.next_id();

        let activation = PromoActivation {
            id,
            promo_code_id: promo_id,
            user_id,
            payment_id,
            activated_at: Utc::now(),
        };
        self.work.promo_activations.push(activation.clone());
        Ok(Some(activation))
    }

    async fn sync_status(&mut self) -> LedgerResult<Option<SyncStatus>> {
        Ok(self.work.sync_status.clone())
    }

    async fn save_sync_status(&mut self, status: &SyncStatus) -> LedgerResult<()> {
        self.work.sync_status = Some(status.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}

/// Runs one statement against the shared store and publishes its effect
/// immediately. Yields first so concurrent callers interleave.
macro_rules! statement {
    ($state:expr, $tx:ident => $call:expr) => {{
        tokio::task::yield_now().await;
        let guard = $state.clone().lock_owned().await;
        let work = guard.clone();
        let mut $tx = MemoryTx { guard, work };
        let result = $call.await;
        if result.is_ok() {
            let MemoryTx { mut guard, work } = $tx;
            *guard = work;
        }
        result
    }};
}

/// Store of a [`MemoryLedger`] seen through transactions that do not
/// serialise: every statement commits on its own and yields to the
/// scheduler first, the way concurrent READ COMMITTED sessions interleave.
/// `rollback` cannot undo anything.
#[derive(Clone)]
pub struct AutocommitLedger {
    store: MemoryLedger,
}

impl AutocommitLedger {
    pub fn new(store: MemoryLedger) -> Self {
        AutocommitLedger { store }
    }
}

#[async_trait]
impl Ledger for AutocommitLedger {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        Ok(Box::new(AutocommitTx {
            state: self.store.state.clone(),
        }))
    }
}

pub struct AutocommitTx {
    state: Arc<Mutex<MemoryState>>,
}

#[async_trait]
impl LedgerTx for AutocommitTx {
    async fn get_user(&mut self, user_id: i64) -> LedgerResult<Option<User>> {
        statement!(self.state, tx => tx.get_user(user_id))
    }

    async fn user_by_panel_identity(&mut self, panel_identity: &str) -> LedgerResult<Option<User>> {
        statement!(self.state, tx => tx.user_by_panel_identity(panel_identity))
    }

    async fn insert_user(&mut self, user: &NewUser) -> LedgerResult<User> {
        statement!(self.state, tx => tx.insert_user(user))
    }

    async fn set_panel_identity(
        &mut self,
        user_id: i64,
        panel_identity: Option<&str>,
    ) -> LedgerResult<()> {
        statement!(self.state, tx => tx.set_panel_identity(user_id, panel_identity))
    }

    async fn set_banned(&mut self, user_id: i64, banned: bool) -> LedgerResult<()> {
        statement!(self.state, tx => tx.set_banned(user_id, banned))
    }

    async fn users_with_panel_identity(&mut self) -> LedgerResult<Vec<User>> {
        statement!(self.state, tx => tx.users_with_panel_identity())
    }

    async fn active_subscription_by_identity(
        &mut self,
        panel_identity: &str,
    ) -> LedgerResult<Option<Subscription>> {
        statement!(self.state, tx => tx.active_subscription_by_identity(panel_identity))
    }

    async fn active_subscription_for_user(
        &mut self,
        user_id: i64,
    ) -> LedgerResult<Option<Subscription>> {
        statement!(self.state, tx => tx.active_subscription_for_user(user_id))
    }

    async fn subscriptions_by_identity(
        &mut self,
        panel_identity: &str,
    ) -> LedgerResult<Vec<Subscription>> {
        statement!(self.state, tx => tx.subscriptions_by_identity(panel_identity))
    }

    async fn subscription_by_link(&mut self, link: &str) -> LedgerResult<Option<Subscription>> {
        statement!(self.state, tx => tx.subscription_by_link(link))
    }

    async fn has_any_subscription(&mut self, user_id: i64) -> LedgerResult<bool> {
        statement!(self.state, tx => tx.has_any_subscription(user_id))
    }

    async fn deactivate_siblings(
        &mut self,
        panel_identity: &str,
        keep_link: Option<&str>,
    ) -> LedgerResult<u64> {
        statement!(self.state, tx => tx.deactivate_siblings(panel_identity, keep_link))
    }

    async fn upsert_subscription(
        &mut self,
        upsert: &SubscriptionUpsert,
    ) -> LedgerResult<Subscription> {
        statement!(self.state, tx => tx.upsert_subscription(upsert))
    }

    async fn extend_subscription(
        &mut self,
        subscription_id: i64,
        end_time: DateTime<Utc>,
        status_label: &str,
    ) -> LedgerResult<Subscription> {
        statement!(self.state, tx => tx.extend_subscription(subscription_id, end_time, status_label))
    }

    async fn set_skip_notifications(&mut self, subscription_id: i64, skip: bool) -> LedgerResult<()> {
        statement!(self.state, tx => tx.set_skip_notifications(subscription_id, skip))
    }

    async fn mark_notified(&mut self, subscription_id: i64, on: NaiveDate) -> LedgerResult<()> {
        statement!(self.state, tx => tx.mark_notified(subscription_id, on))
    }

    async fn expiring_subscriptions(
        &mut self,
        provider: Provider,
        until: DateTime<Utc>,
    ) -> LedgerResult<Vec<Subscription>> {
        statement!(self.state, tx => tx.expiring_subscriptions(provider, until))
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> LedgerResult<Payment> {
        statement!(self.state, tx => tx.insert_payment(payment))
    }

    async fn payment_by_id(&mut self, payment_id: i64) -> LedgerResult<Option<Payment>> {
        statement!(self.state, tx => tx.payment_by_id(payment_id))
    }

    async fn payment_by_provider_id(
        &mut self,
        provider_payment_id: &str,
    ) -> LedgerResult<Option<Payment>> {
        statement!(self.state, tx => tx.payment_by_provider_id(provider_payment_id))
    }

    async fn update_payment_status(
        &mut self,
        payment_id: i64,
        status: PaymentStatus,
        provider_payment_id: Option<&str>,
    ) -> LedgerResult<Payment> {
        statement!(self.state, tx => tx.update_payment_status(payment_id, status, provider_payment_id))
    }

    async fn has_succeeded_payment(&mut self, user_id: i64, provider: Provider) -> LedgerResult<bool> {
        statement!(self.state, tx => tx.has_succeeded_payment(user_id, provider))
    }

    async fn promo_by_code(&mut self, code: &str) -> LedgerResult<Option<PromoCode>> {
        statement!(self.state, tx => tx.promo_by_code(code))
    }

    async fn promo_by_id(&mut self, promo_id: i64) -> LedgerResult<Option<PromoCode>> {
        statement!(self.state, tx => tx.promo_by_id(promo_id))
    }

    async fn promo_activation(
        &mut self,
        promo_id: i64,
        user_id: i64,
    ) -> LedgerResult<Option<PromoActivation>> {
        statement!(self.state, tx => tx.promo_activation(promo_id, user_id))
    }

    async fn record_promo_activation(
        &mut self,
        promo_id: i64,
        user_id: i64,
        payment_id: Option<i64>,
    ) -> LedgerResult<Option<PromoActivation>> {
        statement!(self.state, tx => tx.record_promo_activation(promo_id, user_id, payment_id))
    }

    async fn sync_status(&mut self) -> LedgerResult<Option<SyncStatus>> {
        statement!(self.state, tx => tx.sync_status())
    }

    async fn save_sync_status(&mut self, status: &SyncStatus) -> LedgerResult<()> {
        statement!(self.state, tx => tx.save_sync_status(status))
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}
