use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{Ledger, LedgerTx};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    NewPayment, NewUser, Payment, PaymentStatus, PromoActivation, PromoCode, Provider,
    Subscription, SubscriptionUpsert, SyncStatus, User,
};

/// Postgres-backed ledger. One [`PgTx`] wraps one database transaction.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        PgLedger { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

fn db_err(e: sqlx::Error) -> LedgerError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            LedgerError::Constraint(db.message().to_string())
        }
        sqlx::Error::RowNotFound => LedgerError::NotFound("row".to_string()),
        _ => LedgerError::Database(e),
    }
}

#[async_trait]
impl LedgerTx for PgTx {
    async fn get_user(&mut self, user_id: i64) -> LedgerResult<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)
    }

    async fn user_by_panel_identity(&mut self, panel_identity: &str) -> LedgerResult<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE panel_identity = $1")
            .bind(panel_identity)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)
    }

    async fn insert_user(&mut self, user: &NewUser) -> LedgerResult<User> {
        sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (user_id, username, panel_identity, referred_by_id, language, registered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(user.user_id)
        .bind(&user.username)
        .bind(&user.panel_identity)
        .bind(user.referred_by_id)
        .bind(&user.language)
        .bind(user.registered_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn set_panel_identity(
        &mut self,
        user_id: i64,
        panel_identity: Option<&str>,
    ) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE users SET panel_identity = $1 WHERE user_id = $2")
            .bind(panel_identity)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn set_banned(&mut self, user_id: i64, banned: bool) -> LedgerResult<()> {
        let result = sqlx::query("UPDATE users SET is_banned = $1 WHERE user_id = $2")
            .bind(banned)
            .bind(user_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(format!("user {}", user_id)));
        }
        Ok(())
    }

    async fn users_with_panel_identity(&mut self) -> LedgerResult<Vec<User>> {
        sqlx::query_as::<_, User>(
            "SELECT * FROM users WHERE panel_identity IS NOT NULL ORDER BY user_id",
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn active_subscription_by_identity(
        &mut self,
        panel_identity: &str,
    ) -> LedgerResult<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE panel_identity = $1 AND is_active ORDER BY end_time DESC LIMIT 1",
        )
        .bind(panel_identity)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn active_subscription_for_user(
        &mut self,
        user_id: i64,
    ) -> LedgerResult<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE user_id = $1 AND is_active ORDER BY end_time DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn subscriptions_by_identity(
        &mut self,
        panel_identity: &str,
    ) -> LedgerResult<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE panel_identity = $1 ORDER BY id",
        )
        .bind(panel_identity)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn subscription_by_link(&mut self, link: &str) -> LedgerResult<Option<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE panel_subscription_link = $1",
        )
        .bind(link)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn has_any_subscription(&mut self, user_id: i64) -> LedgerResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM subscriptions WHERE user_id = $1)",
        )
        .bind(user_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(exists)
    }

    async fn deactivate_siblings(
        &mut self,
        panel_identity: &str,
        keep_link: Option<&str>,
    ) -> LedgerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE subscriptions
            SET is_active = FALSE
            WHERE panel_identity = $1
              AND is_active
              AND ($2::TEXT IS NULL OR panel_subscription_link <> $2)
            "#,
        )
        .bind(panel_identity)
        .bind(keep_link)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn upsert_subscription(
        &mut self,
        upsert: &SubscriptionUpsert,
    ) -> LedgerResult<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            INSERT INTO subscriptions (
                user_id, panel_identity, panel_subscription_link, start_time, end_time,
                duration_months, is_active, status_label, traffic_limit_bytes,
                traffic_used_bytes, provider, skip_notifications
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (panel_subscription_link) DO UPDATE SET
                user_id = COALESCE(EXCLUDED.user_id, subscriptions.user_id),
                panel_identity = EXCLUDED.panel_identity,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                duration_months = EXCLUDED.duration_months,
                is_active = EXCLUDED.is_active,
                status_label = EXCLUDED.status_label,
                traffic_limit_bytes = EXCLUDED.traffic_limit_bytes,
                traffic_used_bytes = EXCLUDED.traffic_used_bytes,
                provider = EXCLUDED.provider,
                skip_notifications = EXCLUDED.skip_notifications,
                last_notification_sent = CASE
                    WHEN subscriptions.end_time <> EXCLUDED.end_time THEN NULL
                    ELSE subscriptions.last_notification_sent
                END
            RETURNING *
            "#,
        )
        .bind(upsert.user_id)
        .bind(&upsert.panel_identity)
        .bind(&upsert.panel_subscription_link)
        .bind(upsert.start_time)
        .bind(upsert.end_time)
        .bind(upsert.duration_months)
        .bind(upsert.is_active)
        .bind(&upsert.status_label)
        .bind(upsert.traffic_limit_bytes)
        .bind(upsert.traffic_used_bytes)
        .bind(&upsert.provider)
        .bind(upsert.skip_notifications)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn extend_subscription(
        &mut self,
        subscription_id: i64,
        end_time: DateTime<Utc>,
        status_label: &str,
    ) -> LedgerResult<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r#"
            UPDATE subscriptions
            SET end_time = $1, is_active = TRUE, status_label = $2, last_notification_sent = NULL
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(end_time)
        .bind(status_label)
        .bind(subscription_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| LedgerError::NotFound(format!("subscription {}", subscription_id)))
    }

    async fn set_skip_notifications(&mut self, subscription_id: i64, skip: bool) -> LedgerResult<()> {
        sqlx::query("UPDATE subscriptions SET skip_notifications = $1 WHERE id = $2")
            .bind(skip)
            .bind(subscription_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn mark_notified(&mut self, subscription_id: i64, on: NaiveDate) -> LedgerResult<()> {
        sqlx::query("UPDATE subscriptions SET last_notification_sent = $1 WHERE id = $2")
            .bind(on)
            .bind(subscription_id)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn expiring_subscriptions(
        &mut self,
        provider: Provider,
        until: DateTime<Utc>,
    ) -> LedgerResult<Vec<Subscription>> {
        sqlx::query_as::<_, Subscription>(
            r#"
            SELECT * FROM subscriptions
            WHERE is_active AND provider = $1 AND end_time <= $2 AND user_id IS NOT NULL
            ORDER BY end_time
            "#,
        )
        .bind(provider.as_str())
        .bind(until)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn insert_payment(&mut self, payment: &NewPayment) -> LedgerResult<Payment> {
        sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                user_id, provider, provider_payment_id, idempotence_key, status,
                amount, currency, subscription_months, promo_code_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(payment.user_id)
        .bind(payment.provider.as_str())
        .bind(&payment.provider_payment_id)
        .bind(&payment.idempotence_key)
        .bind(payment.status.as_str())
        .bind(payment.amount)
        .bind(&payment.currency)
        .bind(payment.subscription_months)
        .bind(payment.promo_code_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn payment_by_id(&mut self, payment_id: i64) -> LedgerResult<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = $1")
            .bind(payment_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)
    }

    async fn payment_by_provider_id(
        &mut self,
        provider_payment_id: &str,
    ) -> LedgerResult<Option<Payment>> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE provider_payment_id = $1")
            .bind(provider_payment_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)
    }

    async fn update_payment_status(
        &mut self,
        payment_id: i64,
        status: PaymentStatus,
        provider_payment_id: Option<&str>,
    ) -> LedgerResult<Payment> {
        sqlx::query_as::<_, Payment>(
            r#"
            UPDATE payments
            SET status = $1,
                provider_payment_id = COALESCE($2, provider_payment_id),
                updated_at = NOW()
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(status.as_str())
        .bind(provider_payment_id)
        .bind(payment_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| LedgerError::NotFound(format!("payment {}", payment_id)))
    }

    async fn has_succeeded_payment(&mut self, user_id: i64, provider: Provider) -> LedgerResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM payments WHERE user_id = $1 AND provider = $2 AND status = $3)",
        )
        .bind(user_id)
        .bind(provider.as_str())
        .bind(PaymentStatus::Succeeded.as_str())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(exists)
    }

    async fn promo_by_code(&mut self, code: &str) -> LedgerResult<Option<PromoCode>> {
        sqlx::query_as::<_, PromoCode>("SELECT * FROM promo_codes WHERE code = $1")
            .bind(code)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)
    }

    async fn promo_by_id(&mut self, promo_id: i64) -> LedgerResult<Option<PromoCode>> {
        sqlx::query_as::<_, PromoCode>("SELECT * FROM promo_codes WHERE id = $1")
            .bind(promo_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)
    }

    async fn promo_activation(
        &mut self,
        promo_id: i64,
        user_id: i64,
    ) -> LedgerResult<Option<PromoActivation>> {
        sqlx::query_as::<_, PromoActivation>(
            "SELECT * FROM promo_activations WHERE promo_code_id = $1 AND user_id = $2",
        )
        .bind(promo_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn record_promo_activation(
        &mut self,
        promo_id: i64,
        user_id: i64,
        payment_id: Option<i64>,
    ) -> LedgerResult<Option<PromoActivation>> {
        let claimed = sqlx::query(
            r#"
            UPDATE promo_codes
            SET current_activations = current_activations + 1
            WHERE id = $1 AND current_activations < max_activations
            "#,
        )
        .bind(promo_id)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        if claimed.rows_affected() == 0 {
            return Ok(None);
        }

        let activation = sqlx::query_as::<_, PromoActivation>(
            r#"
            INSERT INTO promo_activations (promo_code_id, user_id, payment_id)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(promo_id)
        .bind(user_id)
        .bind(payment_id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;

        Ok(Some(activation))
    }

    async fn sync_status(&mut self) -> LedgerResult<Option<SyncStatus>> {
        sqlx::query_as::<_, SyncStatus>(
            r#"
            SELECT last_sync_time, status, details, users_processed, subscriptions_synced
            FROM panel_sync_status WHERE id = 1
            "#,
        )
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)
    }

    async fn save_sync_status(&mut self, status: &SyncStatus) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO panel_sync_status (id, last_sync_time, status, details, users_processed, subscriptions_synced)
            VALUES (1, $1, $2, $3, $4, $5)
            ON CONFLICT (id) DO UPDATE SET
                last_sync_time = EXCLUDED.last_sync_time,
                status = EXCLUDED.status,
                details = EXCLUDED.details,
                users_processed = EXCLUDED.users_processed,
                subscriptions_synced = EXCLUDED.subscriptions_synced
            "#,
        )
        .bind(status.last_sync_time)
        .bind(&status.status)
        .bind(&status.details)
        .bind(status.users_processed)
        .bind(status.subscriptions_synced)
        .execute(&mut *self.tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}
