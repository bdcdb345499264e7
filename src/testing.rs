//! Test doubles: a scripted panel, a recording notifier and ledger seeding
//! helpers. Used by unit tests and by the integration tests under `tests/`.

use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::LedgerResult;
use crate::ledger::Ledger;
use crate::models::{NewUser, Subscription, SubscriptionUpsert, User};
use crate::notify::{Notification, Notifier};
use crate::panel::{
    format_panel_time, NewPanelUser, PanelApi, PanelError, PanelUser, PanelUserUpdate,
    DUPLICATE_USERNAME_CODE, USER_NOT_FOUND_CODE,
};

pub use crate::ledger::{AutocommitLedger, MemoryLedger, MemoryState};

#[derive(Debug, Default)]
pub struct FakePanelState {
    pub users: Vec<PanelUser>,
    pub created: Vec<NewPanelUser>,
    pub updates: Vec<PanelUserUpdate>,
    pub enable_calls: Vec<(String, bool)>,
    pub list_calls: Vec<(usize, usize)>,
    /// `update_user` fails with a timeout.
    pub fail_updates: bool,
    /// `list_users` fails for pages starting at or after this offset.
    pub fail_list_from: Option<usize>,
    /// Every call fails with a timeout.
    pub unavailable: bool,
}

/// In-memory panel with the lookup and error semantics of the real one.
#[derive(Debug, Default)]
pub struct FakePanel {
    state: Mutex<FakePanelState>,
}

impl FakePanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_users(users: Vec<PanelUser>) -> Self {
        let panel = Self::default();
        panel.state().users = users;
        panel
    }

    pub fn state(&self) -> MutexGuard<'_, FakePanelState> {
        self.state.lock().unwrap()
    }

    pub fn add_user(&self, user: PanelUser) {
        self.state().users.push(user);
    }

    pub fn user(&self, uuid: &str) -> Option<PanelUser> {
        self.state()
            .users
            .iter()
            .find(|u| u.uuid.as_deref() == Some(uuid))
            .cloned()
    }

    fn check_available(&self) -> Result<(), PanelError> {
        if self.state().unavailable {
            return Err(PanelError::Timeout);
        }
        Ok(())
    }
}

fn not_found() -> PanelError {
    PanelError::Api {
        status: 404,
        code: Some(USER_NOT_FOUND_CODE.to_string()),
        message: "User not found".to_string(),
    }
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn list_users(&self, start: usize, size: usize) -> Result<Vec<PanelUser>, PanelError> {
        self.check_available()?;
        let mut state = self.state();
        state.list_calls.push((start, size));
        if state.fail_list_from.map_or(false, |from| start >= from) {
            return Err(PanelError::Timeout);
        }
        Ok(state.users.iter().skip(start).take(size).cloned().collect())
    }

    async fn get_user(&self, uuid: &str) -> Result<Option<PanelUser>, PanelError> {
        self.check_available()?;
        Ok(self.user(uuid))
    }

    async fn users_by_telegram_id(&self, telegram_id: i64) -> Result<Vec<PanelUser>, PanelError> {
        self.check_available()?;
        Ok(self
            .state()
            .users
            .iter()
            .filter(|u| u.telegram_id == Some(telegram_id))
            .cloned()
            .collect())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<PanelUser>, PanelError> {
        self.check_available()?;
        Ok(self
            .state()
            .users
            .iter()
            .find(|u| u.username.as_deref() == Some(username))
            .cloned())
    }

    async fn create_user(&self, new_user: &NewPanelUser) -> Result<PanelUser, PanelError> {
        self.check_available()?;
        let mut state = self.state();
        if state
            .users
            .iter()
            .any(|u| u.username.as_deref() == Some(new_user.username.as_str()))
        {
            return Err(PanelError::Api {
                status: 400,
                code: Some(DUPLICATE_USERNAME_CODE.to_string()),
                message: "User username already exists".to_string(),
            });
        }
        let short_uuid = Uuid::new_v4().simple().to_string()[..8].to_string();
        let user = PanelUser {
            uuid: Some(Uuid::new_v4().to_string()),
            username: Some(new_user.username.clone()),
            telegram_id: new_user.telegram_id,
            subscription_uuid: Some(Uuid::new_v4().to_string()),
            short_uuid: Some(short_uuid.clone()),
            subscription_url: Some(format!("https://panel.test/sub/{}", short_uuid)),
            status: Some(new_user.status.clone()),
            expire_at: Some(new_user.expire_at.clone()),
            created_at: Some(format_panel_time(Utc::now())),
            traffic_limit_bytes: Some(new_user.traffic_limit_bytes),
            used_traffic_bytes: Some(0),
        };
        state.created.push(new_user.clone());
        state.users.push(user.clone());
        Ok(user)
    }

    async fn update_user(&self, update: &PanelUserUpdate) -> Result<PanelUser, PanelError> {
        self.check_available()?;
        let mut state = self.state();
        if state.fail_updates {
            return Err(PanelError::Timeout);
        }
        state.updates.push(update.clone());
        let user = state
            .users
            .iter_mut()
            .find(|u| u.uuid.as_deref() == Some(update.uuid.as_str()))
            .ok_or_else(not_found)?;
        if let Some(expire_at) = &update.expire_at {
            user.expire_at = Some(expire_at.clone());
        }
        if let Some(status) = &update.status {
            user.status = Some(status.clone());
        }
        if let Some(limit) = update.traffic_limit_bytes {
            user.traffic_limit_bytes = Some(limit);
        }
        if let Some(telegram_id) = update.telegram_id {
            user.telegram_id = Some(telegram_id);
        }
        Ok(user.clone())
    }

    async fn set_enabled(&self, uuid: &str, enabled: bool) -> Result<PanelUser, PanelError> {
        self.check_available()?;
        let mut state = self.state();
        state.enable_calls.push((uuid.to_string(), enabled));
        let user = state
            .users
            .iter_mut()
            .find(|u| u.uuid.as_deref() == Some(uuid))
            .ok_or_else(not_found)?;
        user.status = Some(if enabled { "ACTIVE" } else { "DISABLED" }.to_string());
        Ok(user.clone())
    }
}

/// Panel account snapshot as the list endpoint would return it.
pub fn panel_account(
    uuid: &str,
    telegram_id: Option<i64>,
    link: Option<&str>,
    status: &str,
    expire_at: Option<DateTime<Utc>>,
) -> PanelUser {
    PanelUser {
        uuid: Some(uuid.to_string()),
        username: telegram_id.map(|id| format!("tg_{}", id)),
        telegram_id,
        subscription_uuid: link.map(str::to_string),
        short_uuid: None,
        subscription_url: link.map(|l| format!("https://panel.test/sub/{}", l)),
        status: Some(status.to_string()),
        expire_at: expire_at.map(format_panel_time),
        created_at: Some("2024-01-01T00:00:00.000Z".to_string()),
        traffic_limit_bytes: Some(0),
        used_traffic_bytes: Some(0),
    }
}

/// Collects every notification it receives.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) {
        self.sent.lock().unwrap().push(notification.clone());
    }
}

pub async fn seed_user(
    ledger: &dyn Ledger,
    user_id: i64,
    panel_identity: Option<&str>,
    referred_by_id: Option<i64>,
) -> LedgerResult<User> {
    let mut tx = ledger.begin().await?;
    let user = tx
        .insert_user(&NewUser {
            user_id,
            username: None,
            panel_identity: panel_identity.map(str::to_string),
            referred_by_id,
            language: None,
            registered_at: Utc::now(),
        })
        .await?;
    tx.commit().await?;
    Ok(user)
}

/// Inserts an active paid-looking subscription row.
pub async fn seed_subscription(
    ledger: &dyn Ledger,
    user_id: i64,
    panel_identity: &str,
    link: &str,
    end_time: DateTime<Utc>,
) -> LedgerResult<Subscription> {
    let mut tx = ledger.begin().await?;
    let sub = tx
        .upsert_subscription(&SubscriptionUpsert {
            user_id: Some(user_id),
            panel_identity: panel_identity.to_string(),
            panel_subscription_link: link.to_string(),
            start_time: Utc::now(),
            end_time,
            duration_months: 1,
            is_active: true,
            status_label: "ACTIVE".to_string(),
            traffic_limit_bytes: Some(0),
            traffic_used_bytes: None,
            provider: None,
            skip_notifications: false,
        })
        .await?;
    tx.commit().await?;
    Ok(sub)
}
