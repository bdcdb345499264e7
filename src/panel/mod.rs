//! Remote VPN panel: account model and the API seam.
//!
//! [`PanelClient`] talks to the real panel over HTTP; tests use
//! [`crate::testing::FakePanel`].

mod client;

pub use client::PanelClient;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Panel error code for "username already taken" on create.
pub const DUPLICATE_USERNAME_CODE: &str = "A019";
/// Panel error code for "user not found" on filtered lookups.
pub const USER_NOT_FOUND_CODE: &str = "A062";

/// Status label the panel reports for an account with live access.
pub const ACTIVE_STATUS: &str = "ACTIVE";

#[derive(Debug, thiserror::Error)]
pub enum PanelError {
    #[error("panel API URL is not configured")]
    NotConfigured,

    #[error("panel request timed out")]
    Timeout,

    #[error("panel transport error: {0}")]
    Transport(String),

    #[error("panel returned {status}: {message} (code {code:?})")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("unexpected panel response: {0}")]
    Decode(String),
}

impl PanelError {
    pub fn is_duplicate_username(&self) -> bool {
        matches!(self, PanelError::Api { code: Some(code), .. } if code == DUPLICATE_USERNAME_CODE)
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            PanelError::Api { status, code, .. } => {
                *status == 404 || code.as_deref() == Some(USER_NOT_FOUND_CODE)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for PanelError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            PanelError::Timeout
        } else if e.is_decode() {
            PanelError::Decode(e.to_string())
        } else {
            PanelError::Transport(e.to_string())
        }
    }
}

/// Account as reported by the panel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelUser {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, deserialize_with = "lenient_i64")]
    pub telegram_id: Option<i64>,
    #[serde(default)]
    pub subscription_uuid: Option<String>,
    #[serde(default)]
    pub short_uuid: Option<String>,
    #[serde(default)]
    pub subscription_url: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub expire_at: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub traffic_limit_bytes: Option<i64>,
    #[serde(default)]
    pub used_traffic_bytes: Option<i64>,
}

impl PanelUser {
    /// Identifier of the remote subscription grant, the local upsert key.
    pub fn subscription_link(&self) -> Option<&str> {
        self.subscription_uuid
            .as_deref()
            .or(self.short_uuid.as_deref())
            .filter(|link| !link.is_empty())
    }

    pub fn status_label(&self) -> String {
        self.status
            .as_deref()
            .map(str::to_uppercase)
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }

    pub fn expires_at(&self) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
        parse_panel_time(self.expire_at.as_deref())
    }

    pub fn created(&self) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
        parse_panel_time(self.created_at.as_deref())
    }
}

fn parse_panel_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    match raw.filter(|s| !s.is_empty()) {
        Some(s) => Ok(Some(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))),
        None => Ok(None),
    }
}

/// Formats an instant the way the panel expects (`2024-01-01T00:00:00.000Z`).
pub fn format_panel_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// The panel sends telegram ids either as numbers or numeric strings.
fn lenient_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPanelUser {
    pub username: String,
    pub status: String,
    pub expire_at: String,
    pub traffic_limit_strategy: String,
    pub traffic_limit_bytes: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub active_internal_squads: Vec<String>,
}

/// Partial update sent with `PATCH /users`; unset fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PanelUserUpdate {
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_limit_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_limit_strategy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_internal_squads: Option<Vec<String>>,
}

impl PanelUserUpdate {
    pub fn new(uuid: impl Into<String>) -> Self {
        PanelUserUpdate {
            uuid: uuid.into(),
            ..PanelUserUpdate::default()
        }
    }
}

/// Operations the core needs from the panel. Implementations do not retry;
/// a failed call surfaces as [`PanelError`] and is picked up again by the
/// next reconciliation pass.
#[async_trait]
pub trait PanelApi: Send + Sync {
    /// One page of `GET /users?size&start`.
    async fn list_users(&self, start: usize, size: usize) -> Result<Vec<PanelUser>, PanelError>;

    /// `GET /users/{uuid}`; `Ok(None)` when the panel does not know it.
    async fn get_user(&self, uuid: &str) -> Result<Option<PanelUser>, PanelError>;

    async fn users_by_telegram_id(&self, telegram_id: i64) -> Result<Vec<PanelUser>, PanelError>;

    async fn user_by_username(&self, username: &str) -> Result<Option<PanelUser>, PanelError>;

    async fn create_user(&self, new_user: &NewPanelUser) -> Result<PanelUser, PanelError>;

    async fn update_user(&self, update: &PanelUserUpdate) -> Result<PanelUser, PanelError>;

    /// `POST /users/{uuid}/actions/{enable|disable}`.
    async fn set_enabled(&self, uuid: &str, enabled: bool) -> Result<PanelUser, PanelError>;
}
