use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{NewPanelUser, PanelApi, PanelError, PanelUser, PanelUserUpdate};

/// Successful panel responses wrap their payload in `{"response": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    response: T,
}

#[derive(Debug, Deserialize)]
struct UserPage {
    #[serde(default)]
    users: Vec<PanelUser>,
}

/// Error body, e.g. `{"errorCode":"A019","message":"User username already exists"}`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// HTTP client for the panel REST API.
#[derive(Clone)]
pub struct PanelClient {
    http: Client,
    base_url: Option<String>,
    api_key: Option<String>,
}

impl PanelClient {
    pub fn new(
        base_url: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, PanelError> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(PanelClient {
            http,
            base_url: base_url.map(|url| url.trim_end_matches('/').to_string()),
            api_key,
        })
    }

    async fn request<B, T>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<T, PanelError>
    where
        B: Serialize + ?Sized + Sync,
        T: DeserializeOwned,
    {
        let base = self.base_url.as_deref().ok_or(PanelError::NotConfigured)?;
        let url = format!("{}/{}", base, path.trim_start_matches('/'));

        let mut req = self
            .http
            .request(method.clone(), &url)
            .header("Accept", "application/json")
            .header("X-Forwarded-Proto", "https");
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let response = req.send().await?;
        let status = response.status();
        let text = response.text().await?;
        debug!("Panel {} {} -> {}", method, url, status);

        if !status.is_success() {
            let err = api_error(status, &text);
            warn!("Panel {} {} failed: {}", method, url, err);
            return Err(err);
        }

        decode_envelope(&text)
    }
}

fn api_error(status: StatusCode, body: &str) -> PanelError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    PanelError::Api {
        status: status.as_u16(),
        code: parsed.error_code,
        message: parsed
            .message
            .unwrap_or_else(|| body.chars().take(200).collect()),
    }
}

fn decode_envelope<T: DeserializeOwned>(body: &str) -> Result<T, PanelError> {
    serde_json::from_str::<Envelope<T>>(body)
        .map(|envelope| envelope.response)
        .map_err(|e| PanelError::Decode(e.to_string()))
}

/// Turns a "not found" API error into `Ok(None)`.
fn optional<T>(result: Result<T, PanelError>) -> Result<Option<T>, PanelError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl PanelApi for PanelClient {
    async fn list_users(&self, start: usize, size: usize) -> Result<Vec<PanelUser>, PanelError> {
        let query = [("size", size.to_string()), ("start", start.to_string())];
        let page: UserPage = self
            .request::<(), _>(Method::GET, "/users", &query, None)
            .await?;
        Ok(page.users)
    }

    async fn get_user(&self, uuid: &str) -> Result<Option<PanelUser>, PanelError> {
        optional(
            self.request::<(), _>(Method::GET, &format!("/users/{}", uuid), &[], None)
                .await,
        )
    }

    async fn users_by_telegram_id(&self, telegram_id: i64) -> Result<Vec<PanelUser>, PanelError> {
        let path = format!("/users/by-telegram-id/{}", telegram_id);
        Ok(optional(self.request::<(), _>(Method::GET, &path, &[], None).await)?
            .unwrap_or_default())
    }

    async fn user_by_username(&self, username: &str) -> Result<Option<PanelUser>, PanelError> {
        let path = format!("/users/by-username/{}", username);
        optional(self.request::<(), _>(Method::GET, &path, &[], None).await)
    }

    async fn create_user(&self, new_user: &NewPanelUser) -> Result<PanelUser, PanelError> {
        self.request(Method::POST, "/users", &[], Some(new_user)).await
    }

    async fn update_user(&self, update: &PanelUserUpdate) -> Result<PanelUser, PanelError> {
        self.request(Method::PATCH, "/users", &[], Some(update)).await
    }

    async fn set_enabled(&self, uuid: &str, enabled: bool) -> Result<PanelUser, PanelError> {
        let action = if enabled { "enable" } else { "disable" };
        let path = format!("/users/{}/actions/{}", uuid, action);
        self.request::<(), _>(Method::POST, &path, &[], None).await
    }
}
