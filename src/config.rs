use std::collections::HashMap;
use std::time::Duration;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub web_server_host: String,
    pub web_server_port: u16,

    pub panel_api_url: Option<String>,
    pub panel_api_key: Option<String>,
    pub panel_timeout: Duration,
    pub panel_page_size: usize,
    pub panel_page_delay: Duration,
    /// Push failures roll back the activation instead of being left for the
    /// next reconciliation pass.
    pub panel_push_strict: bool,
    /// Period of the reconciliation job; bounds how long the panel may show
    /// a stale expiry after a failed push. Zero disables the job.
    pub sync_interval: Duration,

    pub trial_enabled: bool,
    pub trial_duration_days: i64,
    pub trial_traffic_limit_gb: f64,
    pub user_traffic_limit_gb: f64,
    pub user_traffic_strategy: String,
    pub user_squad_uuids: Vec<String>,

    pub referral_bonus_inviter: HashMap<i32, i64>,
    pub referral_bonus_referee: HashMap<i32, i64>,

    pub yookassa_webhook_secret: Option<String>,
    pub cryptopay_token: Option<String>,
    pub tribute_api_key: Option<String>,
    pub telegram_webhook_secret: Option<String>,
    pub panel_webhook_secret: Option<String>,

    pub subscription_notifications_enabled: bool,
    /// Which of the panel's 72/48/24 hour warnings is forwarded, in days.
    pub subscription_notify_days_before: i64,
    pub subscription_notify_on_expire: bool,
    pub subscription_notify_after_expire: bool,

    pub bot_token: Option<String>,
    pub admin_ids: Vec<i64>,
    pub admin_api_token: Option<String>,
    pub default_currency: String,
}

impl Settings {
    /// Reads settings from the process environment. `.env` is loaded by the
    /// caller beforehand.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = required_env("DATABASE_URL")?;

        let referral_bonus_inviter = bonus_table([
            (1, "REFERRAL_BONUS_DAYS_1_MONTH", 3),
            (3, "REFERRAL_BONUS_DAYS_3_MONTHS", 7),
            (6, "REFERRAL_BONUS_DAYS_6_MONTHS", 15),
            (12, "REFERRAL_BONUS_DAYS_12_MONTHS", 30),
        ]);
        let referral_bonus_referee = bonus_table([
            (1, "REFEREE_BONUS_DAYS_1_MONTH", 1),
            (3, "REFEREE_BONUS_DAYS_3_MONTHS", 3),
            (6, "REFEREE_BONUS_DAYS_6_MONTHS", 7),
            (12, "REFEREE_BONUS_DAYS_12_MONTHS", 15),
        ]);

        Ok(Settings {
            database_url,
            web_server_host: optional_env("WEB_SERVER_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            web_server_port: parsed_env("WEB_SERVER_PORT", 8080),
            panel_api_url: optional_env("PANEL_API_URL"),
            panel_api_key: optional_env("PANEL_API_KEY"),
            panel_timeout: Duration::from_secs(parsed_env("PANEL_TIMEOUT_SECS", 30)),
            panel_page_size: parsed_env("PANEL_PAGE_SIZE", 100usize).max(1),
            panel_page_delay: Duration::from_millis(parsed_env("PANEL_PAGE_DELAY_MS", 100)),
            panel_push_strict: flag_env("PANEL_PUSH_STRICT", false),
            sync_interval: Duration::from_secs(parsed_env("SYNC_INTERVAL_SECS", 3600)),
            trial_enabled: flag_env("TRIAL_ENABLED", true),
            trial_duration_days: parsed_env("TRIAL_DURATION_DAYS", 3),
            trial_traffic_limit_gb: parsed_env("TRIAL_TRAFFIC_LIMIT_GB", 5.0),
            user_traffic_limit_gb: parsed_env("USER_TRAFFIC_LIMIT_GB", 0.0),
            user_traffic_strategy: optional_env("USER_TRAFFIC_STRATEGY")
                .map(|s| s.to_uppercase())
                .unwrap_or_else(|| "NO_RESET".to_string()),
            user_squad_uuids: csv_env("USER_SQUAD_UUIDS"),
            referral_bonus_inviter,
            referral_bonus_referee,
            yookassa_webhook_secret: optional_env("YOOKASSA_WEBHOOK_SECRET"),
            cryptopay_token: optional_env("CRYPTOPAY_TOKEN"),
            tribute_api_key: optional_env("TRIBUTE_API_KEY"),
            telegram_webhook_secret: optional_env("TELEGRAM_WEBHOOK_SECRET"),
            panel_webhook_secret: optional_env("PANEL_WEBHOOK_SECRET"),
            subscription_notifications_enabled: flag_env("SUBSCRIPTION_NOTIFICATIONS_ENABLED", true),
            subscription_notify_days_before: parsed_env("SUBSCRIPTION_NOTIFY_DAYS_BEFORE", 3),
            subscription_notify_on_expire: flag_env("SUBSCRIPTION_NOTIFY_ON_EXPIRE", true),
            subscription_notify_after_expire: flag_env("SUBSCRIPTION_NOTIFY_AFTER_EXPIRE", true),
            bot_token: optional_env("BOT_TOKEN"),
            admin_ids: csv_env("ADMIN_IDS")
                .iter()
                .filter_map(|id| id.parse().ok())
                .collect(),
            admin_api_token: optional_env("ADMIN_API_TOKEN"),
            default_currency: optional_env("DEFAULT_CURRENCY").unwrap_or_else(|| "RUB".to_string()),
        })
    }

    pub fn trial_traffic_limit_bytes(&self) -> i64 {
        gb_to_bytes(self.trial_traffic_limit_gb)
    }

    pub fn user_traffic_limit_bytes(&self) -> i64 {
        gb_to_bytes(self.user_traffic_limit_gb)
    }

    pub fn inviter_bonus_days(&self, months: i32) -> Option<i64> {
        self.referral_bonus_inviter.get(&months).copied().filter(|d| *d > 0)
    }

    pub fn referee_bonus_days(&self, months: i32) -> Option<i64> {
        self.referral_bonus_referee.get(&months).copied().filter(|d| *d > 0)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_url: String::new(),
            web_server_host: "0.0.0.0".to_string(),
            web_server_port: 8080,
            panel_api_url: None,
            panel_api_key: None,
            panel_timeout: Duration::from_secs(30),
            panel_page_size: 100,
            panel_page_delay: Duration::from_millis(100),
            panel_push_strict: false,
            sync_interval: Duration::from_secs(3600),
            trial_enabled: true,
            trial_duration_days: 3,
            trial_traffic_limit_gb: 5.0,
            user_traffic_limit_gb: 0.0,
            user_traffic_strategy: "NO_RESET".to_string(),
            user_squad_uuids: Vec::new(),
            referral_bonus_inviter: [(1, 3), (3, 7), (6, 15), (12, 30)].into_iter().collect(),
            referral_bonus_referee: [(1, 1), (3, 3), (6, 7), (12, 15)].into_iter().collect(),
            yookassa_webhook_secret: None,
            cryptopay_token: None,
            tribute_api_key: None,
            telegram_webhook_secret: None,
            panel_webhook_secret: None,
            subscription_notifications_enabled: true,
            subscription_notify_days_before: 3,
            subscription_notify_on_expire: true,
            subscription_notify_after_expire: true,
            bot_token: None,
            admin_ids: Vec::new(),
            admin_api_token: None,
            default_currency: "RUB".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env var: {0}")]
    Missing(String),
}

fn gb_to_bytes(gb: f64) -> i64 {
    if gb <= 0.0 {
        0
    } else {
        (gb * BYTES_PER_GB) as i64
    }
}

fn bonus_table<const N: usize>(entries: [(i32, &str, i64); N]) -> HashMap<i32, i64> {
    entries
        .into_iter()
        .map(|(months, key, default)| (months, parsed_env(key, default)))
        .collect()
}

fn required_env(key: &str) -> Result<String, ConfigError> {
    optional_env(key).ok_or_else(|| ConfigError::Missing(key.to_string()))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().and_then(|v| {
        let v = v.trim().to_string();
        if v.is_empty() {
            None
        } else {
            Some(v)
        }
    })
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    optional_env(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn flag_env(key: &str, default: bool) -> bool {
    optional_env(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn csv_env(key: &str) -> Vec<String> {
    optional_env(key)
        .map(|v| {
            v.split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}
