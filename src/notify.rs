use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{info, warn};
use reqwest::Client;
use serde_json::json;

use crate::models::Provider;

const TELEGRAM_API_URL: &str = "https://api.telegram.org";

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    PaymentSucceeded {
        user_id: i64,
        months: i32,
        end_time: DateTime<Utc>,
        subscription_url: Option<String>,
    },
    PaymentFailed {
        user_id: i64,
        payment_id: i64,
    },
    ReferralBonus {
        user_id: i64,
        days: i64,
        new_end: DateTime<Utc>,
    },
    SubscriptionExpiring {
        user_id: i64,
        days_left: i64,
        end_time: Option<DateTime<Utc>>,
    },
    SubscriptionExpired {
        user_id: i64,
    },
    SubscriptionExpiredYesterday {
        user_id: i64,
    },
    AdminNewPayment {
        user_id: i64,
        provider: Provider,
        amount: f64,
        currency: String,
        months: i32,
    },
    AdminAlert {
        message: String,
    },
}

impl Notification {
    /// Chat the message goes to; `None` means every configured admin.
    pub fn recipient(&self) -> Option<i64> {
        match self {
            Notification::PaymentSucceeded { user_id, .. }
            | Notification::PaymentFailed { user_id, .. }
            | Notification::ReferralBonus { user_id, .. }
            | Notification::SubscriptionExpiring { user_id, .. }
            | Notification::SubscriptionExpired { user_id }
            | Notification::SubscriptionExpiredYesterday { user_id } => Some(*user_id),
            Notification::AdminNewPayment { .. } | Notification::AdminAlert { .. } => None,
        }
    }

    pub fn text(&self) -> String {
        match self {
            Notification::PaymentSucceeded {
                months,
                end_time,
                subscription_url,
                ..
            } => {
                let mut text = format!(
                    "Payment received. Your {}-month subscription is active until {}.",
                    months,
                    end_time.format("%Y-%m-%d")
                );
                if let Some(url) = subscription_url {
                    text.push_str(&format!("\nSubscription link: {}", url));
                }
                text
            }
            Notification::PaymentFailed { payment_id, .. } => {
                format!("Payment #{} was not completed.", payment_id)
            }
            Notification::ReferralBonus { days, new_end, .. } => format!(
                "You received {} bonus days for a referral. Subscription active until {}.",
                days,
                new_end.format("%Y-%m-%d")
            ),
            Notification::SubscriptionExpiring {
                days_left,
                end_time,
                ..
            } => match end_time {
                Some(end) => format!(
                    "Your subscription ends in {} day(s), on {}. Renew it to stay connected.",
                    days_left,
                    end.format("%Y-%m-%d")
                ),
                None => format!(
                    "Your subscription ends in {} day(s). Renew it to stay connected.",
                    days_left
                ),
            },
            Notification::SubscriptionExpired { .. } => {
                "Your subscription has expired. Renew it to restore access.".to_string()
            }
            Notification::SubscriptionExpiredYesterday { .. } => {
                "Your subscription expired yesterday. Renew it any time to reconnect.".to_string()
            }
            Notification::AdminNewPayment {
                user_id,
                provider,
                amount,
                currency,
                months,
            } => format!(
                "New payment via {}: user {}, {:.2} {}, {} month(s).",
                provider, user_id, amount, currency, months
            ),
            Notification::AdminAlert { message } => message.clone(),
        }
    }
}

/// Delivery of user and admin messages. Failures are logged by the
/// implementation and never reach the caller.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification);
}

/// Sends plain-text messages through the Telegram Bot API.
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    admin_ids: Vec<i64>,
    api_url: String,
}

impl TelegramNotifier {
    pub fn new(client: Client, bot_token: String, admin_ids: Vec<i64>) -> Self {
        TelegramNotifier {
            client,
            bot_token,
            admin_ids,
            api_url: TELEGRAM_API_URL.to_string(),
        }
    }

    async fn send_message(&self, chat_id: i64, text: &str) {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.bot_token);
        let result = self
            .client
            .post(&url)
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "disable_web_page_preview": true,
            }))
            .send()
            .await
            .and_then(|response| response.error_for_status());

        if let Err(e) = result {
            warn!("Telegram sendMessage to {} failed: {}", chat_id, e);
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, notification: &Notification) {
        let text = notification.text();
        match notification.recipient() {
            Some(chat_id) => self.send_message(chat_id, &text).await,
            None => {
                for admin_id in &self.admin_ids {
                    self.send_message(*admin_id, &text).await;
                }
            }
        }
    }
}

/// Used when no bot token is configured.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) {
        match notification.recipient() {
            Some(chat_id) => info!("notify {}: {}", chat_id, notification.text()),
            None => info!("notify admins: {}", notification.text()),
        }
    }
}
