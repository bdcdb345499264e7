use log::{info, warn};
use serde::Deserialize;
use serde_json::{Map, Value};

use super::signature::verify_hmac_sha256;
use super::{lenient_f64, lenient_i64, PaymentEvent, PaymentEventKind, WebhookError};
use crate::config::Settings;
use crate::models::Provider;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

const EVENT_SUCCEEDED: &str = "payment.succeeded";
const EVENT_CANCELED: &str = "payment.canceled";

#[derive(Debug, Deserialize)]
struct YookassaNotification {
    event: String,
    object: YookassaPayment,
}

#[derive(Debug, Deserialize)]
struct YookassaPayment {
    id: String,
    status: Option<String>,
    amount: Option<YookassaAmount>,
    #[serde(default)]
    metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct YookassaAmount {
    value: Value,
    currency: String,
}

/// Verifies and normalises a YooKassa notification. `Ok(None)` means the
/// delivery is acknowledged without effect.
pub fn parse_request(
    settings: &Settings,
    signature: Option<&str>,
    body: &[u8],
) -> Result<Option<PaymentEvent>, WebhookError> {
    let secret = settings
        .yookassa_webhook_secret
        .as_deref()
        .ok_or(WebhookError::Disabled(Provider::Yookassa))?;
    verify_hmac_sha256(secret.as_bytes(), body, signature)?;

    let notification: YookassaNotification =
        serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
    let payment = notification.object;

    let kind = match notification.event.as_str() {
        EVENT_SUCCEEDED if payment.status.as_deref() == Some("succeeded") => {
            PaymentEventKind::Succeeded
        }
        EVENT_SUCCEEDED => {
            warn!(
                "YooKassa {} for {} with status {:?}; ignored",
                EVENT_SUCCEEDED, payment.id, payment.status
            );
            return Ok(None);
        }
        EVENT_CANCELED => PaymentEventKind::Canceled,
        other => {
            info!("YooKassa event {} for {} ignored", other, payment.id);
            return Ok(None);
        }
    };

    let Some(metadata) = payment.metadata else {
        warn!("YooKassa payment {} has no metadata; ignored", payment.id);
        return Ok(None);
    };
    let user_id = lenient_i64(metadata.get("user_id"));
    let months = lenient_i64(metadata.get("subscription_months"));
    let payment_id = lenient_i64(metadata.get("payment_db_id"));
    let (Some(user_id), Some(months), Some(payment_id)) = (user_id, months, payment_id) else {
        warn!(
            "YooKassa payment {} lacks user/months/payment metadata: {:?}",
            payment.id, metadata
        );
        return Ok(None);
    };

    let (amount, currency) = match payment.amount {
        Some(amount) => (lenient_f64(Some(&amount.value)).unwrap_or(0.0), amount.currency),
        None => (0.0, settings.default_currency.clone()),
    };

    Ok(Some(PaymentEvent {
        provider: Provider::Yookassa,
        kind,
        user_id,
        months: i32::try_from(months).map_err(|e| WebhookError::Malformed(e.to_string()))?,
        amount,
        currency,
        provider_payment_id: payment.id,
        payment_id: Some(payment_id),
        promo_code_id: lenient_i64(metadata.get("promo_code_id")),
    }))
}
