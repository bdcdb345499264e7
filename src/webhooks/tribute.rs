use log::{info, warn};
use serde_json::Value;

use super::signature::verify_hmac_sha256;
use super::{lenient_f64, lenient_i64, parse_json, PaymentEvent, PaymentEventKind, WebhookError};
use crate::config::Settings;
use crate::models::Provider;

pub const SIGNATURE_HEADER: &str = "trbt-signature";

const NEW_SUBSCRIPTION: &str = "new_subscription";

/// Months covered by a Tribute billing period. Unknown periods count as one.
pub fn period_months(period: Option<&str>) -> i32 {
    match period.map(str::to_lowercase).as_deref() {
        Some("quarterly" | "3-month" | "3months" | "3-months" | "q") => 3,
        Some("halfyearly") => 6,
        Some("yearly" | "annual" | "y") => 12,
        _ => 1,
    }
}

/// Verifies and normalises a Tribute event. Tribute bills on its own
/// schedule, so there is no local pending payment to attach to.
pub fn parse_request(
    settings: &Settings,
    signature: Option<&str>,
    body: &[u8],
) -> Result<Option<PaymentEvent>, WebhookError> {
    let api_key = settings
        .tribute_api_key
        .as_deref()
        .ok_or(WebhookError::Disabled(Provider::Tribute))?;
    verify_hmac_sha256(api_key.as_bytes(), body, signature)?;

    let event = parse_json(body)?;
    let name = event.get("name").and_then(Value::as_str);
    let data = event.get("payload").cloned().unwrap_or(Value::Null);

    let user_id = lenient_i64(data.get("telegram_user_id"));
    let price = ["amount", "amount_paid", "price"]
        .iter()
        .find_map(|key| lenient_f64(data.get(*key)));
    let (Some(user_id), Some(price)) = (user_id, price) else {
        warn!("Tribute event {:?} without user or amount; ignored", name);
        return Ok(None);
    };
    if name != Some(NEW_SUBSCRIPTION) {
        info!("Tribute event {:?} for user {} ignored", name, user_id);
        return Ok(None);
    }
    let Some(subscription_id) = lenient_i64(data.get("subscription_id")) else {
        warn!("Tribute subscription for user {} has no subscription_id; ignored", user_id);
        return Ok(None);
    };

    Ok(Some(PaymentEvent {
        provider: Provider::Tribute,
        kind: PaymentEventKind::Succeeded,
        user_id,
        months: period_months(data.get("period").and_then(Value::as_str)),
        // amounts arrive in minor units
        amount: price / 100.0,
        currency: data
            .get("currency")
            .and_then(Value::as_str)
            .map_or_else(|| settings.default_currency.clone(), str::to_uppercase),
        provider_payment_id: subscription_id.to_string(),
        payment_id: None,
        promo_code_id: None,
    }))
}
