use log::{debug, error};
use serde::Deserialize;

use super::signature::secrets_match;
use super::{PaymentEvent, PaymentEventKind, WebhookError};
use crate::config::Settings;
use crate::models::Provider;

pub const SECRET_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

const STARS_CURRENCY: &str = "XTR";

#[derive(Debug, Deserialize)]
struct Update {
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    from: Option<Sender>,
    successful_payment: Option<SuccessfulPayment>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct SuccessfulPayment {
    currency: String,
    total_amount: i64,
    invoice_payload: String,
    telegram_payment_charge_id: String,
}

/// Splits an invoice payload of the form `<payment_id>:<months>`.
pub fn parse_invoice_payload(payload: &str) -> Option<(i64, i32)> {
    let (payment_id, months) = payload.split_once(':')?;
    Some((payment_id.trim().parse().ok()?, months.trim().parse().ok()?))
}

/// Verifies a bot update and extracts a Stars payment from it. Updates
/// without a successful payment belong to the chat layer and are
/// acknowledged untouched.
pub fn parse_request(
    settings: &Settings,
    secret_token: Option<&str>,
    body: &[u8],
) -> Result<Option<PaymentEvent>, WebhookError> {
    let expected = settings
        .telegram_webhook_secret
        .as_deref()
        .ok_or(WebhookError::Disabled(Provider::TelegramStars))?;
    let provided = secret_token.ok_or(WebhookError::MissingSignature)?;
    if !secrets_match(expected, provided) {
        return Err(WebhookError::InvalidSignature);
    }

    let update: Update =
        serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
    let Some(message) = update.message else {
        debug!("Telegram update without message ignored");
        return Ok(None);
    };
    let Some(payment) = message.successful_payment else {
        return Ok(None);
    };
    let Some(sender) = message.from else {
        error!(
            "Stars payment {} without sender; ignored",
            payment.telegram_payment_charge_id
        );
        return Ok(None);
    };
    let Some((payment_id, months)) = parse_invoice_payload(&payment.invoice_payload) else {
        error!(
            "Stars payment {} has unreadable invoice payload {:?}",
            payment.telegram_payment_charge_id, payment.invoice_payload
        );
        return Ok(None);
    };
    if payment.currency != STARS_CURRENCY {
        debug!("Stars payment in unexpected currency {}", payment.currency);
    }

    Ok(Some(PaymentEvent {
        provider: Provider::TelegramStars,
        kind: PaymentEventKind::Succeeded,
        user_id: sender.id,
        months,
        amount: payment.total_amount as f64,
        currency: payment.currency,
        provider_payment_id: payment.telegram_payment_charge_id,
        payment_id: Some(payment_id),
        promo_code_id: None,
    }))
}
