use log::{error, info, warn};
use serde_json::Value;

use super::signature::{cryptopay_key, verify_hmac_sha256};
use super::{lenient_f64, lenient_i64, parse_json, PaymentEvent, PaymentEventKind, WebhookError};
use crate::config::Settings;
use crate::models::Provider;

pub const SIGNATURE_HEADER: &str = "crypto-pay-api-signature";

const INVOICE_PAID: &str = "invoice_paid";

/// Verifies and normalises a Crypto Pay update. Only `invoice_paid` updates
/// carry an effect; the invoice `payload` field holds the JSON metadata
/// written when the invoice was created.
pub fn parse_request(
    settings: &Settings,
    signature: Option<&str>,
    body: &[u8],
) -> Result<Option<PaymentEvent>, WebhookError> {
    let token = settings
        .cryptopay_token
        .as_deref()
        .ok_or(WebhookError::Disabled(Provider::Cryptopay))?;
    verify_hmac_sha256(&cryptopay_key(token), body, signature)?;

    let update = parse_json(body)?;
    let update_type = update.get("update_type").and_then(Value::as_str);
    if update_type != Some(INVOICE_PAID) {
        info!("CryptoPay update {:?} ignored", update_type);
        return Ok(None);
    }
    let invoice = update
        .get("payload")
        .ok_or_else(|| WebhookError::Malformed("invoice_paid without payload".to_string()))?;
    let invoice_id = lenient_i64(invoice.get("invoice_id"))
        .ok_or_else(|| WebhookError::Malformed("invoice without invoice_id".to_string()))?;

    let Some(raw_meta) = invoice.get("payload").and_then(Value::as_str) else {
        warn!("CryptoPay invoice {} has no payload; ignored", invoice_id);
        return Ok(None);
    };
    let meta: Value = match serde_json::from_str(raw_meta) {
        Ok(meta) => meta,
        Err(e) => {
            error!("CryptoPay invoice {} payload unreadable: {}", invoice_id, e);
            return Ok(None);
        }
    };
    let user_id = lenient_i64(meta.get("user_id"));
    let months = lenient_i64(meta.get("subscription_months")).and_then(|m| i32::try_from(m).ok());
    let payment_id = lenient_i64(meta.get("payment_db_id"));
    let (Some(user_id), Some(months), Some(payment_id)) = (user_id, months, payment_id) else {
        error!("CryptoPay invoice {} payload incomplete: {}", invoice_id, raw_meta);
        return Ok(None);
    };

    Ok(Some(PaymentEvent {
        provider: Provider::Cryptopay,
        kind: PaymentEventKind::Succeeded,
        user_id,
        months,
        amount: lenient_f64(invoice.get("amount")).unwrap_or(0.0),
        currency: invoice
            .get("asset")
            .and_then(Value::as_str)
            .map_or_else(|| settings.default_currency.clone(), str::to_string),
        provider_payment_id: invoice_id.to_string(),
        payment_id: Some(payment_id),
        promo_code_id: lenient_i64(meta.get("promo_code_id")),
    }))
}
