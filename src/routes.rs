use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use log::error;
use serde_json::json;

use crate::config::Settings;
use crate::sync::{ReconciliationJob, SyncError};
use crate::webhooks::signature::secrets_match;
use crate::webhooks::panel::{self, ExpiryNotifier};
use crate::webhooks::{
    cryptopay, stars, tribute, yookassa, PaymentEvent, PaymentIngestor, WebhookError,
    WebhookOutcome,
};

type ParseFn = fn(&Settings, Option<&str>, &[u8]) -> Result<Option<PaymentEvent>, WebhookError>;

pub struct AppState {
    pub settings: Arc<Settings>,
    pub ingestor: PaymentIngestor,
    pub expiry: ExpiryNotifier,
    pub sync: Arc<ReconciliationJob>,
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/webhook/yookassa").route(web::post().to(yookassa_webhook)))
        .service(web::resource("/webhook/cryptopay").route(web::post().to(cryptopay_webhook)))
        .service(web::resource("/webhook/tribute").route(web::post().to(tribute_webhook)))
        .service(web::resource("/webhook/telegram").route(web::post().to(telegram_webhook)))
        .service(web::resource("/webhook/panel").route(web::post().to(panel_webhook)))
        .service(web::resource("/admin/sync-status").route(web::get().to(sync_status)))
        .service(web::resource("/admin/sync").route(web::post().to(trigger_sync)));
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Signature and parse failures are the only non-200 answers; anything that
/// goes wrong after that is logged and acknowledged so the provider stops
/// retrying.
async fn handle_webhook(
    state: &AppState,
    req: &HttpRequest,
    body: &[u8],
    signature_header: &str,
    parse: ParseFn,
) -> Result<HttpResponse, WebhookError> {
    let event = parse(&state.settings, header(req, signature_header), body)?;
    let outcome = match event {
        Some(event) => state.ingestor.ingest(event).await,
        None => WebhookOutcome::Ignored("no payment effect".to_string()),
    };
    Ok(HttpResponse::Ok().json(json!({ "status": outcome.label() })))
}

async fn yookassa_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    handle_webhook(&state, &req, &body, yookassa::SIGNATURE_HEADER, yookassa::parse_request).await
}

async fn cryptopay_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    handle_webhook(&state, &req, &body, cryptopay::SIGNATURE_HEADER, cryptopay::parse_request).await
}

async fn tribute_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    handle_webhook(&state, &req, &body, tribute::SIGNATURE_HEADER, tribute::parse_request).await
}

async fn telegram_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    handle_webhook(&state, &req, &body, stars::SECRET_HEADER, stars::parse_request).await
}

async fn panel_webhook(
    state: web::Data<AppState>,
    req: HttpRequest,
    body: web::Bytes,
) -> Result<HttpResponse, WebhookError> {
    let event = panel::parse_request(&state.settings, header(&req, panel::SIGNATURE_HEADER), &body)?;
    let label = match event {
        Some(event) => state.expiry.handle(&event).await.label(),
        None => "ignored",
    };
    Ok(HttpResponse::Ok().json(json!({ "status": label })))
}

fn authorize(state: &AppState, req: &HttpRequest) -> Result<(), HttpResponse> {
    let Some(expected) = state.settings.admin_api_token.as_deref() else {
        return Err(HttpResponse::ServiceUnavailable().json(json!({ "error": "admin API disabled" })));
    };
    let provided = header(req, "Authorization").and_then(|v| v.strip_prefix("Bearer "));
    match provided {
        Some(token) if secrets_match(expected, token.trim()) => Ok(()),
        _ => Err(HttpResponse::Unauthorized().json(json!({ "error": "unauthorized" }))),
    }
}

async fn sync_status(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(denied) = authorize(&state, &req) {
        return denied;
    }
    match state.sync.latest_status().await {
        Ok(Some(status)) => HttpResponse::Ok().json(status),
        Ok(None) => HttpResponse::Ok().json(json!({ "status": "never_run" })),
        Err(e) => {
            error!("Reading sync status failed: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": e.to_string() }))
        }
    }
}

async fn trigger_sync(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    if let Err(denied) = authorize(&state, &req) {
        return denied;
    }
    match state.sync.run().await {
        Ok(report) => HttpResponse::Ok().json(report.to_status()),
        Err(SyncError::AlreadyRunning) => {
            HttpResponse::Conflict().json(json!({ "error": "sync already running" }))
        }
        Err(e) => {
            error!("Operator-triggered sync failed: {}", e);
            HttpResponse::InternalServerError().json(json!({ "error": e.to_string() }))
        }
    }
}
