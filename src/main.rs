use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use log::{error, info, warn};
use reqwest::Client;
use sqlx::postgres::PgPoolOptions;

use vpn_shop::config::Settings;
use vpn_shop::engine::SubscriptionEngine;
use vpn_shop::ledger::{Ledger, PgLedger};
use vpn_shop::notify::{LogNotifier, Notifier, TelegramNotifier};
use vpn_shop::panel::{PanelApi, PanelClient};
use vpn_shop::renewal::TributeRenewal;
use vpn_shop::routes::{self, AppState};
use vpn_shop::sync::ReconciliationJob;
use vpn_shop::webhooks::panel::ExpiryNotifier;
use vpn_shop::webhooks::PaymentIngestor;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = match Settings::from_env() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.database_url)
        .await
        .expect("cannot connect to DATABASE_URL");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("database migrations failed");

    let panel: Arc<dyn PanelApi> = Arc::new(
        PanelClient::new(
            settings.panel_api_url.clone(),
            settings.panel_api_key.clone(),
            settings.panel_timeout,
        )
        .expect("cannot build panel HTTP client"),
    );
    if settings.panel_api_url.is_none() {
        warn!("PANEL_API_URL is not set; panel calls will fail");
    }

    let notifier: Arc<dyn Notifier> = match &settings.bot_token {
        Some(token) => {
            let http = Client::builder()
                .timeout(settings.panel_timeout)
                .build()
                .expect("cannot build Telegram HTTP client");
            Arc::new(TelegramNotifier::new(http, token.clone(), settings.admin_ids.clone()))
        }
        None => {
            warn!("BOT_TOKEN is not set; notifications are only logged");
            Arc::new(LogNotifier)
        }
    };

    let ledger: Arc<dyn Ledger> = Arc::new(PgLedger::new(pool));
    let engine = SubscriptionEngine::new(panel, settings.clone());
    let sync = Arc::new(ReconciliationJob::new(
        ledger.clone(),
        engine.clone(),
        notifier.clone(),
    ));
    let ingestor = PaymentIngestor::new(ledger.clone(), engine.clone(), notifier.clone());
    let expiry = ExpiryNotifier::new(ledger.clone(), notifier, settings.clone());

    if settings.sync_interval.is_zero() {
        info!("SYNC_INTERVAL_SECS is 0; periodic reconciliation disabled");
    } else {
        tokio::spawn(sync.clone().run_periodically(settings.sync_interval));
    }
    tokio::spawn(Arc::new(TributeRenewal::new(ledger, engine)).run_daily());

    let state = web::Data::new(AppState {
        settings: settings.clone(),
        ingestor,
        expiry,
        sync,
    });

    info!(
        "Listening on {}:{}",
        settings.web_server_host, settings.web_server_port
    );
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(routes::configure)
    })
    .bind((settings.web_server_host.as_str(), settings.web_server_port))?
    .run()
    .await
}
