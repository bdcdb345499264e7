pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod panel;
pub mod renewal;
pub mod routes;
pub mod sync;
pub mod testing;
pub mod webhooks;
