//! Servimarket Settlement Server Library
//!
//! Service-request lifecycle, settlement, commissions, wallets, loyalty
//! bonuses and withdrawals for the servimarket marketplace.

pub mod app_state;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod money;
pub mod notifications;
pub mod routes;
pub mod services;
pub mod store;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::app_state::AppState;

/// Build the full API router over `state`.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(routes::service_request_routes())
        .merge(routes::wallet_routes())
        .merge(routes::loyalty_routes())
        .merge(routes::withdrawal_routes())
        .merge(routes::commission_routes())
        .merge(routes::reconciliation_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn root() -> &'static str {
    "Servimarket Settlement API Server"
}

async fn health_check() -> &'static str {
    "OK"
}
