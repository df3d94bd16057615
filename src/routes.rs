//! Route definitions for the servimarket API

use axum::{
    routing::{get, post, put},
    Router,
};

use crate::app_state::AppState;
use crate::handlers::*;

// Service request routes
pub fn service_request_routes() -> Router<AppState> {
    Router::new()
        .route("/api/service-requests", post(create_service_request))
        .route("/api/service-requests/:id", get(get_service_request))
        .route(
            "/api/service-requests/:id/transition",
            post(transition_service_request),
        )
        .route(
            "/api/service-requests/:id/payment-status",
            post(update_payment_status),
        )
        .route("/api/service-requests/:id/capture", post(capture_payment))
        .route(
            "/api/service-requests/:id/pay-with-wallet",
            post(pay_with_wallet),
        )
        .route(
            "/api/service-requests/:id/release",
            post(release_service_request),
        )
        .route(
            "/api/service-requests/:id/refund",
            post(refund_service_request),
        )
        .route(
            "/api/service-requests/webhook",
            post(webhook_service_update),
        )
}

// Wallet routes
pub fn wallet_routes() -> Router<AppState> {
    Router::new()
        .route("/api/wallets/:account_id", get(get_wallet))
        .route(
            "/api/wallets/:account_id/transactions",
            get(list_wallet_transactions),
        )
        .route("/api/wallets/:account_id/verify", get(verify_wallet))
        .route("/api/wallets/:account_id/limits", put(set_wallet_limits))
        .route("/api/wallets/:account_id/block", post(block_funds))
        .route("/api/wallets/:account_id/unblock", post(release_blocked_funds))
}

// Loyalty routes
pub fn loyalty_routes() -> Router<AppState> {
    Router::new()
        .route("/api/loyalty/fund", get(get_loyalty_fund))
        .route("/api/loyalty/:account_id/pending", get(get_pending_bonuses))
        .route("/api/loyalty/:account_id/grant", post(grant_bonuses))
        .route("/api/loyalty/:account_id/bonuses", get(get_bonus_history))
        .route("/api/loyalty/:account_id/points", get(get_loyalty_points))
}

// Withdrawal routes
pub fn withdrawal_routes() -> Router<AppState> {
    Router::new()
        .route("/api/withdrawals", post(create_withdrawal))
        .route("/api/withdrawals/:id", get(get_withdrawal))
        .route("/api/withdrawals/:id/refund", post(refund_withdrawal))
}

// Commission and referral routes
pub fn commission_routes() -> Router<AppState> {
    Router::new()
        .route("/api/commissions", get(list_commissions))
        .route(
            "/api/commissions/membership",
            post(create_membership_commission),
        )
        .route("/api/commissions/:source_id/payout", post(pay_commissions))
        .route("/api/referrals", post(set_referrer))
        .route("/api/ambassadors", post(set_ambassador_tier))
}

// Reconciliation routes
pub fn reconciliation_routes() -> Router<AppState> {
    Router::new()
        .route("/api/reconciliation", get(list_pending_work))
        .route("/api/reconciliation/run", post(run_reconciliation))
}
