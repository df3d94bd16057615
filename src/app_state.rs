//! Application state shared across handlers

use std::sync::Arc;

use axum::extract::FromRef;

use crate::services::{ServiceLifecycle, Services, WalletLedger};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub services: Services,
    pub webhook_secret: Option<String>,
}

impl AppState {
    pub fn new(services: Services, webhook_secret: Option<String>) -> Self {
        Self {
            services,
            webhook_secret,
        }
    }
}

impl FromRef<AppState> for Services {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.services.clone()
    }
}

impl FromRef<AppState> for Arc<ServiceLifecycle> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.services.lifecycle.clone()
    }
}

impl FromRef<AppState> for Arc<WalletLedger> {
    fn from_ref(app_state: &AppState) -> Self {
        app_state.services.wallets.clone()
    }
}
