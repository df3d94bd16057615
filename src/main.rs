//! Servimarket Settlement Server
//!
//! Runs the settlement core behind an HTTP API and supervises the
//! reconciliation worker that replays failed side effects.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, HeaderValue, Method};
use sqlx::postgres::PgPoolOptions;
use tokio::time::{sleep, Duration};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use servimarket_server::app_state::AppState;
use servimarket_server::collaborators::{
    ActivityLog, Collaborators, HttpNotifier, HttpPaymentGateway, Notifier, PaymentGateway,
    PgActivityLog, SimulatedPaymentGateway, TracingActivityLog, TracingNotifier,
};
use servimarket_server::config::{LedgerConfig, ServerConfig};
use servimarket_server::services::{ReconciliationWorker, Services};
use servimarket_server::store::{LedgerStore, MemoryLedgerStore, PgLedgerStore};

const RECONCILER_SUPERVISOR_MAX_BACKOFF_SECONDS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let server_config = ServerConfig::from_env();
    let ledger_config = Arc::new(LedgerConfig::from_env());

    let (store, activity): (Arc<dyn LedgerStore>, Arc<dyn ActivityLog>) =
        match &server_config.database_url {
            Some(database_url) => {
                let db_pool = PgPoolOptions::new()
                    .max_connections(10)
                    .connect(database_url)
                    .await
                    .context("failed to connect to the database")?;
                let store = PgLedgerStore::new(db_pool.clone());
                store.migrate().await.context("failed to run migrations")?;
                info!("using postgres ledger store");
                (Arc::new(store), Arc::new(PgActivityLog::new(db_pool)))
            }
            None => {
                warn!("DATABASE_URL not set; using in-memory ledger store");
                (Arc::new(MemoryLedgerStore::new()), Arc::new(TracingActivityLog))
            }
        };

    let notifier: Arc<dyn Notifier> = match &server_config.notification_webhook_url {
        Some(url) => Arc::new(HttpNotifier::new(url.clone())),
        None => Arc::new(TracingNotifier),
    };

    let gateway: Arc<dyn PaymentGateway> = match (
        &server_config.payment_gateway_url,
        &server_config.payment_gateway_api_key,
    ) {
        (Some(url), Some(api_key)) => Arc::new(HttpPaymentGateway::new(url.clone(), api_key.clone())),
        _ => {
            warn!("payment gateway not configured; charges and transfers are simulated");
            Arc::new(SimulatedPaymentGateway::new())
        }
    };

    let services = Services::new(
        store,
        ledger_config,
        Collaborators::new(activity, notifier, gateway),
        Duration::from_secs(server_config.reconcile_interval_seconds.max(1)),
    );

    if server_config.webhook_secret.is_none() {
        warn!("WEBHOOK_SECRET not set; the service request webhook will reject every call");
    }

    spawn_reconciliation_supervisor(services.reconciliation.clone());

    let app = servimarket_server::app(AppState::new(
        services,
        server_config.webhook_secret.clone(),
    ))
    .layer(build_cors_layer(&server_config.cors_allowed_origins));

    let addr = SocketAddr::from(([0, 0, 0, 0], server_config.port));

    info!("Server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

/// Keep the reconciliation worker alive, restarting it with backoff if it dies.
fn spawn_reconciliation_supervisor(worker: Arc<ReconciliationWorker>) {
    tokio::spawn(async move {
        let mut restart_count: u32 = 0;
        loop {
            let handle = tokio::spawn(worker.clone().run());

            match handle.await {
                Ok(()) => {
                    info!("reconciliation worker exited cleanly; stopping supervisor");
                    break;
                }
                Err(join_error) => {
                    if join_error.is_panic() {
                        error!("reconciliation worker panicked; restarting");
                    } else {
                        error!(error = %join_error, "reconciliation worker task failed; restarting");
                    }
                }
            }

            restart_count = restart_count.saturating_add(1);
            let backoff_seconds = (2u64.saturating_pow(restart_count.min(5)))
                .min(RECONCILER_SUPERVISOR_MAX_BACKOFF_SECONDS);
            warn!(restart_count, backoff_seconds, "reconciliation worker restart backoff");
            sleep(Duration::from_secs(backoff_seconds)).await;
        }
    });
}

fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allowed_origins = origins
        .iter()
        .filter_map(|origin| origin.parse::<HeaderValue>().ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-webhook-secret"),
        ])
        .allow_credentials(false)
}
