//! Background retry of follow-up work that failed after its primary write

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::commission::CommissionDistributor;
use super::lifecycle::ServiceLifecycle;
use super::loyalty_bonus::LoyaltyBonusEngine;
use super::settlement::SettlementEngine;
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{PendingWork, PendingWorkKind, PendingWorkStatus};
use crate::store::LedgerStore;

const BATCH_SIZE: i64 = 100;

/// Queue `item` unless an unresolved item of the same kind already exists
/// for its source.
pub(crate) async fn enqueue_pending_work(
    store: &dyn LedgerStore,
    item: PendingWork,
) -> LedgerResult<()> {
    let existing = store.list_pending_work(Some(&item.source_id)).await?;
    if existing
        .iter()
        .any(|work| work.kind == item.kind && work.status != PendingWorkStatus::Resolved)
    {
        tracing::debug!(source_id = %item.source_id, kind = ?item.kind, "pending work already queued");
        return Ok(());
    }

    warn!(
        source_id = %item.source_id,
        kind = ?item.kind,
        status = ?item.status,
        reason = %item.reason,
        "pending work queued"
    );
    store.enqueue_pending_work(&item).await
}

/// Counts from one pass over the queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub processed: usize,
    pub resolved: usize,
    pub retrying: usize,
    pub escalated: usize,
}

pub struct ReconciliationWorker {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    settlement: Arc<SettlementEngine>,
    commissions: Arc<CommissionDistributor>,
    loyalty: Arc<LoyaltyBonusEngine>,
    lifecycle: Arc<ServiceLifecycle>,
    interval: Duration,
}

impl ReconciliationWorker {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<LedgerConfig>,
        settlement: Arc<SettlementEngine>,
        commissions: Arc<CommissionDistributor>,
        loyalty: Arc<LoyaltyBonusEngine>,
        lifecycle: Arc<ServiceLifecycle>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            config,
            settlement,
            commissions,
            loyalty,
            lifecycle,
            interval,
        }
    }

    /// Poll the queue forever.
    pub async fn run(self: Arc<Self>) {
        info!(interval_seconds = self.interval.as_secs(), "reconciliation worker started");

        loop {
            match self.run_once().await {
                Ok(report) if report.processed > 0 => {
                    info!(
                        processed = report.processed,
                        resolved = report.resolved,
                        retrying = report.retrying,
                        escalated = report.escalated,
                        "reconciliation pass finished"
                    );
                }
                Ok(_) => {}
                Err(err) => error!(error = %err, "reconciliation pass failed"),
            }

            sleep(self.interval).await;
        }
    }

    /// Re-run every open item once.
    pub async fn run_once(&self) -> LedgerResult<ReconciliationReport> {
        let mut report = ReconciliationReport::default();

        for mut item in self.store.open_pending_work(BATCH_SIZE).await? {
            report.processed += 1;

            match self.process(&item).await {
                Ok(()) => {
                    item.status = PendingWorkStatus::Resolved;
                    report.resolved += 1;
                }
                Err(err) => {
                    item.attempts += 1;
                    item.reason = err.to_string();
                    if item.attempts >= self.config.reconcile_max_attempts {
                        item.status = PendingWorkStatus::Manual;
                        report.escalated += 1;
                        error!(
                            source_id = %item.source_id,
                            kind = ?item.kind,
                            attempts = item.attempts,
                            error = %err,
                            "pending work needs manual attention"
                        );
                    } else {
                        report.retrying += 1;
                        warn!(
                            source_id = %item.source_id,
                            kind = ?item.kind,
                            attempts = item.attempts,
                            error = %err,
                            "pending work retry failed"
                        );
                    }
                }
            }

            item.updated_at = Utc::now();
            self.store.update_pending_work(&item).await?;
        }

        Ok(report)
    }

    pub async fn list(&self, source_id: Option<&str>) -> LedgerResult<Vec<PendingWork>> {
        self.store.list_pending_work(source_id).await
    }

    async fn process(&self, item: &PendingWork) -> LedgerResult<()> {
        match item.kind {
            PendingWorkKind::SettlementSideEffects => {
                let id = service_request_id(item)?;
                let request = self
                    .store
                    .get_service_request(id)
                    .await?
                    .ok_or_else(|| LedgerError::not_found("service_request", id))?;
                self.settlement.run_side_effects(&request).await
            }
            PendingWorkKind::CommissionPayout => {
                self.commissions.pay_pending(&item.source_id).await.map(|_| ())
            }
            PendingWorkKind::LoyaltyBonus => {
                let account_id = item.account_id.ok_or_else(|| {
                    LedgerError::InvalidRequest("loyalty bonus work without an account".to_string())
                })?;
                self.loyalty.grant_next(account_id).await.map(|_| ())
            }
            PendingWorkKind::RefundCredit => {
                self.lifecycle.retry_refund_credit(service_request_id(item)?).await
            }
            PendingWorkKind::WithdrawalReview => Err(LedgerError::InvalidRequest(
                "withdrawal reviews are resolved by an operator".to_string(),
            )),
        }
    }
}

fn service_request_id(item: &PendingWork) -> LedgerResult<Uuid> {
    item.source_id
        .parse()
        .map_err(|_| LedgerError::InvalidRequest(format!("bad service request id {}", item.source_id)))
}
