//! One-time financial settlement of an escrowed payment

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use super::commission::CommissionDistributor;
use super::reconciliation::enqueue_pending_work;
use crate::collaborators::{ActivityEntry, Collaborators};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Actor, FinancialBreakdown, LoyaltyFundContribution, LoyaltyPointsEntry, PaymentStatus,
    PendingWork, PendingWorkKind, ServiceRequest, ServiceStatus,
};
use crate::money::{apply_bps, format_minor};
use crate::store::{with_retry, LedgerStore};

/// Split `total_amount` into fee, commission, fund share and payout.
///
/// `provider_payout + processor_fee + platform_commission == total_amount`
/// holds exactly because the payout is derived by subtraction.
pub fn compute_breakdown(
    config: &LedgerConfig,
    total_amount: i64,
    provider_ambassador_id: Option<Uuid>,
    requester_ambassador_id: Option<Uuid>,
    settled_at: DateTime<Utc>,
) -> FinancialBreakdown {
    let processor_fee = apply_bps(total_amount, config.processor_fee_bps);
    let net_after_processor = total_amount - processor_fee;
    let platform_commission = apply_bps(total_amount, config.platform_commission_bps);
    let loyalty_fund_amount = apply_bps(platform_commission, config.loyalty_fund_bps);
    let provider_payout = net_after_processor - platform_commission;
    let points_earned = if config.points_unit_minor > 0 {
        total_amount.div_euclid(config.points_unit_minor)
    } else {
        0
    };

    FinancialBreakdown {
        total_amount,
        processor_fee,
        net_after_processor,
        platform_commission,
        loyalty_fund_amount,
        provider_payout,
        points_earned,
        provider_ambassador_id,
        requester_ambassador_id,
        settled_at,
    }
}

pub struct SettlementEngine {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    commissions: Arc<CommissionDistributor>,
    collaborators: Collaborators,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<LedgerConfig>,
        commissions: Arc<CommissionDistributor>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            store,
            config,
            commissions,
            collaborators,
        }
    }

    /// Breakdown for a request using the current referral chain of both parties.
    pub async fn breakdown_for(&self, request: &ServiceRequest) -> LedgerResult<FinancialBreakdown> {
        let provider_ambassador = self.store.referring_ambassador(request.provider_id).await?;
        let requester_ambassador = self.store.referring_ambassador(request.requester_id).await?;

        Ok(compute_breakdown(
            &self.config,
            request.total_amount,
            provider_ambassador,
            requester_ambassador,
            Utc::now(),
        ))
    }

    /// Stamp a breakdown onto a request that is about to be written.
    ///
    /// Callers run this inside the same compare-and-swap unit as the write,
    /// so the unset-breakdown check and the set cannot be split by a
    /// concurrent writer.
    pub(crate) fn apply(
        &self,
        request: &mut ServiceRequest,
        breakdown: FinancialBreakdown,
    ) -> LedgerResult<()> {
        if request.is_settled() {
            return Err(LedgerError::AlreadySettled(request.id));
        }
        request.financial_breakdown = Some(breakdown);
        request.payment_status = PaymentStatus::ReleasedToProvider;
        Ok(())
    }

    /// Settle a finalized request whose payment is held for release.
    pub async fn settle(&self, id: Uuid, actor: Actor) -> LedgerResult<ServiceRequest> {
        let result = with_retry(self.config.store_max_retries, move || self.try_settle(id, actor))
            .await;

        let request = match result {
            Ok(request) => request,
            Err(err) => {
                if matches!(err, LedgerError::AlreadySettled(_)) {
                    tracing::error!(service_request_id = %id, "settlement invoked on a settled request");
                }
                self.collaborators
                    .audit(ActivityEntry::new(
                        actor,
                        "settlement_failed",
                        format!("service_request:{id}"),
                        "Settlement rejected",
                        json!({ "error": err.to_string(), "code": err.code() }),
                    ))
                    .await;
                return Err(err);
            }
        };

        self.record_settled(&request, actor).await;
        self.complete(&request).await;
        Ok(request)
    }

    /// Audit a committed settlement.
    pub(crate) async fn record_settled(&self, request: &ServiceRequest, actor: Actor) {
        let Some(breakdown) = request.financial_breakdown.as_ref() else {
            return;
        };
        tracing::info!(
            service_request_id = %request.id,
            total_amount = breakdown.total_amount,
            provider_payout = breakdown.provider_payout,
            platform_commission = breakdown.platform_commission,
            "service request settled"
        );
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "payment_released",
                format!("service_request:{}", request.id),
                format!(
                    "Released {} to provider {}",
                    format_minor(breakdown.provider_payout),
                    request.provider_id
                ),
                json!(breakdown),
            ))
            .await;
    }

    /// Run the post-settlement side effects, queueing them for
    /// reconciliation when any of them fails.
    pub(crate) async fn complete(&self, request: &ServiceRequest) {
        if let Err(err) = self.run_side_effects(request).await {
            tracing::warn!(
                service_request_id = %request.id,
                error = %err,
                "settlement side effects failed; queued for reconciliation"
            );
            let item = PendingWork::new(
                request.id.to_string(),
                PendingWorkKind::SettlementSideEffects,
                Some(request.requester_id),
                err.to_string(),
            );
            if let Err(queue_err) = enqueue_pending_work(self.store.as_ref(), item).await {
                tracing::error!(
                    service_request_id = %request.id,
                    error = %queue_err,
                    "could not queue settlement side effects"
                );
            }
        }
    }

    /// Loyalty points, fund contribution and ambassador commissions.
    ///
    /// Every step is keyed on the request id and safe to repeat.
    pub async fn run_side_effects(&self, request: &ServiceRequest) -> LedgerResult<()> {
        let breakdown = request
            .financial_breakdown
            .as_ref()
            .ok_or_else(|| {
                LedgerError::InvalidRequest(format!("service request {} is not settled", request.id))
            })?;
        let source_id = request.id.to_string();
        let now = Utc::now();

        if breakdown.points_earned > 0 {
            let accrued = self
                .store
                .insert_loyalty_points(&LoyaltyPointsEntry {
                    id: Uuid::new_v4(),
                    account_id: request.requester_id,
                    points: breakdown.points_earned,
                    source_id: source_id.clone(),
                    created_at: now,
                })
                .await?;
            if accrued {
                tracing::debug!(
                    account_id = %request.requester_id,
                    points = breakdown.points_earned,
                    "loyalty points accrued"
                );
            }
        }

        if breakdown.loyalty_fund_amount > 0 {
            self.store
                .append_loyalty_fund(&LoyaltyFundContribution {
                    id: Uuid::new_v4(),
                    source_id: source_id.clone(),
                    amount: breakdown.loyalty_fund_amount,
                    created_at: now,
                })
                .await?;
        }

        if breakdown.provider_ambassador_id.is_some() || breakdown.requester_ambassador_id.is_some()
        {
            self.commissions
                .distribute_service(
                    &source_id,
                    breakdown.platform_commission,
                    breakdown.provider_ambassador_id,
                    breakdown.requester_ambassador_id,
                )
                .await?;
        }

        Ok(())
    }

    // ===== Private Helper Methods =====

    async fn try_settle(&self, id: Uuid, actor: Actor) -> LedgerResult<ServiceRequest> {
        let mut request = self
            .store
            .get_service_request(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("service_request", id))?;

        if request.is_settled() {
            return Err(LedgerError::AlreadySettled(id));
        }
        if !request.is_finalized()
            || request.status == ServiceStatus::InDispute
            || request.payment_status != PaymentStatus::HeldForRelease
        {
            return Err(LedgerError::InvalidTransition {
                from: request.payment_status.to_string(),
                to: PaymentStatus::ReleasedToProvider.to_string(),
                reason: format!(
                    "request in status {} is not eligible for release",
                    request.status
                ),
            });
        }

        let expected_version = request.version;
        let breakdown = self.breakdown_for(&request).await?;
        self.apply(&mut request, breakdown)?;
        request.actor_id = Some(actor.id);
        request.actor_role = Some(actor.role);
        request.updated_at = Utc::now();

        self.store
            .update_service_request(&request, expected_version)
            .await?;
        request.version = expected_version + 1;
        Ok(request)
    }
}
