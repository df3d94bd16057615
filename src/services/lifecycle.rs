//! Service request lifecycle: status transitions, payment writes and escrow release
//!
//! Every write to a request goes through [`ServiceLifecycle::commit_change`],
//! a compare-and-swap unit that applies the change, evaluates the release
//! condition and, when it holds, stamps the settlement breakdown in the same
//! write. Post-commit side effects (audit, notifications, settlement side
//! effects) run after the unit succeeds.

use std::sync::Arc;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::loyalty_bonus::LoyaltyBonusEngine;
use super::reconciliation::enqueue_pending_work;
use super::settlement::SettlementEngine;
use super::wallet_ledger::{Credit, WalletLedger};
use crate::collaborators::{AccountKind, ActivityEntry, Collaborators, Notification};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Actor, PaymentStatus, PendingWork, PendingWorkKind, ServiceRequest, ServiceStatus,
    TransactionType,
};
use crate::money::format_minor;
use crate::notifications::{transition_notice, Notice, Recipient, TransitionContext};
use crate::store::{with_retry, LedgerStore};

/// Result of one committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub request: ServiceRequest,
    pub previous_status: ServiceStatus,
    pub previous_payment_status: PaymentStatus,
    /// The write released escrow and stored the financial breakdown.
    pub settled: bool,
}

/// Release condition, evaluated on the state before and after a write.
fn should_release(before: &ServiceRequest, after: &ServiceRequest) -> bool {
    let finalized_now = after.is_finalized();
    let not_disputed = after.status != ServiceStatus::InDispute;

    let first_finalization = finalized_now
        && !before.is_finalized()
        && after.payment_status == PaymentStatus::HeldForRelease
        && not_disputed;
    let explicit_release = before.payment_status == PaymentStatus::HeldForRelease
        && after.payment_status == PaymentStatus::ReleasedToProvider
        && finalized_now
        && not_disputed;

    first_finalization || explicit_release
}

fn invalid(from: impl ToString, to: impl ToString, reason: impl Into<String>) -> LedgerError {
    LedgerError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
        reason: reason.into(),
    }
}

fn ensure_chargeable(request: &ServiceRequest) -> LedgerResult<()> {
    match request.payment_status {
        PaymentStatus::PendingCharge | PaymentStatus::Failed => Ok(()),
        other => Err(invalid(
            other,
            PaymentStatus::HeldForRelease,
            "payment was already collected",
        )),
    }
}

fn ensure_refundable(request: &ServiceRequest, amount: i64) -> LedgerResult<()> {
    if amount <= 0 || amount > request.total_amount {
        return Err(LedgerError::InvalidAmount(amount));
    }
    match request.payment_status {
        PaymentStatus::HeldForRelease | PaymentStatus::FrozenDispute => Ok(()),
        other => Err(invalid(
            other,
            PaymentStatus::RefundedPartial,
            "only held or frozen payments can be refunded",
        )),
    }
}

pub struct ServiceLifecycle {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    settlement: Arc<SettlementEngine>,
    wallets: Arc<WalletLedger>,
    loyalty: Arc<LoyaltyBonusEngine>,
    collaborators: Collaborators,
}

impl ServiceLifecycle {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<LedgerConfig>,
        settlement: Arc<SettlementEngine>,
        wallets: Arc<WalletLedger>,
        loyalty: Arc<LoyaltyBonusEngine>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            store,
            config,
            settlement,
            wallets,
            loyalty,
            collaborators,
        }
    }

    pub async fn create_service_request(
        &self,
        requester_id: Uuid,
        provider_id: Uuid,
        total_amount: i64,
        actor: Actor,
    ) -> LedgerResult<ServiceRequest> {
        if total_amount <= 0 {
            return Err(LedgerError::InvalidAmount(total_amount));
        }
        if requester_id == provider_id {
            return Err(LedgerError::InvalidRequest(
                "requester and provider must differ".to_string(),
            ));
        }

        let mut request = ServiceRequest::new(requester_id, provider_id, total_amount);
        request.actor_id = Some(actor.id);
        request.actor_role = Some(actor.role);
        self.store.insert_service_request(&request).await?;

        tracing::info!(
            service_request_id = %request.id,
            requester_id = %requester_id,
            provider_id = %provider_id,
            total_amount,
            "service request created"
        );
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "service_request_created",
                format!("service_request:{}", request.id),
                format!("Booked service for {}", format_minor(total_amount)),
                json!({
                    "requester_id": requester_id,
                    "provider_id": provider_id,
                    "total_amount": total_amount,
                }),
            ))
            .await;

        Ok(request)
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<ServiceRequest> {
        self.load(id).await
    }

    /// Move a request to `new_status`.
    ///
    /// Rejects no-op transitions and any move out of the finalized set other
    /// than to another terminal status.
    pub async fn apply_transition(
        &self,
        id: Uuid,
        new_status: ServiceStatus,
        actor: Actor,
    ) -> LedgerResult<TransitionOutcome> {
        let result = self
            .commit_change(id, actor, move |request: &mut ServiceRequest| -> LedgerResult<()> {
                let old = request.status;
                if old == new_status {
                    return Err(invalid(old, new_status, "request is already in this status"));
                }
                if old.is_finalized() && !new_status.is_finalized() {
                    return Err(invalid(old, new_status, "finalized requests cannot be reopened"));
                }

                let now = Utc::now();
                request.status = new_status;
                request.status_changed_at = now;
                if new_status.is_finalized() && request.finalized_at.is_none() {
                    request.finalized_at = Some(now);
                }

                // Escrow follows the dispute in and out.
                if new_status == ServiceStatus::InDispute
                    && request.payment_status == PaymentStatus::HeldForRelease
                {
                    request.payment_status = PaymentStatus::FrozenDispute;
                } else if old == ServiceStatus::InDispute
                    && request.payment_status == PaymentStatus::FrozenDispute
                {
                    request.payment_status = PaymentStatus::HeldForRelease;
                }
                Ok(())
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.audit_failure("status_transition_failed", id, actor, &err, json!({ "to": new_status }))
                    .await;
                return Err(err);
            }
        };

        let request = &outcome.request;
        tracing::info!(
            service_request_id = %request.id,
            from = %outcome.previous_status,
            to = %request.status,
            payment_status = %request.payment_status,
            settled = outcome.settled,
            "status transition applied"
        );
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "status_transition",
                format!("service_request:{}", request.id),
                format!("Status changed from {} to {}", outcome.previous_status, request.status),
                json!({
                    "from": outcome.previous_status,
                    "to": request.status,
                    "payment_from": outcome.previous_payment_status,
                    "payment_to": request.payment_status,
                }),
            ))
            .await;

        if outcome.settled {
            self.settlement.record_settled(request, actor).await;
        }

        let ctx = self.transition_context(request, outcome.settled);
        if let Some(notice) = transition_notice(outcome.previous_status, request.status, &ctx) {
            self.send_notice(request, notice).await;
        }

        if outcome.settled {
            self.settlement.complete(request).await;
        }

        Ok(outcome)
    }

    /// Write a new payment status, releasing escrow when the write makes
    /// the request eligible.
    pub async fn update_payment_status(
        &self,
        id: Uuid,
        new_status: PaymentStatus,
        actor: Actor,
    ) -> LedgerResult<TransitionOutcome> {
        let result = self
            .commit_change(id, actor, move |request: &mut ServiceRequest| -> LedgerResult<()> {
                let current = request.payment_status;
                if current == new_status {
                    return Err(invalid(current, new_status, "payment is already in this status"));
                }
                if current == PaymentStatus::ReleasedToProvider {
                    return Err(invalid(current, new_status, "released payments are final"));
                }
                if new_status == PaymentStatus::ReleasedToProvider
                    && (current != PaymentStatus::HeldForRelease
                        || !request.is_finalized()
                        || request.status == ServiceStatus::InDispute)
                {
                    return Err(invalid(
                        current,
                        new_status,
                        "only held payments of finalized, undisputed requests can be released",
                    ));
                }
                request.payment_status = new_status;
                Ok(())
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => {
                self.audit_failure(
                    "payment_status_update_failed",
                    id,
                    actor,
                    &err,
                    json!({ "to": new_status }),
                )
                .await;
                return Err(err);
            }
        };

        let request = &outcome.request;
        tracing::info!(
            service_request_id = %request.id,
            from = %outcome.previous_payment_status,
            to = %request.payment_status,
            settled = outcome.settled,
            "payment status updated"
        );
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "payment_status_update",
                format!("service_request:{}", request.id),
                format!(
                    "Payment status changed from {} to {}",
                    outcome.previous_payment_status, request.payment_status
                ),
                json!({
                    "from": outcome.previous_payment_status,
                    "to": request.payment_status,
                }),
            ))
            .await;

        if outcome.settled {
            self.settlement.record_settled(request, actor).await;
            self.notify_released(request).await;
            self.settlement.complete(request).await;
        }

        Ok(outcome)
    }

    /// Release the held payment of a finalized request to its provider.
    ///
    /// Unlike a payment status write, a second release fails with
    /// `AlreadySettled`.
    pub async fn release(&self, id: Uuid, actor: Actor) -> LedgerResult<ServiceRequest> {
        let request = self.settlement.settle(id, actor).await?;
        self.notify_released(&request).await;
        Ok(request)
    }

    /// Charge the requester through the payment gateway and hold the funds.
    ///
    /// The request is claimed (`charged`) before the gateway is called, so a
    /// concurrent wallet payment or capture cannot collect it a second time.
    pub async fn capture_payment(&self, id: Uuid, actor: Actor) -> LedgerResult<ServiceRequest> {
        let request = match self.claim_collection(id, actor).await {
            Ok(request) => request,
            Err(err) => {
                self.audit_failure("payment_capture_failed", id, actor, &err, json!({}))
                    .await;
                return Err(err);
            }
        };

        let charge = self
            .collaborators
            .gateway
            .charge(request.requester_id, request.total_amount, &id.to_string())
            .await;

        match charge {
            Ok(receipt) => {
                let held = self
                    .finish_collection(id, actor, PaymentStatus::HeldForRelease)
                    .await?;

                tracing::info!(
                    service_request_id = %id,
                    amount = request.total_amount,
                    reference = %receipt.reference,
                    "payment captured"
                );
                self.collaborators
                    .audit(ActivityEntry::new(
                        actor,
                        "payment_captured",
                        format!("service_request:{id}"),
                        format!("Charged {}", format_minor(request.total_amount)),
                        json!({ "reference": receipt.reference, "amount": request.total_amount }),
                    ))
                    .await;
                Ok(held)
            }
            Err(err) => {
                let err = match err {
                    LedgerError::GatewayFailure(_) => err,
                    other => LedgerError::GatewayFailure(other.to_string()),
                };
                tracing::warn!(service_request_id = %id, error = %err, "payment capture failed");

                if let Err(mark_err) = self.finish_collection(id, actor, PaymentStatus::Failed).await {
                    tracing::error!(
                        service_request_id = %id,
                        error = %mark_err,
                        "could not mark payment as failed"
                    );
                }

                self.audit_failure(
                    "payment_capture_failed",
                    id,
                    actor,
                    &err,
                    json!({ "amount": request.total_amount }),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Pay a request from the requester's wallet balance.
    ///
    /// The request is claimed before the debit. A rejected debit hands the
    /// claim back. Loyalty bonuses unlocked by the spend are granted
    /// afterwards; a bonus failure is queued for reconciliation and does not
    /// fail the payment.
    pub async fn pay_with_wallet(&self, id: Uuid, actor: Actor) -> LedgerResult<ServiceRequest> {
        let before = self.load(id).await?;
        let request = self.claim_collection(id, actor).await?;

        let source = id.to_string();
        let description = format!("Payment for service request {id}");
        if let Err(err) = self
            .wallets
            .debit(
                request.requester_id,
                request.total_amount,
                &description,
                Some(&source),
            )
            .await
        {
            if let Err(release_err) = self.finish_collection(id, actor, before.payment_status).await {
                tracing::error!(
                    service_request_id = %id,
                    error = %release_err,
                    "could not release payment claim"
                );
            }
            return Err(err);
        }

        let held = match self
            .finish_collection(id, actor, PaymentStatus::HeldForRelease)
            .await
        {
            Ok(held) => held,
            Err(err) => {
                // The debit stands; the request stays `charged` until an
                // operator writes `held_for_release`.
                tracing::error!(
                    service_request_id = %id,
                    error = %err,
                    "wallet debited but payment could not be held"
                );
                self.audit_failure(
                    "payment_hold_failed",
                    id,
                    actor,
                    &err,
                    json!({ "account_id": request.requester_id, "amount": request.total_amount }),
                )
                .await;
                return Err(err);
            }
        };

        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "payment_from_wallet",
                format!("service_request:{id}"),
                format!("Paid {} from wallet", format_minor(request.total_amount)),
                json!({ "account_id": request.requester_id, "amount": request.total_amount }),
            ))
            .await;

        if let Err(err) = self.loyalty.grant_next(request.requester_id).await {
            tracing::warn!(
                account_id = %request.requester_id,
                error = %err,
                "loyalty bonus grant failed; queued for reconciliation"
            );
            let item = PendingWork::new(
                source,
                PendingWorkKind::LoyaltyBonus,
                Some(request.requester_id),
                err.to_string(),
            );
            if let Err(queue_err) = enqueue_pending_work(self.store.as_ref(), item).await {
                tracing::error!(error = %queue_err, "could not queue loyalty bonus grant");
            }
        }

        Ok(held)
    }

    /// Refund part or all of a held payment to the requester's wallet.
    ///
    /// The payment status moves to `refunded_*` first, which takes the
    /// request out of reach of a concurrent release. The wallet credit
    /// follows; if it fails it is queued for reconciliation.
    pub async fn refund(&self, id: Uuid, amount: i64, actor: Actor) -> LedgerResult<ServiceRequest> {
        let claimed = self
            .commit_change(id, actor, move |request: &mut ServiceRequest| -> LedgerResult<()> {
                ensure_refundable(request, amount)?;
                request.payment_status = if amount == request.total_amount {
                    PaymentStatus::RefundedTotal
                } else {
                    PaymentStatus::RefundedPartial
                };
                request.refunded_amount = amount;
                Ok(())
            })
            .await;

        let outcome = match claimed {
            Ok(outcome) => outcome,
            Err(err) => {
                self.audit_failure("refund_failed", id, actor, &err, json!({ "amount": amount }))
                    .await;
                return Err(err);
            }
        };
        let request = outcome.request;

        if let Err(err) = self.credit_refund(&request).await {
            tracing::warn!(
                service_request_id = %id,
                amount,
                error = %err,
                "refund credit failed; queued for reconciliation"
            );
            let item = PendingWork::new(
                id.to_string(),
                PendingWorkKind::RefundCredit,
                Some(request.requester_id),
                err.to_string(),
            );
            if let Err(queue_err) = enqueue_pending_work(self.store.as_ref(), item).await {
                tracing::error!(service_request_id = %id, error = %queue_err, "could not queue refund credit");
            }
            self.audit_failure("refund_credit_failed", id, actor, &err, json!({ "amount": amount }))
                .await;
            return Err(err);
        }

        tracing::info!(
            service_request_id = %id,
            amount,
            payment_status = %request.payment_status,
            "payment refunded"
        );
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "payment_refunded",
                format!("service_request:{id}"),
                format!("Refunded {} to the requester", format_minor(amount)),
                json!({
                    "amount": amount,
                    "payment_status": request.payment_status,
                }),
            ))
            .await;

        Ok(request)
    }

    /// Credit the claimed refund of a request. Idempotent per request.
    pub(crate) async fn credit_refund(&self, request: &ServiceRequest) -> LedgerResult<()> {
        if request.refunded_amount <= 0 {
            return Err(invalid(
                request.payment_status,
                PaymentStatus::RefundedPartial,
                "no refund was claimed for this request",
            ));
        }
        self.wallets
            .credit(
                Credit::new(
                    request.requester_id,
                    request.refunded_amount,
                    TransactionType::Refund,
                    format!("Refund for service request {}", request.id),
                )
                .source(request.id.to_string())
                .metadata(json!({ "service_request_id": request.id })),
            )
            .await?;
        Ok(())
    }

    /// Re-credit a refund queued by a failed [`ServiceLifecycle::refund`].
    pub(crate) async fn retry_refund_credit(&self, id: Uuid) -> LedgerResult<()> {
        let request = self.load(id).await?;
        self.credit_refund(&request).await
    }

    // ===== Private Helper Methods =====

    async fn load(&self, id: Uuid) -> LedgerResult<ServiceRequest> {
        self.store
            .get_service_request(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("service_request", id))
    }

    /// Mark the payment as being collected. Only one collector wins.
    async fn claim_collection(&self, id: Uuid, actor: Actor) -> LedgerResult<ServiceRequest> {
        let outcome = self
            .commit_change(id, actor, |request: &mut ServiceRequest| -> LedgerResult<()> {
                ensure_chargeable(request)?;
                request.payment_status = PaymentStatus::Charged;
                Ok(())
            })
            .await?;
        Ok(outcome.request)
    }

    /// Settle a claimed collection into `to`.
    async fn finish_collection(
        &self,
        id: Uuid,
        actor: Actor,
        to: PaymentStatus,
    ) -> LedgerResult<ServiceRequest> {
        let outcome = self
            .commit_change(id, actor, move |request: &mut ServiceRequest| -> LedgerResult<()> {
                if request.payment_status != PaymentStatus::Charged {
                    return Err(invalid(request.payment_status, to, "payment is not being collected"));
                }
                request.payment_status = to;
                if to == PaymentStatus::HeldForRelease {
                    request.charged_amount = request.total_amount;
                }
                Ok(())
            })
            .await?;
        Ok(outcome.request)
    }

    /// Read, mutate, evaluate release and compare-and-swap, retried on conflict.
    async fn commit_change<F>(&self, id: Uuid, actor: Actor, mutate: F) -> LedgerResult<TransitionOutcome>
    where
        F: Fn(&mut ServiceRequest) -> LedgerResult<()> + Send + Sync,
    {
        let mutate = &mutate;
        with_retry(self.config.store_max_retries, move || {
            self.try_commit_change(id, actor, mutate)
        })
        .await
    }

    async fn try_commit_change<F>(
        &self,
        id: Uuid,
        actor: Actor,
        mutate: &F,
    ) -> LedgerResult<TransitionOutcome>
    where
        F: Fn(&mut ServiceRequest) -> LedgerResult<()> + Send + Sync,
    {
        let mut request = self.load(id).await?;
        let before = request.clone();
        mutate(&mut request)?;

        // Idempotency barrier: an already stored breakdown turns a repeated
        // trigger into a no-op.
        let settled = should_release(&before, &request) && !request.is_settled();
        if settled {
            let breakdown = self.settlement.breakdown_for(&request).await?;
            self.settlement.apply(&mut request, breakdown)?;
        }

        request.actor_id = Some(actor.id);
        request.actor_role = Some(actor.role);
        request.updated_at = Utc::now();

        self.store
            .update_service_request(&request, before.version)
            .await?;
        request.version = before.version + 1;

        Ok(TransitionOutcome {
            request,
            previous_status: before.status,
            previous_payment_status: before.payment_status,
            settled,
        })
    }

    fn transition_context(&self, request: &ServiceRequest, settled: bool) -> TransitionContext {
        let refunded = matches!(
            request.payment_status,
            PaymentStatus::RefundedPartial | PaymentStatus::RefundedTotal
        );

        let amount = if settled {
            request
                .financial_breakdown
                .as_ref()
                .map(|breakdown| breakdown.provider_payout)
        } else if refunded {
            Some(request.refunded_amount)
        } else {
            Some(request.total_amount)
        };

        TransitionContext {
            payment_released: settled,
            refunded,
            amount,
        }
    }

    async fn notify_released(&self, request: &ServiceRequest) {
        let Some(breakdown) = request.financial_breakdown.as_ref() else {
            return;
        };
        self.send_notice(
            request,
            Notice {
                title: "Payment released".to_string(),
                body: format!(
                    "{} was released to you.",
                    format_minor(breakdown.provider_payout)
                ),
                recipient: Recipient::Provider,
            },
        )
        .await;
    }

    async fn send_notice(&self, request: &ServiceRequest, notice: Notice) {
        let recipients = match notice.recipient {
            Recipient::Requester => vec![(request.requester_id, AccountKind::User)],
            Recipient::Provider => vec![(request.provider_id, AccountKind::Provider)],
            Recipient::Both => vec![
                (request.requester_id, AccountKind::User),
                (request.provider_id, AccountKind::Provider),
            ],
        };

        let deliveries = recipients.into_iter().map(|(account_id, account_kind)| {
            self.collaborators.notify(Notification {
                account_id,
                account_kind,
                title: notice.title.clone(),
                body: notice.body.clone(),
                data: json!({
                    "service_request_id": request.id,
                    "status": request.status,
                    "payment_status": request.payment_status,
                }),
            })
        });
        join_all(deliveries).await;
    }

    async fn audit_failure(
        &self,
        action: &str,
        id: Uuid,
        actor: Actor,
        err: &LedgerError,
        details: serde_json::Value,
    ) {
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                action,
                format!("service_request:{id}"),
                err.to_string(),
                json!({ "code": err.code(), "details": details }),
            ))
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::collaborators::{
        ActivityLog, Notifier, RecordingActivityLog, RecordingNotifier, SimulatedPaymentGateway,
    };
    use crate::models::ActorRole;
    use crate::services::Services;
    use crate::store::{CommissionFilter, FaultPoint, MemoryLedgerStore};

    /// Recorder that holds every call for `delay` before recording it.
    struct Slow<T> {
        inner: Arc<T>,
        delay: Duration,
    }

    impl<T> Slow<T> {
        async fn wait(&self) {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }

    #[async_trait]
    impl Notifier for Slow<RecordingNotifier> {
        async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
            self.wait().await;
            self.inner.notify(notification).await
        }
    }

    #[async_trait]
    impl ActivityLog for Slow<RecordingActivityLog> {
        async fn record(&self, entry: &ActivityEntry) -> anyhow::Result<()> {
            self.wait().await;
            self.inner.record(entry).await
        }
    }

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        notifier: Arc<RecordingNotifier>,
        activity: Arc<RecordingActivityLog>,
        gateway: Arc<SimulatedPaymentGateway>,
        services: Services,
    }

    fn fixture() -> Fixture {
        fixture_with(Duration::ZERO, Duration::ZERO)
    }

    fn fixture_with(notice_delay: Duration, audit_delay: Duration) -> Fixture {
        let store = Arc::new(MemoryLedgerStore::new());
        let notifier = Arc::new(RecordingNotifier::new());
        let activity = Arc::new(RecordingActivityLog::new());
        let gateway = Arc::new(SimulatedPaymentGateway::new());
        let collaborators = Collaborators::new(
            Arc::new(Slow {
                inner: activity.clone(),
                delay: audit_delay,
            }),
            Arc::new(Slow {
                inner: notifier.clone(),
                delay: notice_delay,
            }),
            gateway.clone(),
        );
        let services = Services::new(
            store.clone(),
            Arc::new(LedgerConfig::default()),
            collaborators,
            Duration::from_secs(30),
        );
        Fixture {
            store,
            notifier,
            activity,
            gateway,
            services,
        }
    }

    async fn balance(fixture: &Fixture, account_id: Uuid) -> i64 {
        fixture.services.wallets.get_wallet(account_id).await.unwrap().balance
    }

    fn user(id: Uuid) -> Actor {
        Actor::new(id, ActorRole::User)
    }

    async fn paid_request(fixture: &Fixture, total: i64) -> ServiceRequest {
        let lifecycle = &fixture.services.lifecycle;
        let request = lifecycle
            .create_service_request(Uuid::new_v4(), Uuid::new_v4(), total, Actor::system())
            .await
            .unwrap();
        lifecycle.capture_payment(request.id, Actor::system()).await.unwrap()
    }

    #[tokio::test]
    async fn closing_a_held_request_settles_it() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let request = paid_request(&fixture, 100_000).await;
        assert_eq!(request.payment_status, PaymentStatus::HeldForRelease);
        assert_eq!(request.charged_amount, 100_000);

        for status in [
            ServiceStatus::Paid,
            ServiceStatus::ServiceStarted,
            ServiceStatus::CompletedByProvider,
            ServiceStatus::CompletedByUser,
        ] {
            let outcome = lifecycle
                .apply_transition(request.id, status, user(request.requester_id))
                .await
                .unwrap();
            assert!(!outcome.settled);
        }

        let outcome = lifecycle
            .apply_transition(request.id, ServiceStatus::ClosedWithRating, user(request.requester_id))
            .await
            .unwrap();
        assert!(outcome.settled);
        let closed = outcome.request;
        assert_eq!(closed.payment_status, PaymentStatus::ReleasedToProvider);
        assert!(closed.finalized_at.is_some());
        assert_eq!(closed.financial_breakdown.unwrap().provider_payout, 90_000);

        let released: Vec<_> = fixture
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.title == "Payment released")
            .collect();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].account_id, request.provider_id);
        assert!(released[0].body.contains("900.00"));

        assert!(fixture.activity.actions().contains(&"payment_released".to_string()));
    }

    #[tokio::test]
    async fn no_op_and_reopening_are_rejected() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let request = paid_request(&fixture, 10_000).await;

        let err = lifecycle
            .apply_transition(request.id, ServiceStatus::Scheduled, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        lifecycle
            .apply_transition(request.id, ServiceStatus::ClosedAuto, Actor::system())
            .await
            .unwrap();
        let err = lifecycle
            .apply_transition(request.id, ServiceStatus::ServiceStarted, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        // A rating after an automatic close stays terminal and does not settle again.
        let rated = lifecycle
            .apply_transition(request.id, ServiceStatus::ClosedWithRating, Actor::system())
            .await
            .unwrap();
        assert!(!rated.settled);
        assert!(fixture
            .activity
            .actions()
            .contains(&"status_transition_failed".to_string()));
    }

    #[tokio::test]
    async fn dispute_freezes_and_resolution_releases() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let request = paid_request(&fixture, 50_000).await;

        let disputed = lifecycle
            .apply_transition(request.id, ServiceStatus::InDispute, Actor::system())
            .await
            .unwrap();
        assert_eq!(disputed.request.payment_status, PaymentStatus::FrozenDispute);

        let err = lifecycle
            .update_payment_status(request.id, PaymentStatus::ReleasedToProvider, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let resolved = lifecycle
            .apply_transition(request.id, ServiceStatus::ClosedDisputeResolved, Actor::system())
            .await
            .unwrap();
        assert!(resolved.settled);
        assert_eq!(resolved.request.payment_status, PaymentStatus::ReleasedToProvider);
    }

    #[tokio::test]
    async fn refunded_dispute_closes_without_release() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let request = paid_request(&fixture, 50_000).await;
        lifecycle
            .apply_transition(request.id, ServiceStatus::InDispute, Actor::system())
            .await
            .unwrap();

        let refunded = lifecycle.refund(request.id, 20_000, Actor::system()).await.unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::RefundedPartial);
        assert_eq!(
            fixture
                .services
                .wallets
                .get_wallet(request.requester_id)
                .await
                .unwrap()
                .balance,
            20_000
        );

        let closed = lifecycle
            .apply_transition(request.id, ServiceStatus::ClosedDisputeResolved, Actor::system())
            .await
            .unwrap();
        assert!(!closed.settled);
        assert!(closed.request.financial_breakdown.is_none());
        assert!(fixture
            .notifier
            .sent()
            .iter()
            .any(|n| n.body.contains("refund of 200.00")));
    }

    #[tokio::test]
    async fn refund_rejects_out_of_range_amounts() {
        let fixture = fixture();
        let request = paid_request(&fixture, 10_000).await;

        for amount in [0, -5, 10_001] {
            let err = fixture
                .services
                .lifecycle
                .refund(request.id, amount, Actor::system())
                .await
                .unwrap_err();
            assert_eq!(err, LedgerError::InvalidAmount(amount));
        }
    }

    #[tokio::test]
    async fn explicit_release_settles_a_finalized_request() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let request = lifecycle
            .create_service_request(Uuid::new_v4(), Uuid::new_v4(), 30_000, Actor::system())
            .await
            .unwrap();

        // Closed before the charge landed: nothing to release yet.
        let closed = lifecycle
            .apply_transition(request.id, ServiceStatus::ClosedAuto, Actor::system())
            .await
            .unwrap();
        assert!(!closed.settled);

        lifecycle.capture_payment(request.id, Actor::system()).await.unwrap();
        let released = lifecycle
            .update_payment_status(request.id, PaymentStatus::ReleasedToProvider, Actor::system())
            .await
            .unwrap();
        assert!(released.settled);
        assert!(released.request.financial_breakdown.is_some());

        let err = lifecycle
            .update_payment_status(request.id, PaymentStatus::HeldForRelease, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn failed_capture_marks_payment_failed() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let request = lifecycle
            .create_service_request(Uuid::new_v4(), Uuid::new_v4(), 10_000, Actor::system())
            .await
            .unwrap();

        fixture.gateway.set_failing(true);
        let err = lifecycle.capture_payment(request.id, Actor::system()).await.unwrap_err();
        assert!(matches!(err, LedgerError::GatewayFailure(_)));
        assert_eq!(
            lifecycle.get(request.id).await.unwrap().payment_status,
            PaymentStatus::Failed
        );

        fixture.gateway.set_failing(false);
        let captured = lifecycle.capture_payment(request.id, Actor::system()).await.unwrap();
        assert_eq!(captured.payment_status, PaymentStatus::HeldForRelease);
        assert!(fixture
            .activity
            .actions()
            .contains(&"payment_capture_failed".to_string()));
    }

    #[tokio::test]
    async fn wallet_payment_grants_unlocked_bonus() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let requester = Uuid::new_v4();
        fixture
            .services
            .wallets
            .credit(Credit::new(requester, 300_000, TransactionType::Refund, "top up"))
            .await
            .unwrap();

        let request = lifecycle
            .create_service_request(requester, Uuid::new_v4(), 250_000, Actor::system())
            .await
            .unwrap();
        let paid = lifecycle.pay_with_wallet(request.id, user(requester)).await.unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::HeldForRelease);

        let wallet = fixture.services.wallets.get_wallet(requester).await.unwrap();
        assert_eq!(wallet.total_spent, 250_000);
        assert_eq!(wallet.bonuses_earned, 1);
        assert_eq!(wallet.balance, 300_000 - 250_000 + 2_000);

        let err = lifecycle.pay_with_wallet(request.id, user(requester)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_closures_settle_once() {
        let fixture = fixture();
        let request = paid_request(&fixture, 100_000).await;
        let ambassador = Uuid::new_v4();
        fixture
            .store
            .set_referring_ambassador(request.provider_id, ambassador)
            .await
            .unwrap();

        let lifecycle = fixture.services.lifecycle.clone();
        let other = fixture.services.lifecycle.clone();
        let id = request.id;
        let (a, b) = tokio::join!(
            tokio::spawn(async move {
                lifecycle
                    .apply_transition(id, ServiceStatus::ClosedAuto, Actor::system())
                    .await
            }),
            tokio::spawn(async move {
                other
                    .apply_transition(id, ServiceStatus::ClosedWithRating, Actor::system())
                    .await
            }),
        );

        let settled_count = [a.unwrap(), b.unwrap()]
            .into_iter()
            .filter_map(Result::ok)
            .filter(|outcome| outcome.settled)
            .count();
        assert_eq!(settled_count, 1);

        let commissions = fixture
            .store
            .list_commissions(&CommissionFilter {
                source_id: Some(id.to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(commissions.len(), 1);
        assert_eq!(commissions[0].amount, 3_600);
        assert_eq!(fixture.store.loyalty_fund().await.unwrap().contributions, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_during_refund_does_not_release() {
        let fixture = fixture_with(Duration::from_millis(50), Duration::ZERO);
        let request = paid_request(&fixture, 100_000).await;
        let id = request.id;

        let lifecycle = fixture.services.lifecycle.clone();
        let refund = tokio::spawn(async move { lifecycle.refund(id, 100_000, Actor::system()).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let closed = fixture
            .services
            .lifecycle
            .apply_transition(id, ServiceStatus::ClosedAuto, Actor::system())
            .await
            .unwrap();

        let refunded = refund.await.unwrap().unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::RefundedTotal);
        assert!(!closed.settled);
        assert!(closed.request.financial_breakdown.is_none());
        assert_eq!(balance(&fixture, request.requester_id).await, 100_000);

        let stored = fixture.services.lifecycle.get(id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::RefundedTotal);
        assert!(!stored.is_settled());
    }

    #[tokio::test]
    async fn failed_refund_credit_is_queued() {
        let fixture = fixture();
        let request = paid_request(&fixture, 40_000).await;

        fixture.store.set_fault(FaultPoint::CommitWallet, true).await;
        let err = fixture
            .services
            .lifecycle
            .refund(request.id, 15_000, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));

        // The claim stands, so the request can no longer be released.
        let stored = fixture.services.lifecycle.get(request.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::RefundedPartial);
        assert_eq!(stored.refunded_amount, 15_000);
        let queued = fixture
            .store
            .list_pending_work(Some(&request.id.to_string()))
            .await
            .unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, PendingWorkKind::RefundCredit);

        fixture.store.set_fault(FaultPoint::CommitWallet, false).await;
        let report = fixture.services.reconciliation.run_once().await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(balance(&fixture, request.requester_id).await, 15_000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capture_during_wallet_payment_is_rejected() {
        let fixture = fixture_with(Duration::ZERO, Duration::from_millis(50));
        let requester = Uuid::new_v4();
        fixture
            .services
            .wallets
            .credit(Credit::new(requester, 100_000, TransactionType::Refund, "top up"))
            .await
            .unwrap();
        let request = fixture
            .services
            .lifecycle
            .create_service_request(requester, Uuid::new_v4(), 60_000, Actor::system())
            .await
            .unwrap();
        let id = request.id;

        let lifecycle = fixture.services.lifecycle.clone();
        let payment = tokio::spawn(async move { lifecycle.pay_with_wallet(id, user(requester)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = fixture
            .services
            .lifecycle
            .capture_payment(id, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let paid = payment.await.unwrap().unwrap();
        assert_eq!(paid.payment_status, PaymentStatus::HeldForRelease);
        assert!(fixture.gateway.calls().is_empty());

        let wallet = fixture.services.wallets.get_wallet(requester).await.unwrap();
        assert_eq!(wallet.total_spent, 60_000);
        assert_eq!(wallet.balance, 40_000);
    }

    #[tokio::test]
    async fn rejected_wallet_debit_releases_the_claim() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let requester = Uuid::new_v4();
        let request = lifecycle
            .create_service_request(requester, Uuid::new_v4(), 25_000, Actor::system())
            .await
            .unwrap();

        let err = lifecycle.pay_with_wallet(request.id, user(requester)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { .. }));
        assert_eq!(
            lifecycle.get(request.id).await.unwrap().payment_status,
            PaymentStatus::PendingCharge
        );

        // The request can still be collected another way.
        let captured = lifecycle.capture_payment(request.id, Actor::system()).await.unwrap();
        assert_eq!(captured.payment_status, PaymentStatus::HeldForRelease);
        assert_eq!(fixture.gateway.calls(), vec![format!("charge:{}", request.id)]);
    }

    #[tokio::test]
    async fn release_pays_out_once_and_notifies_the_provider() {
        let fixture = fixture();
        let lifecycle = &fixture.services.lifecycle;
        let request = paid_request(&fixture, 20_000).await;

        // Held but still open: not eligible.
        let err = lifecycle.release(request.id, Actor::system()).await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let late = lifecycle
            .create_service_request(Uuid::new_v4(), Uuid::new_v4(), 20_000, Actor::system())
            .await
            .unwrap();
        lifecycle
            .apply_transition(late.id, ServiceStatus::ClosedAuto, Actor::system())
            .await
            .unwrap();
        lifecycle.capture_payment(late.id, Actor::system()).await.unwrap();

        let released = lifecycle.release(late.id, Actor::system()).await.unwrap();
        assert_eq!(released.payment_status, PaymentStatus::ReleasedToProvider);
        assert_eq!(released.financial_breakdown.unwrap().provider_payout, 18_000);

        let err = lifecycle.release(late.id, Actor::system()).await.unwrap_err();
        assert_eq!(err, LedgerError::AlreadySettled(late.id));

        let notices: Vec<_> = fixture
            .notifier
            .sent()
            .into_iter()
            .filter(|n| n.title == "Payment released")
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].account_id, late.provider_id);
        assert_eq!(notices[0].account_kind, AccountKind::Provider);
    }
}
