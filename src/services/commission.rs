//! Ambassador commissions from platform commission and membership fees

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::reconciliation::enqueue_pending_work;
use super::wallet_ledger::{Credit, WalletLedger};
use crate::collaborators::{AccountKind, ActivityEntry, Collaborators, Notification};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Actor, AmbassadorTier, Commission, CommissionStatus, CommissionType, MembershipTier,
    PendingWork, PendingWorkKind, TransactionType,
};
use crate::money::{apply_bps, format_minor, BPS_DENOMINATOR};
use crate::store::{CommissionFilter, LedgerStore};

/// One ambassador's cut of a platform commission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionShare {
    pub ambassador_id: Uuid,
    pub amount: i64,
    pub percentage_bps: i64,
}

/// Split `platform_commission` between the referring ambassadors.
///
/// The provider's ambassador is paid first and the requester's ambassador
/// receives the remainder of the two shares, so a two-ambassador split sums
/// to exactly the sum of both percentages.
pub fn split_commission(
    platform_commission: i64,
    provider_ambassador: Option<Uuid>,
    requester_ambassador: Option<Uuid>,
    config: &LedgerConfig,
) -> Vec<CommissionShare> {
    let provider_bps = config.provider_ambassador_share_bps;
    let requester_bps = config.requester_ambassador_share_bps;

    let shares = match (provider_ambassador, requester_ambassador) {
        (Some(provider), Some(requester)) if provider == requester => vec![CommissionShare {
            ambassador_id: provider,
            amount: platform_commission,
            percentage_bps: BPS_DENOMINATOR,
        }],
        (Some(provider), Some(requester)) => {
            let provider_amount = apply_bps(platform_commission, provider_bps);
            let both = apply_bps(platform_commission, provider_bps + requester_bps);
            vec![
                CommissionShare {
                    ambassador_id: provider,
                    amount: provider_amount,
                    percentage_bps: provider_bps,
                },
                CommissionShare {
                    ambassador_id: requester,
                    amount: both - provider_amount,
                    percentage_bps: requester_bps,
                },
            ]
        }
        (Some(provider), None) => vec![CommissionShare {
            ambassador_id: provider,
            amount: apply_bps(platform_commission, provider_bps),
            percentage_bps: provider_bps,
        }],
        (None, Some(requester)) => vec![CommissionShare {
            ambassador_id: requester,
            amount: apply_bps(platform_commission, requester_bps),
            percentage_bps: requester_bps,
        }],
        (None, None) => Vec::new(),
    };

    shares.into_iter().filter(|share| share.amount > 0).collect()
}

pub struct CommissionDistributor {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    wallets: Arc<WalletLedger>,
    collaborators: Collaborators,
}

impl CommissionDistributor {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<LedgerConfig>,
        wallets: Arc<WalletLedger>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            store,
            config,
            wallets,
            collaborators,
        }
    }

    /// Record pending service commissions for one settlement.
    ///
    /// Safe to re-run for the same `source_id`: commissions that already
    /// exist are returned instead of duplicated.
    pub async fn distribute_service(
        &self,
        source_id: &str,
        platform_commission: i64,
        provider_ambassador: Option<Uuid>,
        requester_ambassador: Option<Uuid>,
    ) -> LedgerResult<Vec<Commission>> {
        let shares = split_commission(
            platform_commission,
            provider_ambassador,
            requester_ambassador,
            &self.config,
        );

        let mut commissions = Vec::with_capacity(shares.len());
        for share in shares {
            let role = if Some(share.ambassador_id) == provider_ambassador {
                "provider"
            } else {
                "requester"
            };
            let commission = Commission {
                id: Uuid::new_v4(),
                ambassador_id: share.ambassador_id,
                commission_type: CommissionType::Service,
                source_id: source_id.to_string(),
                amount: share.amount,
                percentage_bps: share.percentage_bps,
                status: CommissionStatus::Pending,
                created_at: Utc::now(),
                paid_at: None,
                metadata: json!({
                    "platform_commission": platform_commission,
                    "referral_side": role,
                }),
            };

            let stored = self.record(commission).await?;
            commissions.push(stored);
        }

        Ok(commissions)
    }

    /// Pay the flat membership commission to the subscriber's ambassador.
    ///
    /// Returns `None` when the subscriber was not referred.
    pub async fn distribute_membership(
        &self,
        subscriber_id: Uuid,
        membership: MembershipTier,
        membership_fee: i64,
        source_id: &str,
    ) -> LedgerResult<Option<Commission>> {
        if membership_fee < 0 {
            return Err(LedgerError::InvalidAmount(membership_fee));
        }

        let Some(ambassador_id) = self.store.referring_ambassador(subscriber_id).await? else {
            tracing::debug!(subscriber_id = %subscriber_id, "membership without referral; no commission");
            return Ok(None);
        };
        let tier = self
            .store
            .ambassador_tier(ambassador_id)
            .await?
            .unwrap_or(AmbassadorTier::Standard);
        let amount = self.config.membership_commissions.amount(membership, tier);
        let percentage_bps = if membership_fee > 0 {
            amount * BPS_DENOMINATOR / membership_fee
        } else {
            0
        };

        let now = Utc::now();
        let commission = self
            .record(Commission {
                id: Uuid::new_v4(),
                ambassador_id,
                commission_type: CommissionType::Membership,
                source_id: source_id.to_string(),
                amount,
                percentage_bps,
                status: CommissionStatus::Paid,
                created_at: now,
                paid_at: Some(now),
                metadata: json!({
                    "subscriber_id": subscriber_id,
                    "membership": membership.as_str(),
                    "ambassador_tier": tier,
                    "membership_fee": membership_fee,
                }),
            })
            .await?;

        // The record already says paid; a missed credit is repaired by the
        // payout retry for this source.
        if let Err(err) = self.credit_commission(&commission).await {
            self.queue_payout(source_id, &err).await;
            return Err(err);
        }
        Ok(Some(commission))
    }

    /// Credit every unpaid commission recorded for `source_id`.
    ///
    /// Also repairs commissions marked paid whose wallet credit never landed.
    pub async fn pay_pending(&self, source_id: &str) -> LedgerResult<Vec<Commission>> {
        match self.try_pay_pending(source_id).await {
            Ok(paid) => Ok(paid),
            Err(err) => {
                self.queue_payout(source_id, &err).await;
                Err(err)
            }
        }
    }

    pub async fn list(&self, filter: &CommissionFilter) -> LedgerResult<Vec<Commission>> {
        self.store.list_commissions(filter).await
    }

    pub async fn set_referrer(
        &self,
        account_id: Uuid,
        ambassador_id: Uuid,
        actor: Actor,
    ) -> LedgerResult<()> {
        if account_id == ambassador_id {
            return Err(LedgerError::InvalidRequest(
                "an account cannot refer itself".to_string(),
            ));
        }
        self.store
            .set_referring_ambassador(account_id, ambassador_id)
            .await?;
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "referral_set",
                format!("account:{account_id}"),
                "Referring ambassador assigned",
                json!({ "ambassador_id": ambassador_id }),
            ))
            .await;
        Ok(())
    }

    pub async fn set_ambassador_tier(
        &self,
        ambassador_id: Uuid,
        tier: AmbassadorTier,
        actor: Actor,
    ) -> LedgerResult<()> {
        self.store.set_ambassador_tier(ambassador_id, tier).await?;
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "ambassador_tier_set",
                format!("ambassador:{ambassador_id}"),
                "Ambassador tier updated",
                json!({ "tier": tier }),
            ))
            .await;
        Ok(())
    }

    // ===== Private Helper Methods =====

    async fn queue_payout(&self, source_id: &str, err: &LedgerError) {
        tracing::warn!(
            source_id,
            error = %err,
            "commission payout failed; queued for reconciliation"
        );
        let item = PendingWork::new(
            source_id,
            PendingWorkKind::CommissionPayout,
            None,
            err.to_string(),
        );
        if let Err(queue_err) = enqueue_pending_work(self.store.as_ref(), item).await {
            tracing::error!(source_id, error = %queue_err, "could not queue commission payout");
        }
    }

    async fn try_pay_pending(&self, source_id: &str) -> LedgerResult<Vec<Commission>> {
        let commissions = self
            .store
            .list_commissions(&CommissionFilter {
                source_id: Some(source_id.to_string()),
                ..Default::default()
            })
            .await?;

        let mut paid = Vec::new();
        for mut commission in commissions {
            self.credit_commission(&commission).await?;

            if commission.status == CommissionStatus::Pending {
                let paid_at = Utc::now();
                self.store.mark_commission_paid(commission.id, paid_at).await?;
                commission.status = CommissionStatus::Paid;
                commission.paid_at = Some(paid_at);
                paid.push(commission);
            }
        }

        if !paid.is_empty() {
            tracing::info!(source_id, count = paid.len(), "commissions paid out");
        }
        Ok(paid)
    }

    /// Insert a commission or return the one already stored under its key.
    async fn record(&self, commission: Commission) -> LedgerResult<Commission> {
        if self.store.insert_commission(&commission).await? {
            tracing::info!(
                ambassador_id = %commission.ambassador_id,
                source_id = %commission.source_id,
                amount = commission.amount,
                "commission recorded"
            );
            self.collaborators
                .audit(ActivityEntry::new(
                    Actor::system(),
                    "commission_created",
                    format!("commission:{}", commission.id),
                    format!(
                        "{} commission of {} for ambassador {}",
                        match commission.commission_type {
                            CommissionType::Service => "Service",
                            CommissionType::Membership => "Membership",
                        },
                        format_minor(commission.amount),
                        commission.ambassador_id
                    ),
                    json!({
                        "source_id": commission.source_id,
                        "amount": commission.amount,
                        "percentage_bps": commission.percentage_bps,
                        "status": commission.status,
                    }),
                ))
                .await;
            return Ok(commission);
        }

        let existing = self
            .store
            .list_commissions(&CommissionFilter {
                ambassador_id: Some(commission.ambassador_id),
                source_id: Some(commission.source_id.clone()),
                commission_type: Some(commission.commission_type),
                status: None,
            })
            .await?;
        existing
            .into_iter()
            .next()
            .ok_or_else(|| LedgerError::conflict("commission", commission.id))
    }

    async fn credit_commission(&self, commission: &Commission) -> LedgerResult<()> {
        let source = commission.id.to_string();
        if self
            .store
            .find_wallet_transaction(commission.ambassador_id, TransactionType::Commission, &source)
            .await?
            .is_some()
        {
            return Ok(());
        }

        self.wallets
            .credit(
                Credit::new(
                    commission.ambassador_id,
                    commission.amount,
                    TransactionType::Commission,
                    format!("Ambassador commission for {}", commission.source_id),
                )
                .source(source)
                .metadata(json!({
                    "commission_type": commission.commission_type,
                    "source_id": commission.source_id,
                })),
            )
            .await?;

        self.collaborators
            .notify(Notification {
                account_id: commission.ambassador_id,
                account_kind: AccountKind::Ambassador,
                title: "Commission paid".to_string(),
                body: format!(
                    "You earned {} from a referral.",
                    format_minor(commission.amount)
                ),
                data: json!({ "commission_id": commission.id }),
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordingActivityLog, RecordingNotifier, SimulatedPaymentGateway};
    use crate::store::{FaultPoint, MemoryLedgerStore};

    fn distributor() -> (Arc<WalletLedger>, CommissionDistributor) {
        let (wallets, distributor, _) =
            distributor_on(Arc::new(MemoryLedgerStore::new()), Arc::new(RecordingNotifier::new()));
        (wallets, distributor)
    }

    fn distributor_on(
        store: Arc<MemoryLedgerStore>,
        notifier: Arc<RecordingNotifier>,
    ) -> (Arc<WalletLedger>, CommissionDistributor, Arc<MemoryLedgerStore>) {
        let shared: Arc<dyn LedgerStore> = store.clone();
        let config = Arc::new(LedgerConfig::default());
        let collaborators = Collaborators::new(
            Arc::new(RecordingActivityLog::new()),
            notifier,
            Arc::new(SimulatedPaymentGateway::new()),
        );
        let wallets = Arc::new(WalletLedger::new(
            shared.clone(),
            config.clone(),
            collaborators.clone(),
        ));
        let distributor = CommissionDistributor::new(shared, config, wallets.clone(), collaborators);
        (wallets, distributor, store)
    }

    #[test]
    fn split_follows_the_rule_table() {
        let config = LedgerConfig::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let same = split_commission(6_000, Some(a), Some(a), &config);
        assert_eq!(
            same,
            vec![CommissionShare {
                ambassador_id: a,
                amount: 6_000,
                percentage_bps: 10_000
            }]
        );

        let both = split_commission(6_000, Some(a), Some(b), &config);
        assert_eq!(both[0].amount, 3_600);
        assert_eq!(both[1].amount, 2_400);
        assert_eq!(both.iter().map(|s| s.amount).sum::<i64>(), 6_000);

        assert_eq!(split_commission(6_000, Some(a), None, &config)[0].amount, 3_600);
        assert_eq!(split_commission(6_000, None, Some(b), &config)[0].amount, 2_400);
        assert!(split_commission(6_000, None, None, &config).is_empty());
    }

    #[test]
    fn odd_commissions_still_sum_exactly() {
        let config = LedgerConfig::default();
        let shares = split_commission(1_001, Some(Uuid::new_v4()), Some(Uuid::new_v4()), &config);
        assert_eq!(shares.iter().map(|s| s.amount).sum::<i64>(), 1_001);
    }

    #[tokio::test]
    async fn same_ambassador_gets_a_single_full_commission() {
        let (_, distributor) = distributor();
        let ambassador = Uuid::new_v4();

        let commissions = distributor
            .distribute_service("svc-1", 6_000, Some(ambassador), Some(ambassador))
            .await
            .unwrap();

        assert_eq!(commissions.len(), 1);
        assert_eq!(commissions[0].amount, 6_000);
        assert_eq!(commissions[0].percentage_bps, 10_000);
        assert_eq!(commissions[0].status, CommissionStatus::Pending);
    }

    #[tokio::test]
    async fn distribution_and_payout_are_idempotent() {
        let (wallets, distributor) = distributor();
        let provider_amb = Uuid::new_v4();
        let requester_amb = Uuid::new_v4();

        let first = distributor
            .distribute_service("svc-2", 6_000, Some(provider_amb), Some(requester_amb))
            .await
            .unwrap();
        let again = distributor
            .distribute_service("svc-2", 6_000, Some(provider_amb), Some(requester_amb))
            .await
            .unwrap();
        assert_eq!(
            first.iter().map(|c| c.id).collect::<Vec<_>>(),
            again.iter().map(|c| c.id).collect::<Vec<_>>()
        );

        let paid = distributor.pay_pending("svc-2").await.unwrap();
        assert_eq!(paid.len(), 2);
        assert!(distributor.pay_pending("svc-2").await.unwrap().is_empty());

        assert_eq!(wallets.get_wallet(provider_amb).await.unwrap().balance, 3_600);
        assert_eq!(wallets.get_wallet(requester_amb).await.unwrap().balance, 2_400);
    }

    #[tokio::test]
    async fn membership_commission_is_paid_immediately() {
        let (wallets, distributor) = distributor();
        let subscriber = Uuid::new_v4();
        let ambassador = Uuid::new_v4();
        distributor
            .set_referrer(subscriber, ambassador, Actor::system())
            .await
            .unwrap();
        distributor
            .set_ambassador_tier(ambassador, AmbassadorTier::Premium, Actor::system())
            .await
            .unwrap();

        let commission = distributor
            .distribute_membership(subscriber, MembershipTier::Business, 10_000, "sub-1")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(commission.amount, 1_250);
        assert_eq!(commission.percentage_bps, 1_250);
        assert_eq!(commission.status, CommissionStatus::Paid);
        assert_eq!(wallets.get_wallet(ambassador).await.unwrap().balance, 1_250);

        let unreferred = distributor
            .distribute_membership(Uuid::new_v4(), MembershipTier::Base, 5_000, "sub-2")
            .await
            .unwrap();
        assert!(unreferred.is_none());
    }

    #[tokio::test]
    async fn self_referral_is_rejected() {
        let (_, distributor) = distributor();
        let account = Uuid::new_v4();
        let err = distributor
            .set_referrer(account, account, Actor::system())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn failed_membership_credit_is_queued_and_repaired() {
        let notifier = Arc::new(RecordingNotifier::new());
        let (wallets, distributor, store) =
            distributor_on(Arc::new(MemoryLedgerStore::new()), notifier.clone());
        let subscriber = Uuid::new_v4();
        let ambassador = Uuid::new_v4();
        distributor
            .set_referrer(subscriber, ambassador, Actor::system())
            .await
            .unwrap();

        store.set_fault(FaultPoint::CommitWallet, true).await;
        let err = distributor
            .distribute_membership(subscriber, MembershipTier::Base, 5_000, "sub-3")
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));

        let queued = store.list_pending_work(Some("sub-3")).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].kind, PendingWorkKind::CommissionPayout);
        let recorded = distributor
            .list(&CommissionFilter {
                source_id: Some("sub-3".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].status, CommissionStatus::Paid);

        store.set_fault(FaultPoint::CommitWallet, false).await;
        // Already marked paid, so nothing new is reported, but the credit lands.
        assert!(distributor.pay_pending("sub-3").await.unwrap().is_empty());
        assert_eq!(
            wallets.get_wallet(ambassador).await.unwrap().balance,
            recorded[0].amount
        );
        assert!(distributor.pay_pending("sub-3").await.unwrap().is_empty());
        assert_eq!(
            wallets.get_wallet(ambassador).await.unwrap().balance,
            recorded[0].amount
        );

        let notices: Vec<_> = notifier
            .sent()
            .into_iter()
            .filter(|n| n.account_id == ambassador)
            .collect();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].account_kind, AccountKind::Ambassador);
    }
}
