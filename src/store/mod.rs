//! Persistence seam for the settlement core
//!
//! The store offers single-record atomic writes with optimistic concurrency:
//! every mutable record carries a `version`, and a write whose expected
//! version is stale fails with [`LedgerError::StoreConflict`]. Callers wrap
//! their read-modify-write bodies in [`with_retry`], which re-runs the body
//! from a fresh read until it commits or the attempt budget is spent.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AmbassadorTier, Commission, CommissionStatus, CommissionType, LoyaltyBonusRecord,
    LoyaltyFund, LoyaltyFundContribution, LoyaltyPointsEntry, PendingWork, ServiceRequest,
    TransactionType, Wallet, WalletTransaction, WithdrawalRecord,
};

mod memory;
mod postgres;

pub use memory::{FaultPoint, MemoryLedgerStore};
pub use postgres::PgLedgerStore;

/// Atomic write of one wallet record and everything that hangs off it.
#[derive(Debug, Clone)]
pub struct WalletCommit {
    /// New wallet state. Its `version` field is ignored; the store assigns it.
    pub wallet: Wallet,
    /// `None` creates the wallet, `Some(v)` requires the stored version to be `v`.
    pub expected_version: Option<i64>,
    pub transactions: Vec<WalletTransaction>,
    pub withdrawal: Option<WithdrawalRecord>,
}

impl WalletCommit {
    /// Version the wallet will have after this commit lands.
    pub fn next_version(&self) -> i64 {
        self.expected_version.map_or(1, |version| version + 1)
    }
}

/// Commission query filter
#[derive(Debug, Clone, Default)]
pub struct CommissionFilter {
    pub ambassador_id: Option<Uuid>,
    pub source_id: Option<String>,
    pub commission_type: Option<CommissionType>,
    pub status: Option<CommissionStatus>,
}

impl CommissionFilter {
    pub fn matches(&self, commission: &Commission) -> bool {
        self.ambassador_id
            .map_or(true, |id| commission.ambassador_id == id)
            && self
                .source_id
                .as_deref()
                .map_or(true, |source| commission.source_id == source)
            && self
                .commission_type
                .map_or(true, |kind| commission.commission_type == kind)
            && self.status.map_or(true, |status| commission.status == status)
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ----- service requests -----

    async fn insert_service_request(&self, request: &ServiceRequest) -> LedgerResult<()>;

    async fn get_service_request(&self, id: Uuid) -> LedgerResult<Option<ServiceRequest>>;

    /// Compare-and-swap write. The stored version becomes `expected_version + 1`.
    async fn update_service_request(
        &self,
        request: &ServiceRequest,
        expected_version: i64,
    ) -> LedgerResult<()>;

    // ----- wallets -----

    async fn get_wallet(&self, account_id: Uuid) -> LedgerResult<Option<Wallet>>;

    /// Writes the wallet, its new transactions and an optional withdrawal as
    /// one unit. Fails with `StoreConflict` on a stale version or when a
    /// transaction duplicates an existing `(account, type, source_id)`.
    async fn commit_wallet(&self, commit: WalletCommit) -> LedgerResult<()>;

    async fn find_wallet_transaction(
        &self,
        account_id: Uuid,
        transaction_type: TransactionType,
        source_id: &str,
    ) -> LedgerResult<Option<WalletTransaction>>;

    /// Transactions in the order they were committed.
    async fn list_wallet_transactions(&self, account_id: Uuid)
        -> LedgerResult<Vec<WalletTransaction>>;

    // ----- referrals -----

    async fn referring_ambassador(&self, account_id: Uuid) -> LedgerResult<Option<Uuid>>;

    async fn set_referring_ambassador(&self, account_id: Uuid, ambassador_id: Uuid)
        -> LedgerResult<()>;

    async fn ambassador_tier(&self, ambassador_id: Uuid) -> LedgerResult<Option<AmbassadorTier>>;

    async fn set_ambassador_tier(&self, ambassador_id: Uuid, tier: AmbassadorTier)
        -> LedgerResult<()>;

    // ----- commissions -----

    /// Returns `false` when a commission with the same
    /// `(ambassador, type, source_id)` already exists.
    async fn insert_commission(&self, commission: &Commission) -> LedgerResult<bool>;

    async fn list_commissions(&self, filter: &CommissionFilter) -> LedgerResult<Vec<Commission>>;

    async fn mark_commission_paid(&self, id: Uuid, paid_at: DateTime<Utc>) -> LedgerResult<()>;

    // ----- loyalty -----

    /// Returns `false` when points were already accrued for `(account, source_id)`.
    async fn insert_loyalty_points(&self, entry: &LoyaltyPointsEntry) -> LedgerResult<bool>;

    async fn loyalty_points_balance(&self, account_id: Uuid) -> LedgerResult<i64>;

    /// Appends a contribution and bumps the running total in one unit.
    /// Returns `false` when the source already contributed.
    async fn append_loyalty_fund(&self, contribution: &LoyaltyFundContribution)
        -> LedgerResult<bool>;

    async fn loyalty_fund(&self) -> LedgerResult<LoyaltyFund>;

    async fn insert_bonus_record(&self, record: &LoyaltyBonusRecord) -> LedgerResult<()>;

    async fn list_bonus_records(&self, account_id: Uuid) -> LedgerResult<Vec<LoyaltyBonusRecord>>;

    async fn mark_bonus_granted(&self, id: Uuid, granted_at: DateTime<Utc>) -> LedgerResult<()>;

    // ----- withdrawals -----

    async fn get_withdrawal(&self, id: Uuid) -> LedgerResult<Option<WithdrawalRecord>>;

    async fn update_withdrawal(&self, record: &WithdrawalRecord) -> LedgerResult<()>;

    // ----- reconciliation queue -----

    async fn enqueue_pending_work(&self, item: &PendingWork) -> LedgerResult<()>;

    /// Oldest open items first.
    async fn open_pending_work(&self, limit: i64) -> LedgerResult<Vec<PendingWork>>;

    async fn update_pending_work(&self, item: &PendingWork) -> LedgerResult<()>;

    async fn list_pending_work(&self, source_id: Option<&str>) -> LedgerResult<Vec<PendingWork>>;
}

/// Re-run `body` while it fails with a retryable conflict.
///
/// After `max_attempts` conflicting runs the last conflict is surfaced as
/// [`LedgerError::Unavailable`].
pub async fn with_retry<T, F, Fut>(max_attempts: u32, mut body: F) -> LedgerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = LedgerResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;
        match body().await {
            Err(err) if err.is_retryable() => {
                if attempt >= max_attempts {
                    tracing::warn!(attempt, error = %err, "giving up after repeated store conflicts");
                    return Err(LedgerError::Unavailable {
                        attempts: attempt,
                        reason: err.to_string(),
                    });
                }

                let backoff_ms = rand::thread_rng().gen_range(1..=5 * u64::from(attempt));
                tracing::debug!(attempt, backoff_ms, error = %err, "store conflict, retrying");
                sleep(Duration::from_millis(backoff_ms)).await;
            }
            other => return other,
        }
    }
}
