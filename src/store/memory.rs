//! In-process ledger store
//!
//! Backs local runs without `DATABASE_URL` and the test suite. It enforces
//! the same version checks and idempotency keys as the PostgreSQL store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{CommissionFilter, LedgerStore, WalletCommit};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AmbassadorTier, Commission, CommissionStatus, LoyaltyBonusRecord, LoyaltyFund,
    LoyaltyFundContribution, LoyaltyPointsEntry, PendingWork, PendingWorkStatus, ServiceRequest,
    TransactionType, Wallet, WalletTransaction, WithdrawalRecord,
};

#[derive(Default)]
struct MemoryState {
    service_requests: HashMap<Uuid, ServiceRequest>,
    wallets: HashMap<Uuid, Wallet>,
    wallet_transactions: HashMap<Uuid, Vec<WalletTransaction>>,
    referrals: HashMap<Uuid, Uuid>,
    ambassador_tiers: HashMap<Uuid, AmbassadorTier>,
    commissions: Vec<Commission>,
    loyalty_points: Vec<LoyaltyPointsEntry>,
    loyalty_fund: LoyaltyFund,
    loyalty_fund_contributions: Vec<LoyaltyFundContribution>,
    bonus_records: Vec<LoyaltyBonusRecord>,
    withdrawals: HashMap<Uuid, WithdrawalRecord>,
    pending_work: Vec<PendingWork>,
    faults: HashSet<FaultPoint>,
}

/// Writes that can be switched into a failing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    CommitWallet,
    UpdateWithdrawal,
}

impl MemoryState {
    fn check(&self, point: FaultPoint) -> LedgerResult<()> {
        if self.faults.contains(&point) {
            return Err(LedgerError::Database(format!("simulated {point:?} failure")));
        }
        Ok(())
    }
}

/// Ledger store held entirely in memory
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<MemoryState>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a wallet record, bypassing version checks. Seeding aid for
    /// tests and fixtures.
    pub async fn put_wallet(&self, wallet: Wallet) {
        let mut state = self.state.lock().await;
        state.wallets.insert(wallet.account_id, wallet);
    }

    pub async fn withdrawal_count(&self) -> usize {
        self.state.lock().await.withdrawals.len()
    }

    /// While `failing`, writes through `point` return a terminal database error.
    pub async fn set_fault(&self, point: FaultPoint, failing: bool) {
        let mut state = self.state.lock().await;
        if failing {
            state.faults.insert(point);
        } else {
            state.faults.remove(&point);
        }
    }
}

fn duplicates_source(existing: &[WalletTransaction], candidate: &WalletTransaction) -> bool {
    candidate.source_id.as_ref().map_or(false, |source| {
        existing.iter().any(|t| {
            t.transaction_type == candidate.transaction_type
                && t.source_id.as_deref() == Some(source.as_str())
        })
    })
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert_service_request(&self, request: &ServiceRequest) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if state.service_requests.contains_key(&request.id) {
            return Err(LedgerError::conflict("service_request", request.id));
        }
        state.service_requests.insert(request.id, request.clone());
        Ok(())
    }

    async fn get_service_request(&self, id: Uuid) -> LedgerResult<Option<ServiceRequest>> {
        let state = self.state.lock().await;
        Ok(state.service_requests.get(&id).cloned())
    }

    async fn update_service_request(
        &self,
        request: &ServiceRequest,
        expected_version: i64,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .service_requests
            .get_mut(&request.id)
            .ok_or_else(|| LedgerError::not_found("service_request", request.id))?;

        if stored.version != expected_version {
            return Err(LedgerError::conflict("service_request", request.id));
        }

        let mut next = request.clone();
        next.version = expected_version + 1;
        *stored = next;
        Ok(())
    }

    async fn get_wallet(&self, account_id: Uuid) -> LedgerResult<Option<Wallet>> {
        let state = self.state.lock().await;
        Ok(state.wallets.get(&account_id).cloned())
    }

    async fn commit_wallet(&self, commit: WalletCommit) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.check(FaultPoint::CommitWallet)?;
        let account_id = commit.wallet.account_id;

        let current_version = state.wallets.get(&account_id).map(|w| w.version);
        if current_version != commit.expected_version {
            return Err(LedgerError::conflict("wallet", account_id));
        }

        {
            let history = state.wallet_transactions.entry(account_id).or_default();
            for (index, transaction) in commit.transactions.iter().enumerate() {
                if duplicates_source(history, transaction)
                    || duplicates_source(&commit.transactions[..index], transaction)
                {
                    return Err(LedgerError::conflict("wallet_transaction", transaction.id));
                }
            }
        }

        let mut wallet = commit.wallet.clone();
        wallet.version = commit.next_version();
        state.wallets.insert(account_id, wallet);
        state
            .wallet_transactions
            .entry(account_id)
            .or_default()
            .extend(commit.transactions);
        if let Some(withdrawal) = commit.withdrawal {
            state.withdrawals.insert(withdrawal.id, withdrawal);
        }
        Ok(())
    }

    async fn find_wallet_transaction(
        &self,
        account_id: Uuid,
        transaction_type: TransactionType,
        source_id: &str,
    ) -> LedgerResult<Option<WalletTransaction>> {
        let state = self.state.lock().await;
        Ok(state.wallet_transactions.get(&account_id).and_then(|history| {
            history
                .iter()
                .find(|t| {
                    t.transaction_type == transaction_type
                        && t.source_id.as_deref() == Some(source_id)
                })
                .cloned()
        }))
    }

    async fn list_wallet_transactions(
        &self,
        account_id: Uuid,
    ) -> LedgerResult<Vec<WalletTransaction>> {
        let state = self.state.lock().await;
        Ok(state
            .wallet_transactions
            .get(&account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn referring_ambassador(&self, account_id: Uuid) -> LedgerResult<Option<Uuid>> {
        let state = self.state.lock().await;
        Ok(state.referrals.get(&account_id).copied())
    }

    async fn set_referring_ambassador(
        &self,
        account_id: Uuid,
        ambassador_id: Uuid,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.referrals.insert(account_id, ambassador_id);
        Ok(())
    }

    async fn ambassador_tier(&self, ambassador_id: Uuid) -> LedgerResult<Option<AmbassadorTier>> {
        let state = self.state.lock().await;
        Ok(state.ambassador_tiers.get(&ambassador_id).copied())
    }

    async fn set_ambassador_tier(
        &self,
        ambassador_id: Uuid,
        tier: AmbassadorTier,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.ambassador_tiers.insert(ambassador_id, tier);
        Ok(())
    }

    async fn insert_commission(&self, commission: &Commission) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let exists = state.commissions.iter().any(|c| {
            c.ambassador_id == commission.ambassador_id
                && c.commission_type == commission.commission_type
                && c.source_id == commission.source_id
        });
        if exists {
            return Ok(false);
        }
        state.commissions.push(commission.clone());
        Ok(true)
    }

    async fn list_commissions(&self, filter: &CommissionFilter) -> LedgerResult<Vec<Commission>> {
        let state = self.state.lock().await;
        Ok(state
            .commissions
            .iter()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    async fn mark_commission_paid(&self, id: Uuid, paid_at: DateTime<Utc>) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let commission = state
            .commissions
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| LedgerError::not_found("commission", id))?;
        commission.status = CommissionStatus::Paid;
        commission.paid_at = Some(paid_at);
        Ok(())
    }

    async fn insert_loyalty_points(&self, entry: &LoyaltyPointsEntry) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        let exists = state
            .loyalty_points
            .iter()
            .any(|p| p.account_id == entry.account_id && p.source_id == entry.source_id);
        if exists {
            return Ok(false);
        }
        state.loyalty_points.push(entry.clone());
        Ok(true)
    }

    async fn loyalty_points_balance(&self, account_id: Uuid) -> LedgerResult<i64> {
        let state = self.state.lock().await;
        Ok(state
            .loyalty_points
            .iter()
            .filter(|p| p.account_id == account_id)
            .map(|p| p.points)
            .sum())
    }

    async fn append_loyalty_fund(
        &self,
        contribution: &LoyaltyFundContribution,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        if state
            .loyalty_fund_contributions
            .iter()
            .any(|c| c.source_id == contribution.source_id)
        {
            return Ok(false);
        }
        state.loyalty_fund_contributions.push(contribution.clone());
        state.loyalty_fund.total_amount += contribution.amount;
        state.loyalty_fund.contributions += 1;
        state.loyalty_fund.updated_at = Some(contribution.created_at);
        Ok(true)
    }

    async fn loyalty_fund(&self) -> LedgerResult<LoyaltyFund> {
        let state = self.state.lock().await;
        Ok(state.loyalty_fund.clone())
    }

    async fn insert_bonus_record(&self, record: &LoyaltyBonusRecord) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.bonus_records.push(record.clone());
        Ok(())
    }

    async fn list_bonus_records(&self, account_id: Uuid) -> LedgerResult<Vec<LoyaltyBonusRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .bonus_records
            .iter()
            .filter(|r| r.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn mark_bonus_granted(&self, id: Uuid, granted_at: DateTime<Utc>) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let record = state
            .bonus_records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| LedgerError::not_found("loyalty_bonus_record", id))?;
        record.granted = true;
        record.granted_at = Some(granted_at);
        Ok(())
    }

    async fn get_withdrawal(&self, id: Uuid) -> LedgerResult<Option<WithdrawalRecord>> {
        let state = self.state.lock().await;
        Ok(state.withdrawals.get(&id).cloned())
    }

    async fn update_withdrawal(&self, record: &WithdrawalRecord) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.check(FaultPoint::UpdateWithdrawal)?;
        match state.withdrawals.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(())
            }
            None => Err(LedgerError::not_found("withdrawal", record.id)),
        }
    }

    async fn enqueue_pending_work(&self, item: &PendingWork) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.pending_work.push(item.clone());
        Ok(())
    }

    async fn open_pending_work(&self, limit: i64) -> LedgerResult<Vec<PendingWork>> {
        let state = self.state.lock().await;
        let mut open: Vec<PendingWork> = state
            .pending_work
            .iter()
            .filter(|w| w.status == PendingWorkStatus::Open)
            .cloned()
            .collect();
        open.sort_by_key(|w| w.created_at);
        open.truncate(limit.max(0) as usize);
        Ok(open)
    }

    async fn update_pending_work(&self, item: &PendingWork) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        match state.pending_work.iter_mut().find(|w| w.id == item.id) {
            Some(stored) => {
                *stored = item.clone();
                Ok(())
            }
            None => Err(LedgerError::not_found("pending_work", item.id)),
        }
    }

    async fn list_pending_work(&self, source_id: Option<&str>) -> LedgerResult<Vec<PendingWork>> {
        let state = self.state.lock().await;
        Ok(state
            .pending_work
            .iter()
            .filter(|w| source_id.map_or(true, |source| w.source_id == source))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transaction(account_id: Uuid, source: &str, amount: i64) -> WalletTransaction {
        WalletTransaction {
            id: Uuid::new_v4(),
            account_id,
            transaction_type: TransactionType::Commission,
            amount,
            description: "test".into(),
            source_id: Some(source.into()),
            balance_before: 0,
            balance_after: amount,
            created_at: Utc::now(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn stale_wallet_version_conflicts() {
        let store = MemoryLedgerStore::new();
        let account = Uuid::new_v4();
        let wallet = Wallet::new(account, 1_000, 1_000);

        store
            .commit_wallet(WalletCommit {
                wallet: wallet.clone(),
                expected_version: None,
                transactions: vec![],
                withdrawal: None,
            })
            .await
            .unwrap();

        // A second create is a conflict, as is a write against version 0.
        let again = store
            .commit_wallet(WalletCommit {
                wallet: wallet.clone(),
                expected_version: None,
                transactions: vec![],
                withdrawal: None,
            })
            .await;
        assert!(matches!(again, Err(LedgerError::StoreConflict { .. })));

        let stale = store
            .commit_wallet(WalletCommit {
                wallet,
                expected_version: Some(0),
                transactions: vec![],
                withdrawal: None,
            })
            .await;
        assert!(matches!(stale, Err(LedgerError::StoreConflict { .. })));
        assert_eq!(store.get_wallet(account).await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn duplicate_source_is_rejected_atomically() {
        let store = MemoryLedgerStore::new();
        let account = Uuid::new_v4();
        let mut wallet = Wallet::new(account, 1_000, 1_000);
        wallet.balance = 100;
        wallet.total_earned = 100;

        store
            .commit_wallet(WalletCommit {
                wallet: wallet.clone(),
                expected_version: None,
                transactions: vec![transaction(account, "src-1", 100)],
                withdrawal: None,
            })
            .await
            .unwrap();

        wallet.balance = 200;
        wallet.total_earned = 200;
        let duplicate = store
            .commit_wallet(WalletCommit {
                wallet,
                expected_version: Some(1),
                transactions: vec![transaction(account, "src-1", 100)],
                withdrawal: None,
            })
            .await;

        assert!(matches!(duplicate, Err(LedgerError::StoreConflict { .. })));
        let stored = store.get_wallet(account).await.unwrap().unwrap();
        assert_eq!(stored.balance, 100);
        assert_eq!(store.list_wallet_transactions(account).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn loyalty_fund_counts_each_source_once() {
        let store = MemoryLedgerStore::new();
        let contribution = LoyaltyFundContribution {
            id: Uuid::new_v4(),
            source_id: "svc-1".into(),
            amount: 600,
            created_at: Utc::now(),
        };

        assert!(store.append_loyalty_fund(&contribution).await.unwrap());
        assert!(!store.append_loyalty_fund(&contribution).await.unwrap());

        let fund = store.loyalty_fund().await.unwrap();
        assert_eq!(fund.total_amount, 600);
        assert_eq!(fund.contributions, 1);
    }
}
