//! Wallet ledger: atomic credits and debits against one wallet record

use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::collaborators::{AccountKind, ActivityEntry, Collaborators, Notification};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{Actor, TransactionType, Wallet, WalletTransaction, WithdrawalRecord};
use crate::money::format_minor;
use crate::store::{with_retry, LedgerStore, WalletCommit};

/// A credit to apply to a wallet
#[derive(Debug, Clone)]
pub struct Credit {
    pub account_id: Uuid,
    pub amount: i64,
    pub transaction_type: TransactionType,
    pub description: String,
    /// Idempotency key. A second credit with the same type and source
    /// returns the first transaction.
    pub source_id: Option<String>,
    pub metadata: Value,
}

impl Credit {
    pub fn new(
        account_id: Uuid,
        amount: i64,
        transaction_type: TransactionType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            account_id,
            amount,
            transaction_type,
            description: description.into(),
            source_id: None,
            metadata: json!({}),
        }
    }

    pub fn source(mut self, source_id: impl Into<String>) -> Self {
        self.source_id = Some(source_id.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of replaying a wallet's history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletVerification {
    pub account_id: Uuid,
    pub balance: i64,
    pub replayed_balance: i64,
    pub transaction_count: usize,
    pub balance_matches_totals: bool,
    pub history_consistent: bool,
    /// First transaction whose balances do not chain onto its predecessor.
    pub first_broken_transaction: Option<Uuid>,
}

impl WalletVerification {
    pub fn is_consistent(&self) -> bool {
        self.balance_matches_totals && self.history_consistent
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn ledger_entry(
    wallet: &Wallet,
    balance_before: i64,
    transaction_type: TransactionType,
    amount: i64,
    description: &str,
    source_id: Option<String>,
    metadata: Value,
) -> WalletTransaction {
    WalletTransaction {
        id: Uuid::new_v4(),
        account_id: wallet.account_id,
        transaction_type,
        amount,
        description: description.to_string(),
        source_id,
        balance_before,
        balance_after: balance_before + transaction_type.signed(amount),
        created_at: Utc::now(),
        metadata,
    }
}

/// Owns every balance mutation
pub struct WalletLedger {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    collaborators: Collaborators,
}

impl WalletLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        config: Arc<LedgerConfig>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            store,
            config,
            collaborators,
        }
    }

    /// Credit a wallet, creating it on first use.
    pub async fn credit(&self, credit: Credit) -> LedgerResult<WalletTransaction> {
        if credit.amount <= 0 {
            let err = LedgerError::InvalidAmount(credit.amount);
            self.audit_failure("wallet_credit", credit.account_id, credit.amount, &err)
                .await;
            return Err(err);
        }
        if !credit.transaction_type.is_credit() {
            return Err(LedgerError::InvalidRequest(format!(
                "{} is not a credit type",
                credit.transaction_type.as_str()
            )));
        }

        let request = &credit;
        let result = with_retry(self.config.store_max_retries, move || {
            self.try_credit(request)
        })
        .await;

        match result {
            Ok((transaction, true)) => {
                tracing::info!(
                    account_id = %credit.account_id,
                    amount = credit.amount,
                    kind = credit.transaction_type.as_str(),
                    source_id = ?credit.source_id,
                    balance_after = transaction.balance_after,
                    "wallet credited"
                );
                self.audit_transaction("wallet_credit", &transaction).await;
                // Ambassadors hear about commissions from the distributor.
                if credit.transaction_type != TransactionType::Commission {
                    self.collaborators
                        .notify(Notification {
                            account_id: credit.account_id,
                            account_kind: AccountKind::User,
                            title: credit_title(credit.transaction_type).to_string(),
                            body: format!(
                                "{} was added to your wallet.",
                                format_minor(credit.amount)
                            ),
                            data: json!({
                                "transaction_id": transaction.id,
                                "type": credit.transaction_type,
                            }),
                        })
                        .await;
                }
                Ok(transaction)
            }
            Ok((transaction, false)) => {
                tracing::debug!(
                    account_id = %credit.account_id,
                    source_id = ?credit.source_id,
                    "credit already applied"
                );
                Ok(transaction)
            }
            Err(err) => {
                self.audit_failure("wallet_credit", credit.account_id, credit.amount, &err)
                    .await;
                Err(err)
            }
        }
    }

    /// Debit a wallet for an in-app payment.
    pub async fn debit(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
        source_id: Option<&str>,
    ) -> LedgerResult<WalletTransaction> {
        if amount <= 0 {
            let err = LedgerError::InvalidAmount(amount);
            self.audit_failure("wallet_debit", account_id, amount, &err).await;
            return Err(err);
        }

        let result = with_retry(self.config.store_max_retries, move || {
            self.try_debit(account_id, amount, description, source_id)
        })
        .await;

        match result {
            Ok((transaction, true)) => {
                tracing::info!(
                    account_id = %account_id,
                    amount,
                    source_id = ?source_id,
                    balance_after = transaction.balance_after,
                    "wallet debited"
                );
                self.audit_transaction("wallet_debit", &transaction).await;
                Ok(transaction)
            }
            Ok((transaction, false)) => Ok(transaction),
            Err(err) => {
                tracing::warn!(account_id = %account_id, amount, error = %err, "wallet debit rejected");
                self.audit_failure("wallet_debit", account_id, amount, &err).await;
                Err(err)
            }
        }
    }

    /// Deduct `total_deducted` for a withdrawal and persist the record, all
    /// in one wallet commit.
    pub(crate) async fn debit_for_withdrawal(
        &self,
        record: &WithdrawalRecord,
    ) -> LedgerResult<Vec<WalletTransaction>> {
        if record.amount <= 0 {
            return Err(LedgerError::InvalidAmount(record.amount));
        }

        let result = with_retry(self.config.store_max_retries, move || {
            self.try_withdrawal_debit(record)
        })
        .await;

        match result {
            Ok(transactions) => {
                for transaction in &transactions {
                    self.audit_transaction("wallet_withdrawal", transaction).await;
                }
                Ok(transactions)
            }
            Err(err) => {
                self.audit_failure("wallet_withdrawal", record.account_id, record.total_deducted, &err)
                    .await;
                Err(err)
            }
        }
    }

    pub async fn get_wallet(&self, account_id: Uuid) -> LedgerResult<Wallet> {
        self.store
            .get_wallet(account_id)
            .await?
            .ok_or_else(|| LedgerError::not_found("wallet", account_id))
    }

    /// Transactions in commit order.
    pub async fn statement(&self, account_id: Uuid) -> LedgerResult<Vec<WalletTransaction>> {
        self.store.list_wallet_transactions(account_id).await
    }

    pub async fn set_limits(
        &self,
        account_id: Uuid,
        daily_spending_limit: Option<i64>,
        withdrawal_limit: Option<i64>,
        actor: Actor,
    ) -> LedgerResult<Wallet> {
        for limit in [daily_spending_limit, withdrawal_limit].into_iter().flatten() {
            if limit < 0 {
                return Err(LedgerError::InvalidAmount(limit));
            }
        }

        let mutate = move |wallet: &mut Wallet| -> LedgerResult<()> {
            if let Some(limit) = daily_spending_limit {
                wallet.limits.daily_spending_limit = limit;
            }
            if let Some(limit) = withdrawal_limit {
                wallet.limits.withdrawal_limit = limit;
            }
            Ok(())
        };
        let mutate = &mutate;
        let wallet = with_retry(self.config.store_max_retries, move || {
            self.try_update(account_id, mutate)
        })
        .await?;

        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "wallet_limits_updated",
                format!("wallet:{account_id}"),
                "Wallet limits updated",
                json!({
                    "daily_spending_limit": wallet.limits.daily_spending_limit,
                    "withdrawal_limit": wallet.limits.withdrawal_limit,
                }),
            ))
            .await;
        Ok(wallet)
    }

    /// Hold part of the balance back from spending and withdrawal.
    pub async fn block_funds(
        &self,
        account_id: Uuid,
        amount: i64,
        reason: &str,
        actor: Actor,
    ) -> LedgerResult<Wallet> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mutate = move |wallet: &mut Wallet| -> LedgerResult<()> {
            let available = wallet.available();
            if available < amount {
                return Err(LedgerError::InsufficientFunds {
                    requested: amount,
                    available,
                });
            }
            wallet.limits.blocked_balance += amount;
            Ok(())
        };
        let mutate = &mutate;
        let result = with_retry(self.config.store_max_retries, move || {
            self.try_update(account_id, mutate)
        })
        .await;

        match result {
            Ok(wallet) => {
                self.collaborators
                    .audit(ActivityEntry::new(
                        actor,
                        "wallet_funds_blocked",
                        format!("wallet:{account_id}"),
                        format!("Blocked {}: {reason}", format_minor(amount)),
                        json!({ "amount": amount, "blocked_balance": wallet.limits.blocked_balance }),
                    ))
                    .await;
                Ok(wallet)
            }
            Err(err) => {
                self.audit_failure("wallet_funds_blocked", account_id, amount, &err)
                    .await;
                Err(err)
            }
        }
    }

    pub async fn release_blocked_funds(
        &self,
        account_id: Uuid,
        amount: i64,
        actor: Actor,
    ) -> LedgerResult<Wallet> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let mutate = move |wallet: &mut Wallet| -> LedgerResult<()> {
            if wallet.limits.blocked_balance < amount {
                return Err(LedgerError::InvalidRequest(format!(
                    "only {} is blocked",
                    format_minor(wallet.limits.blocked_balance)
                )));
            }
            wallet.limits.blocked_balance -= amount;
            Ok(())
        };
        let mutate = &mutate;
        let wallet = with_retry(self.config.store_max_retries, move || {
            self.try_update(account_id, mutate)
        })
        .await?;

        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "wallet_funds_released",
                format!("wallet:{account_id}"),
                format!("Released {} of blocked funds", format_minor(amount)),
                json!({ "amount": amount, "blocked_balance": wallet.limits.blocked_balance }),
            ))
            .await;
        Ok(wallet)
    }

    /// Replay the transaction history and check both wallet invariants.
    pub async fn verify_wallet(&self, account_id: Uuid) -> LedgerResult<WalletVerification> {
        let wallet = self.get_wallet(account_id).await?;
        let transactions = self.store.list_wallet_transactions(account_id).await?;

        let mut running = 0i64;
        let mut first_broken = None;
        for transaction in &transactions {
            let chained = transaction.balance_before == running
                && transaction.balance_after == running + transaction.signed_amount();
            if !chained && first_broken.is_none() {
                first_broken = Some(transaction.id);
            }
            running = transaction.balance_after;
        }
        let replayed_balance: i64 = transactions.iter().map(|t| t.signed_amount()).sum();

        let verification = WalletVerification {
            account_id,
            balance: wallet.balance,
            replayed_balance,
            transaction_count: transactions.len(),
            balance_matches_totals: wallet.balance_consistent(),
            history_consistent: first_broken.is_none() && replayed_balance == wallet.balance,
            first_broken_transaction: first_broken,
        };

        if !verification.is_consistent() {
            tracing::error!(
                account_id = %account_id,
                balance = wallet.balance,
                replayed_balance,
                "wallet failed verification"
            );
        }
        Ok(verification)
    }

    // ===== Private Helper Methods =====

    async fn load_or_new(&self, account_id: Uuid) -> LedgerResult<(Wallet, Option<i64>)> {
        Ok(match self.store.get_wallet(account_id).await? {
            Some(wallet) => {
                let version = wallet.version;
                (wallet, Some(version))
            }
            None => (
                Wallet::new(
                    account_id,
                    self.config.default_daily_spending_limit,
                    self.config.default_withdrawal_limit,
                ),
                None,
            ),
        })
    }

    async fn existing(
        &self,
        account_id: Uuid,
        transaction_type: TransactionType,
        source_id: Option<&str>,
    ) -> LedgerResult<Option<WalletTransaction>> {
        match source_id {
            Some(source) => {
                self.store
                    .find_wallet_transaction(account_id, transaction_type, source)
                    .await
            }
            None => Ok(None),
        }
    }

    /// Returns the transaction and whether this call created it.
    async fn try_credit(&self, credit: &Credit) -> LedgerResult<(WalletTransaction, bool)> {
        if let Some(existing) = self
            .existing(
                credit.account_id,
                credit.transaction_type,
                credit.source_id.as_deref(),
            )
            .await?
        {
            return Ok((existing, false));
        }

        let (mut wallet, expected_version) = self.load_or_new(credit.account_id).await?;
        let balance_before = wallet.balance;

        match credit.transaction_type {
            TransactionType::Commission => {
                wallet.breakdown.earned_from_commissions += credit.amount;
            }
            TransactionType::Refund => {
                wallet.breakdown.earned_from_refunds += credit.amount;
            }
            TransactionType::Bonus => {
                let threshold = self.config.loyalty_bonus_threshold;
                let deserved = if threshold > 0 {
                    wallet.total_spent / threshold
                } else {
                    0
                };
                if deserved <= wallet.bonuses_earned {
                    return Err(LedgerError::InvalidRequest(
                        "no loyalty bonus is pending for this wallet".to_string(),
                    ));
                }
                wallet.breakdown.earned_from_bonuses += credit.amount;
                wallet.bonuses_earned += 1;
            }
            other => {
                return Err(LedgerError::InvalidRequest(format!(
                    "{} is not a credit type",
                    other.as_str()
                )))
            }
        }

        wallet.balance += credit.amount;
        wallet.total_earned += credit.amount;
        wallet.updated_at = Utc::now();

        let transaction = ledger_entry(
            &wallet,
            balance_before,
            credit.transaction_type,
            credit.amount,
            &credit.description,
            credit.source_id.clone(),
            credit.metadata.clone(),
        );

        self.store
            .commit_wallet(WalletCommit {
                wallet,
                expected_version,
                transactions: vec![transaction.clone()],
                withdrawal: None,
            })
            .await?;

        Ok((transaction, true))
    }

    async fn try_debit(
        &self,
        account_id: Uuid,
        amount: i64,
        description: &str,
        source_id: Option<&str>,
    ) -> LedgerResult<(WalletTransaction, bool)> {
        if let Some(existing) = self
            .existing(account_id, TransactionType::Payment, source_id)
            .await?
        {
            return Ok((existing, false));
        }

        let mut wallet = self.store.get_wallet(account_id).await?.ok_or(
            LedgerError::InsufficientFunds {
                requested: amount,
                available: 0,
            },
        )?;
        let expected_version = wallet.version;

        let available = wallet.available();
        if available < amount {
            return Err(LedgerError::InsufficientFunds {
                requested: amount,
                available,
            });
        }

        let today = today();
        let spent_today = wallet.spent_on(today);
        if spent_today + amount > wallet.limits.daily_spending_limit {
            return Err(LedgerError::DailyLimitExceeded {
                spent_today,
                limit: wallet.limits.daily_spending_limit,
                requested: amount,
            });
        }

        let balance_before = wallet.balance;
        wallet.balance -= amount;
        wallet.total_spent += amount;
        wallet.limits.daily_spent_today = spent_today + amount;
        wallet.limits.last_spending_date = Some(today);
        wallet.updated_at = Utc::now();

        let transaction = ledger_entry(
            &wallet,
            balance_before,
            TransactionType::Payment,
            amount,
            description,
            source_id.map(str::to_string),
            json!({}),
        );

        self.store
            .commit_wallet(WalletCommit {
                wallet,
                expected_version: Some(expected_version),
                transactions: vec![transaction.clone()],
                withdrawal: None,
            })
            .await?;

        Ok((transaction, true))
    }

    async fn try_withdrawal_debit(
        &self,
        record: &WithdrawalRecord,
    ) -> LedgerResult<Vec<WalletTransaction>> {
        let mut wallet = self.store.get_wallet(record.account_id).await?.ok_or(
            LedgerError::InsufficientFunds {
                requested: record.total_deducted,
                available: 0,
            },
        )?;
        let expected_version = wallet.version;

        let available = wallet.available();
        if available < record.total_deducted {
            return Err(LedgerError::InsufficientFunds {
                requested: record.total_deducted,
                available,
            });
        }
        if record.amount > wallet.limits.withdrawal_limit {
            return Err(LedgerError::WithdrawalLimitExceeded {
                requested: record.amount,
                limit: wallet.limits.withdrawal_limit,
            });
        }

        let source = record.id.to_string();
        let metadata = json!({ "withdrawal_id": record.id, "country": record.bank_details.country });
        let mut transactions = vec![ledger_entry(
            &wallet,
            wallet.balance,
            TransactionType::Withdrawal,
            record.amount,
            "Withdrawal to bank account",
            Some(source.clone()),
            metadata.clone(),
        )];
        if record.fee > 0 {
            let after_amount = transactions[0].balance_after;
            transactions.push(ledger_entry(
                &wallet,
                after_amount,
                TransactionType::WithdrawalFee,
                record.fee,
                "Withdrawal transfer fee",
                Some(source),
                metadata,
            ));
        }

        wallet.balance -= record.total_deducted;
        wallet.total_withdrawn += record.total_deducted;
        wallet.updated_at = Utc::now();

        self.store
            .commit_wallet(WalletCommit {
                wallet,
                expected_version: Some(expected_version),
                transactions: transactions.clone(),
                withdrawal: Some(record.clone()),
            })
            .await?;

        Ok(transactions)
    }

    async fn try_update<F>(&self, account_id: Uuid, mutate: &F) -> LedgerResult<Wallet>
    where
        F: Fn(&mut Wallet) -> LedgerResult<()> + Sync,
    {
        let (mut wallet, expected_version) = self.load_or_new(account_id).await?;
        mutate(&mut wallet)?;
        wallet.updated_at = Utc::now();

        let commit = WalletCommit {
            wallet: wallet.clone(),
            expected_version,
            transactions: vec![],
            withdrawal: None,
        };
        wallet.version = commit.next_version();
        self.store.commit_wallet(commit).await?;
        Ok(wallet)
    }

    async fn audit_transaction(&self, action: &str, transaction: &WalletTransaction) {
        self.collaborators
            .audit(ActivityEntry::new(
                Actor::system(),
                action,
                format!("wallet:{}", transaction.account_id),
                transaction.description.clone(),
                json!({
                    "transaction_id": transaction.id,
                    "type": transaction.transaction_type,
                    "amount": transaction.amount,
                    "source_id": transaction.source_id,
                    "balance_before": transaction.balance_before,
                    "balance_after": transaction.balance_after,
                }),
            ))
            .await;
    }

    async fn audit_failure(&self, action: &str, account_id: Uuid, amount: i64, err: &LedgerError) {
        self.collaborators
            .audit(ActivityEntry::new(
                Actor::system(),
                format!("{action}_failed"),
                format!("wallet:{account_id}"),
                err.to_string(),
                json!({ "error": err.code(), "amount": amount }),
            ))
            .await;
    }
}

fn credit_title(transaction_type: TransactionType) -> &'static str {
    match transaction_type {
        TransactionType::Bonus => "Loyalty bonus unlocked",
        TransactionType::Refund => "Refund received",
        _ => "Wallet updated",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordingActivityLog, RecordingNotifier, SimulatedPaymentGateway};
    use crate::models::{BankDetails, WithdrawalStatus};
    use crate::store::MemoryLedgerStore;

    fn ledger() -> (Arc<MemoryLedgerStore>, Arc<RecordingActivityLog>, WalletLedger) {
        let store = Arc::new(MemoryLedgerStore::new());
        let activity = Arc::new(RecordingActivityLog::new());
        let collaborators = Collaborators::new(
            activity.clone(),
            Arc::new(RecordingNotifier::new()),
            Arc::new(SimulatedPaymentGateway::new()),
        );
        let ledger = WalletLedger::new(
            store.clone(),
            Arc::new(LedgerConfig::default()),
            collaborators,
        );
        (store, activity, ledger)
    }

    async fn funded(ledger: &WalletLedger, account: Uuid, amount: i64) {
        ledger
            .credit(Credit::new(account, amount, TransactionType::Refund, "seed"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn credit_creates_wallet_and_chains_balances() {
        let (_, _, ledger) = ledger();
        let account = Uuid::new_v4();

        let first = ledger
            .credit(Credit::new(account, 1_500, TransactionType::Commission, "commission"))
            .await
            .unwrap();
        let second = ledger
            .credit(Credit::new(account, 500, TransactionType::Refund, "refund"))
            .await
            .unwrap();

        assert_eq!((first.balance_before, first.balance_after), (0, 1_500));
        assert_eq!((second.balance_before, second.balance_after), (1_500, 2_000));

        let wallet = ledger.get_wallet(account).await.unwrap();
        assert_eq!(wallet.balance, 2_000);
        assert_eq!(wallet.total_earned, 2_000);
        assert_eq!(wallet.breakdown.earned_from_commissions, 1_500);
        assert_eq!(wallet.breakdown.earned_from_refunds, 500);
        assert!(wallet.balance_consistent());
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected_and_logged() {
        let (_, activity, ledger) = ledger();
        let account = Uuid::new_v4();

        let err = ledger
            .credit(Credit::new(account, 0, TransactionType::Bonus, "nothing"))
            .await
            .unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount(0));

        let err = ledger.debit(account, -5, "negative", None).await.unwrap_err();
        assert_eq!(err, LedgerError::InvalidAmount(-5));
        assert!(activity.actions().contains(&"wallet_debit_failed".to_string()));
    }

    #[tokio::test]
    async fn credit_with_source_is_applied_once() {
        let (_, _, ledger) = ledger();
        let account = Uuid::new_v4();
        let credit = Credit::new(account, 700, TransactionType::Commission, "commission")
            .source("commission-1");

        let first = ledger.credit(credit.clone()).await.unwrap();
        let replay = ledger.credit(credit).await.unwrap();

        assert_eq!(first.id, replay.id);
        assert_eq!(ledger.get_wallet(account).await.unwrap().balance, 700);
        assert_eq!(ledger.statement(account).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn debit_respects_blocked_balance() {
        let (_, _, ledger) = ledger();
        let account = Uuid::new_v4();
        funded(&ledger, account, 10_000).await;
        ledger
            .block_funds(account, 7_000, "dispute", Actor::system())
            .await
            .unwrap();

        let err = ledger.debit(account, 4_000, "booking", None).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::InsufficientFunds {
                requested: 4_000,
                available: 3_000
            }
        );

        ledger
            .release_blocked_funds(account, 7_000, Actor::system())
            .await
            .unwrap();
        let transaction = ledger.debit(account, 4_000, "booking", None).await.unwrap();
        assert_eq!(transaction.balance_after, 6_000);
    }

    #[tokio::test]
    async fn daily_limit_applies_within_a_day() {
        let (_, _, ledger) = ledger();
        let account = Uuid::new_v4();
        funded(&ledger, account, 10_000).await;
        ledger
            .set_limits(account, Some(5_000), None, Actor::system())
            .await
            .unwrap();

        ledger.debit(account, 3_000, "first", None).await.unwrap();
        let err = ledger.debit(account, 2_500, "second", None).await.unwrap_err();
        assert_eq!(
            err,
            LedgerError::DailyLimitExceeded {
                spent_today: 3_000,
                limit: 5_000,
                requested: 2_500
            }
        );
    }

    #[tokio::test]
    async fn daily_spend_resets_on_a_new_day() {
        let (store, _, ledger) = ledger();
        let account = Uuid::new_v4();
        funded(&ledger, account, 10_000).await;

        let mut wallet = ledger.get_wallet(account).await.unwrap();
        wallet.limits.daily_spending_limit = 5_000;
        wallet.limits.daily_spent_today = 4_900;
        wallet.limits.last_spending_date = NaiveDate::from_ymd_opt(2020, 1, 1);
        store.put_wallet(wallet).await;

        ledger.debit(account, 4_000, "fresh day", None).await.unwrap();
        let wallet = ledger.get_wallet(account).await.unwrap();
        assert_eq!(wallet.limits.daily_spent_today, 4_000);
        assert_eq!(wallet.limits.last_spending_date, Some(today()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_debits_never_overdraw() {
        let (_, _, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let account = Uuid::new_v4();
        funded(&ledger, account, 100).await;

        let first = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.debit(account, 60, "race a", None).await })
        };
        let second = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.debit(account, 60, "race b", None).await })
        };
        let outcomes = [first.await.unwrap(), second.await.unwrap()];

        let succeeded = outcomes.iter().filter(|o| o.is_ok()).count();
        assert_eq!(succeeded, 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Err(LedgerError::InsufficientFunds { .. }))));

        let wallet = ledger.get_wallet(account).await.unwrap();
        assert_eq!(wallet.balance, 40);
        assert!(ledger.verify_wallet(account).await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn withdrawal_debit_writes_amount_and_fee() {
        let (store, _, ledger) = ledger();
        let account = Uuid::new_v4();
        funded(&ledger, account, 20_000).await;

        let now = Utc::now();
        let record = WithdrawalRecord {
            id: Uuid::new_v4(),
            account_id: account,
            amount: 10_000,
            fee: 350,
            total_deducted: 10_350,
            bank_details: BankDetails {
                account_holder: "Ana".into(),
                account_number: "0001".into(),
                bank_code: "002".into(),
                country: "MX".into(),
            },
            status: WithdrawalStatus::Processing,
            external_reference: None,
            failure_reason: None,
            refunded: false,
            created_at: now,
            updated_at: now,
        };

        let transactions = ledger.debit_for_withdrawal(&record).await.unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].balance_after, 10_000);
        assert_eq!(transactions[1].balance_after, 9_650);

        let wallet = ledger.get_wallet(account).await.unwrap();
        assert_eq!(wallet.total_withdrawn, 10_350);
        assert!(store.get_withdrawal(record.id).await.unwrap().is_some());

        let verification = ledger.verify_wallet(account).await.unwrap();
        assert!(verification.is_consistent());
        assert_eq!(verification.transaction_count, 3);
    }

    #[tokio::test]
    async fn bonus_credit_requires_a_crossed_threshold() {
        let (_, _, ledger) = ledger();
        let account = Uuid::new_v4();
        funded(&ledger, account, 1_000).await;

        let err = ledger
            .credit(Credit::new(account, 2_000, TransactionType::Bonus, "bonus"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidRequest(_)));
    }
}
