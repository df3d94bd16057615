//! Threshold loyalty bonuses, loyalty points and the global loyalty fund

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::wallet_ledger::{Credit, WalletLedger};
use crate::collaborators::{ActivityEntry, Collaborators};
use crate::config::LedgerConfig;
use crate::error::LedgerResult;
use crate::models::{
    Actor, LoyaltyBonusRecord, LoyaltyFund, PendingBonuses, TransactionType, Wallet,
    WalletTransaction,
};
use crate::money::format_minor;
use crate::store::LedgerStore;

/// A bonus credited by [`LoyaltyBonusEngine::grant_next`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrantedBonus {
    pub record: LoyaltyBonusRecord,
    pub transaction: WalletTransaction,
}

/// Point balance of one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoyaltyPoints {
    pub account_id: Uuid,
    pub points: i64,
}

pub struct LoyaltyBonusEngine {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    wallets: Arc<WalletLedger>,
    collaborators: Collaborators,
}

impl LoyaltyBonusEngine {
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

    /// Pending bonuses as derived from a wallet snapshot.
    pub fn pending_for(&self, wallet: Option<&Wallet>) -> PendingBonuses {
        let amount_per_bonus = self.config.loyalty_bonus_amount;
        let threshold = self.config.loyalty_bonus_threshold;

        let count = match wallet {
            Some(wallet) if threshold > 0 => {
                (wallet.total_spent / threshold - wallet.bonuses_earned).max(0)
            }
            _ => 0,
        };

        PendingBonuses {
            count,
            amount_per_bonus,
            total_pending: count * amount_per_bonus,
        }
    }

    pub async fn pending_bonuses(&self, account_id: Uuid) -> LedgerResult<PendingBonuses> {
        let wallet = self.store.get_wallet(account_id).await?;
        Ok(self.pending_for(wallet.as_ref()))
    }

    /// Grant every pending bonus.
    ///
    /// Each bonus goes through record, credit, mark. The credit is keyed on
    /// the record id, so a run interrupted after the credit only flips the
    /// `granted` flag when it is resumed.
    pub async fn grant_next(&self, account_id: Uuid) -> LedgerResult<Vec<GrantedBonus>> {
        let mut granted = Vec::new();

        loop {
            let wallet = self.store.get_wallet(account_id).await?;
            let pending = self.pending_for(wallet.as_ref());
            let records = self.store.list_bonus_records(account_id).await?;
            let open = records.into_iter().find(|record| !record.granted);

            let record = match (open, wallet) {
                (Some(record), _) => record,
                (None, Some(wallet)) if pending.count > 0 => {
                    let record = LoyaltyBonusRecord {
                        id: Uuid::new_v4(),
                        account_id,
                        bonus_amount: pending.amount_per_bonus,
                        threshold_reached: (wallet.bonuses_earned + 1)
                            * self.config.loyalty_bonus_threshold,
                        total_spent_at_time: wallet.total_spent,
                        granted: false,
                        created_at: Utc::now(),
                        granted_at: None,
                    };
                    self.store.insert_bonus_record(&record).await?;
                    record
                }
                _ => break,
            };

            let source = record.id.to_string();
            let already_credited = self
                .store
                .find_wallet_transaction(account_id, TransactionType::Bonus, &source)
                .await?;

            let transaction = match already_credited {
                Some(transaction) => {
                    tracing::info!(
                        account_id = %account_id,
                        record_id = %record.id,
                        "resuming bonus grant; credit already applied"
                    );
                    transaction
                }
                None if pending.count > 0 => {
                    self.wallets
                        .credit(
                            Credit::new(
                                account_id,
                                record.bonus_amount,
                                TransactionType::Bonus,
                                format!(
                                    "Loyalty bonus for reaching {} in spend",
                                    format_minor(record.threshold_reached)
                                ),
                            )
                            .source(source)
                            .metadata(json!({
                                "threshold_reached": record.threshold_reached,
                                "total_spent_at_time": record.total_spent_at_time,
                            })),
                        )
                        .await?
                }
                // An open record with nothing left to grant waits for the next threshold.
                None => break,
            };

            let granted_at = Utc::now();
            self.store.mark_bonus_granted(record.id, granted_at).await?;

            self.collaborators
                .audit(ActivityEntry::new(
                    Actor::system(),
                    "loyalty_bonus_granted",
                    format!("wallet:{account_id}"),
                    format!("Granted loyalty bonus of {}", format_minor(record.bonus_amount)),
                    json!({
                        "record_id": record.id,
                        "threshold_reached": record.threshold_reached,
                    }),
                ))
                .await;

            granted.push(GrantedBonus {
                record: LoyaltyBonusRecord {
                    granted: true,
                    granted_at: Some(granted_at),
                    ..record
                },
                transaction,
            });
        }

        if !granted.is_empty() {
            tracing::info!(account_id = %account_id, count = granted.len(), "loyalty bonuses granted");
        }
        Ok(granted)
    }

    pub async fn bonus_history(&self, account_id: Uuid) -> LedgerResult<Vec<LoyaltyBonusRecord>> {
        self.store.list_bonus_records(account_id).await
    }

    pub async fn points(&self, account_id: Uuid) -> LedgerResult<LoyaltyPoints> {
        let points = self.store.loyalty_points_balance(account_id).await?;
        Ok(LoyaltyPoints { account_id, points })
    }

    pub async fn fund(&self) -> LedgerResult<LoyaltyFund> {
        self.store.loyalty_fund().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{RecordingActivityLog, RecordingNotifier, SimulatedPaymentGateway};
    use crate::store::MemoryLedgerStore;

    struct Fixture {
        store: Arc<MemoryLedgerStore>,
        wallets: Arc<WalletLedger>,
        engine: LoyaltyBonusEngine,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryLedgerStore::new());
        let config = Arc::new(LedgerConfig::default());
        let collaborators = Collaborators::new(
            Arc::new(RecordingActivityLog::new()),
            Arc::new(RecordingNotifier::new()),
            Arc::new(SimulatedPaymentGateway::new()),
        );
        let wallets = Arc::new(WalletLedger::new(
            store.clone(),
            config.clone(),
            collaborators.clone(),
        ));
        let engine = LoyaltyBonusEngine::new(store.clone(), config, wallets.clone(), collaborators);
        Fixture {
            store,
            wallets,
            engine,
        }
    }

    async fn wallet_with_spend(fixture: &Fixture, account: Uuid, total_spent: i64) {
        fixture
            .wallets
            .credit(Credit::new(account, 1_000_000, TransactionType::Refund, "seed"))
            .await
            .unwrap();
        fixture
            .wallets
            .set_limits(account, Some(10_000_000), None, Actor::system())
            .await
            .unwrap();
        fixture
            .wallets
            .debit(account, total_spent, "spend", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn crossing_the_threshold_grants_one_bonus() {
        let fixture = fixture();
        let account = Uuid::new_v4();
        wallet_with_spend(&fixture, account, 199_900).await;
        assert_eq!(fixture.engine.pending_bonuses(account).await.unwrap().count, 0);

        fixture.wallets.debit(account, 200, "spend", None).await.unwrap();
        let pending = fixture.engine.pending_bonuses(account).await.unwrap();
        assert_eq!(pending.count, 1);
        assert_eq!(pending.total_pending, 2_000);

        let granted = fixture.engine.grant_next(account).await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].record.bonus_amount, 2_000);
        assert_eq!(granted[0].record.threshold_reached, 200_000);

        let wallet = fixture.wallets.get_wallet(account).await.unwrap();
        assert_eq!(wallet.bonuses_earned, 1);
        assert_eq!(wallet.breakdown.earned_from_bonuses, 2_000);

        // Nothing left to grant.
        assert!(fixture.engine.grant_next(account).await.unwrap().is_empty());
        assert_eq!(fixture.engine.pending_bonuses(account).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn several_thresholds_are_granted_in_one_call() {
        let fixture = fixture();
        let account = Uuid::new_v4();
        wallet_with_spend(&fixture, account, 650_000).await;

        let granted = fixture.engine.grant_next(account).await.unwrap();
        assert_eq!(granted.len(), 3);

        let thresholds: Vec<i64> = granted.iter().map(|g| g.record.threshold_reached).collect();
        assert_eq!(thresholds, vec![200_000, 400_000, 600_000]);
        assert_eq!(fixture.wallets.get_wallet(account).await.unwrap().bonuses_earned, 3);
    }

    #[tokio::test]
    async fn interrupted_grant_only_marks_the_record() {
        let fixture = fixture();
        let account = Uuid::new_v4();
        wallet_with_spend(&fixture, account, 200_000).await;

        // Simulate a run that credited but crashed before marking the record.
        let record = LoyaltyBonusRecord {
            id: Uuid::new_v4(),
            account_id: account,
            bonus_amount: 2_000,
            threshold_reached: 200_000,
            total_spent_at_time: 200_000,
            granted: false,
            created_at: Utc::now(),
            granted_at: None,
        };
        fixture.store.insert_bonus_record(&record).await.unwrap();
        fixture
            .wallets
            .credit(
                Credit::new(account, 2_000, TransactionType::Bonus, "bonus")
                    .source(record.id.to_string()),
            )
            .await
            .unwrap();

        let granted = fixture.engine.grant_next(account).await.unwrap();
        assert_eq!(granted.len(), 1);
        assert_eq!(granted[0].record.id, record.id);

        let wallet = fixture.wallets.get_wallet(account).await.unwrap();
        assert_eq!(wallet.bonuses_earned, 1);
        assert_eq!(wallet.breakdown.earned_from_bonuses, 2_000);
        let records = fixture.engine.bonus_history(account).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].granted);
    }

    #[tokio::test]
    async fn missing_wallet_has_nothing_pending() {
        let fixture = fixture();
        let pending = fixture.engine.pending_bonuses(Uuid::new_v4()).await.unwrap();
        assert_eq!(pending.count, 0);
        assert_eq!(pending.amount_per_bonus, 2_000);
    }
}
