//! Wallet withdrawals to external bank accounts

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
    Actor, ActorRole, BankDetails, PendingWork, PendingWorkKind, PendingWorkStatus, TransactionType,
    WithdrawalQuote, WithdrawalRecord, WithdrawalStatus,
};
use crate::money::format_minor;
use crate::store::LedgerStore;

/// Either a fee quote (nothing was written) or the submitted withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "withdrawal", rename_all = "snake_case")]
pub enum WithdrawalOutcome {
    Quote(WithdrawalQuote),
    Submitted(WithdrawalRecord),
}

pub struct WithdrawalProcessor {
    store: Arc<dyn LedgerStore>,
    config: Arc<LedgerConfig>,
    wallets: Arc<WalletLedger>,
    collaborators: Collaborators,
}

impl WithdrawalProcessor {
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

    pub fn quote(&self, amount: i64, country: &str) -> LedgerResult<WithdrawalQuote> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let fee = self.config.withdrawal_fees.rule_for(country).fee_for(amount);
        Ok(WithdrawalQuote {
            amount,
            fee,
            total_deducted: amount + fee,
        })
    }

    /// Withdraw `amount` to `bank_details`.
    ///
    /// Without `accept_fee` this only quotes. A failed transfer leaves the
    /// debit in place and opens a manual review item; the money comes back
    /// through [`WithdrawalProcessor::refund_failed_withdrawal`].
    pub async fn withdraw(
        &self,
        account_id: Uuid,
        amount: i64,
        bank_details: BankDetails,
        accept_fee: bool,
    ) -> LedgerResult<WithdrawalOutcome> {
        let quote = self.quote(amount, &bank_details.country)?;
        if !accept_fee {
            return Ok(WithdrawalOutcome::Quote(quote));
        }

        let now = Utc::now();
        let mut record = WithdrawalRecord {
            id: Uuid::new_v4(),
            account_id,
            amount: quote.amount,
            fee: quote.fee,
            total_deducted: quote.total_deducted,
            bank_details,
            status: WithdrawalStatus::Processing,
            external_reference: None,
            failure_reason: None,
            refunded: false,
            created_at: now,
            updated_at: now,
        };

        self.wallets.debit_for_withdrawal(&record).await?;
        tracing::info!(
            account_id = %account_id,
            withdrawal_id = %record.id,
            amount = record.amount,
            fee = record.fee,
            "withdrawal debited, starting transfer"
        );

        let transfer = self
            .collaborators
            .gateway
            .transfer(
                account_id,
                record.amount,
                &record.bank_details,
                &record.id.to_string(),
            )
            .await;

        record.updated_at = Utc::now();
        match transfer {
            Ok(receipt) => {
                record.status = WithdrawalStatus::Completed;
                record.external_reference = Some(receipt.reference);
                // The money has left; a lost status write is an operator fix,
                // not a caller error.
                if let Err(update_err) = self.store.update_withdrawal(&record).await {
                    tracing::error!(
                        withdrawal_id = %record.id,
                        reference = ?record.external_reference,
                        error = %update_err,
                        "transfer succeeded but withdrawal could not be marked completed"
                    );
                    self.queue_review(
                        &record,
                        format!("transfer succeeded; status write failed: {update_err}"),
                    )
                    .await;
                }

                self.collaborators
                    .audit(ActivityEntry::new(
                        Actor::new(account_id, ActorRole::User),
                        "withdrawal_completed",
                        format!("withdrawal:{}", record.id),
                        format!("Transferred {} to bank", format_minor(record.amount)),
                        json!({
                            "amount": record.amount,
                            "fee": record.fee,
                            "reference": record.external_reference,
                        }),
                    ))
                    .await;
                self.notify(
                    &record,
                    "Withdrawal sent",
                    format!("{} is on its way to your bank account.", format_minor(record.amount)),
                )
                .await;
                Ok(WithdrawalOutcome::Submitted(record))
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::warn!(
                    account_id = %account_id,
                    withdrawal_id = %record.id,
                    error = %reason,
                    "bank transfer failed; debit stands pending review"
                );
                record.status = WithdrawalStatus::Failed;
                record.failure_reason = Some(reason.clone());
                if let Err(update_err) = self.store.update_withdrawal(&record).await {
                    tracing::error!(
                        withdrawal_id = %record.id,
                        error = %update_err,
                        "could not mark withdrawal as failed"
                    );
                }

                self.queue_review(&record, reason.clone()).await;

                self.collaborators
                    .audit(ActivityEntry::new(
                        Actor::new(account_id, ActorRole::User),
                        "withdrawal_failed",
                        format!("withdrawal:{}", record.id),
                        reason.clone(),
                        json!({
                            "amount": record.amount,
                            "fee": record.fee,
                            "total_deducted": record.total_deducted,
                        }),
                    ))
                    .await;
                self.notify(
                    &record,
                    "Withdrawal failed",
                    "Your bank transfer could not be completed. Our team will review it.".to_string(),
                )
                .await;

                Err(match err {
                    LedgerError::GatewayFailure(_) => err,
                    other => LedgerError::GatewayFailure(other.to_string()),
                })
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<WithdrawalRecord> {
        self.store
            .get_withdrawal(id)
            .await?
            .ok_or_else(|| LedgerError::not_found("withdrawal", id))
    }

    /// Credit a failed withdrawal's amount and fee back to the wallet.
    pub async fn refund_failed_withdrawal(
        &self,
        id: Uuid,
        actor: Actor,
    ) -> LedgerResult<WithdrawalRecord> {
        let mut record = self.get(id).await?;
        if record.status != WithdrawalStatus::Failed {
            return Err(LedgerError::InvalidTransition {
                from: record.status.as_str().to_string(),
                to: "refunded".to_string(),
                reason: "only failed withdrawals can be refunded".to_string(),
            });
        }
        if record.refunded {
            return Ok(record);
        }

        self.wallets
            .credit(
                Credit::new(
                    record.account_id,
                    record.total_deducted,
                    TransactionType::Refund,
                    "Refund of failed withdrawal",
                )
                .source(record.id.to_string())
                .metadata(json!({ "withdrawal_id": record.id })),
            )
            .await?;

        record.refunded = true;
        record.updated_at = Utc::now();
        self.store.update_withdrawal(&record).await?;

        let source = record.id.to_string();
        for mut item in self.store.list_pending_work(Some(&source)).await? {
            if item.kind == PendingWorkKind::WithdrawalReview
                && item.status != PendingWorkStatus::Resolved
            {
                item.status = PendingWorkStatus::Resolved;
                item.updated_at = Utc::now();
                self.store.update_pending_work(&item).await?;
            }
        }

        tracing::info!(
            withdrawal_id = %record.id,
            account_id = %record.account_id,
            amount = record.total_deducted,
            "failed withdrawal refunded"
        );
        self.collaborators
            .audit(ActivityEntry::new(
                actor,
                "withdrawal_refunded",
                format!("withdrawal:{}", record.id),
                format!("Refunded {} for failed withdrawal", format_minor(record.total_deducted)),
                json!({ "account_id": record.account_id, "amount": record.total_deducted }),
            ))
            .await;

        Ok(record)
    }

    async fn queue_review(&self, record: &WithdrawalRecord, reason: String) {
        let review = PendingWork::new(
            record.id.to_string(),
            PendingWorkKind::WithdrawalReview,
            Some(record.account_id),
            reason,
        );
        if let Err(queue_err) = enqueue_pending_work(self.store.as_ref(), review).await {
            tracing::error!(withdrawal_id = %record.id, error = %queue_err, "could not queue withdrawal review");
        }
    }

    async fn notify(&self, record: &WithdrawalRecord, title: &str, body: String) {
        self.collaborators
            .notify(Notification {
                account_id: record.account_id,
                account_kind: AccountKind::User,
                title: title.to_string(),
                body,
                data: json!({ "withdrawal_id": record.id, "status": record.status }),
            })
            .await;
    }
}
