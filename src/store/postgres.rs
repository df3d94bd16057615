//! PostgreSQL ledger store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use uuid::Uuid;

use super::{CommissionFilter, LedgerStore, WalletCommit};
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    ActorRole, AmbassadorTier, BankDetails, Commission, CommissionStatus, FinancialBreakdown,
    LoyaltyBonusRecord, LoyaltyFund, LoyaltyFundContribution, LoyaltyPointsEntry, PaymentStatus,
    PendingWork, ServiceRequest, ServiceStatus, TransactionType, Wallet, WalletTransaction,
    WithdrawalRecord, WithdrawalStatus,
};

#[derive(sqlx::FromRow)]
struct ServiceRequestRow {
    id: Uuid,
    requester_id: Uuid,
    provider_id: Uuid,
    status: ServiceStatus,
    payment_status: PaymentStatus,
    total_amount: i64,
    charged_amount: i64,
    refunded_amount: i64,
    financial_breakdown: Option<Json<FinancialBreakdown>>,
    finalized_at: Option<DateTime<Utc>>,
    actor_id: Option<Uuid>,
    actor_role: Option<ActorRole>,
    status_changed_at: DateTime<Utc>,
    version: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ServiceRequestRow> for ServiceRequest {
    fn from(row: ServiceRequestRow) -> Self {
        Self {
            id: row.id,
            requester_id: row.requester_id,
            provider_id: row.provider_id,
            status: row.status,
            payment_status: row.payment_status,
            total_amount: row.total_amount,
            charged_amount: row.charged_amount,
            refunded_amount: row.refunded_amount,
            financial_breakdown: row.financial_breakdown.map(|Json(b)| b),
            finalized_at: row.finalized_at,
            actor_id: row.actor_id,
            actor_role: row.actor_role,
            status_changed_at: row.status_changed_at,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    account_id: Uuid,
    amount: i64,
    fee: i64,
    total_deducted: i64,
    bank_details: Json<BankDetails>,
    status: WithdrawalStatus,
    external_reference: Option<String>,
    failure_reason: Option<String>,
    refunded: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<WithdrawalRow> for WithdrawalRecord {
    fn from(row: WithdrawalRow) -> Self {
        Self {
            id: row.id,
            account_id: row.account_id,
            amount: row.amount,
            fee: row.fee,
            total_deducted: row.total_deducted,
            bank_details: row.bank_details.0,
            status: row.status,
            external_reference: row.external_reference,
            failure_reason: row.failure_reason,
            refunded: row.refunded,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Ledger store backed by PostgreSQL
#[derive(Clone)]
pub struct PgLedgerStore {
    db_pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(db_pool: PgPool) -> Self {
        Self { db_pool }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.db_pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.db_pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn insert_service_request(&self, request: &ServiceRequest) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO service_requests (
                id, requester_id, provider_id, status, payment_status, total_amount,
                charged_amount, refunded_amount, financial_breakdown, finalized_at, actor_id,
                actor_role, status_changed_at, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(request.id)
        .bind(request.requester_id)
        .bind(request.provider_id)
        .bind(request.status)
        .bind(request.payment_status)
        .bind(request.total_amount)
        .bind(request.charged_amount)
        .bind(request.refunded_amount)
        .bind(request.financial_breakdown.clone().map(Json))
        .bind(request.finalized_at)
        .bind(request.actor_id)
        .bind(request.actor_role)
        .bind(request.status_changed_at)
        .bind(request.version)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::conflict("service_request", request.id));
        }
        Ok(())
    }

    async fn get_service_request(&self, id: Uuid) -> LedgerResult<Option<ServiceRequest>> {
        let row = sqlx::query_as::<_, ServiceRequestRow>(
            "SELECT * FROM service_requests WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row.map(ServiceRequest::from))
    }

    async fn update_service_request(
        &self,
        request: &ServiceRequest,
        expected_version: i64,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE service_requests
            SET status = $1, payment_status = $2, charged_amount = $3,
                refunded_amount = $4, financial_breakdown = $5, finalized_at = $6,
                actor_id = $7, actor_role = $8, status_changed_at = $9, updated_at = $10,
                version = $11 + 1
            WHERE id = $12 AND version = $11
            "#,
        )
        .bind(request.status)
        .bind(request.payment_status)
        .bind(request.charged_amount)
        .bind(request.refunded_amount)
        .bind(request.financial_breakdown.clone().map(Json))
        .bind(request.finalized_at)
        .bind(request.actor_id)
        .bind(request.actor_role)
        .bind(request.status_changed_at)
        .bind(request.updated_at)
        .bind(expected_version)
        .bind(request.id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.get_service_request(request.id).await? {
                Some(_) => Err(LedgerError::conflict("service_request", request.id)),
                None => Err(LedgerError::not_found("service_request", request.id)),
            };
        }
        Ok(())
    }

    async fn get_wallet(&self, account_id: Uuid) -> LedgerResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE account_id = $1")
            .bind(account_id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(wallet)
    }

    async fn commit_wallet(&self, commit: WalletCommit) -> LedgerResult<()> {
        let wallet = &commit.wallet;
        let next_version = commit.next_version();
        let now = Utc::now();
        let mut tx = self.db_pool.begin().await?;

        let written = match commit.expected_version {
            None => sqlx::query(
                r#"
                INSERT INTO wallets (
                    account_id, balance, total_earned, total_spent, total_withdrawn,
                    bonuses_earned, earned_from_bonuses, earned_from_commissions,
                    earned_from_refunds, daily_spending_limit, withdrawal_limit,
                    daily_spent_today, last_spending_date, blocked_balance, version,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
                ON CONFLICT (account_id) DO NOTHING
                "#,
            )
            .bind(wallet.account_id)
            .bind(wallet.balance)
            .bind(wallet.total_earned)
            .bind(wallet.total_spent)
            .bind(wallet.total_withdrawn)
            .bind(wallet.bonuses_earned)
            .bind(wallet.breakdown.earned_from_bonuses)
            .bind(wallet.breakdown.earned_from_commissions)
            .bind(wallet.breakdown.earned_from_refunds)
            .bind(wallet.limits.daily_spending_limit)
            .bind(wallet.limits.withdrawal_limit)
            .bind(wallet.limits.daily_spent_today)
            .bind(wallet.limits.last_spending_date)
            .bind(wallet.limits.blocked_balance)
            .bind(next_version)
            .bind(wallet.created_at)
            .bind(now)
            .execute(&mut *tx)
            .await?,
            Some(expected) => sqlx::query(
                r#"
                UPDATE wallets
                SET balance = $1, total_earned = $2, total_spent = $3, total_withdrawn = $4,
                    bonuses_earned = $5, earned_from_bonuses = $6,
                    earned_from_commissions = $7, earned_from_refunds = $8,
                    daily_spending_limit = $9, withdrawal_limit = $10,
                    daily_spent_today = $11, last_spending_date = $12,
                    blocked_balance = $13, version = $14, updated_at = $15
                WHERE account_id = $16 AND version = $17
                "#,
            )
            .bind(wallet.balance)
            .bind(wallet.total_earned)
            .bind(wallet.total_spent)
            .bind(wallet.total_withdrawn)
            .bind(wallet.bonuses_earned)
            .bind(wallet.breakdown.earned_from_bonuses)
            .bind(wallet.breakdown.earned_from_commissions)
            .bind(wallet.breakdown.earned_from_refunds)
            .bind(wallet.limits.daily_spending_limit)
            .bind(wallet.limits.withdrawal_limit)
            .bind(wallet.limits.daily_spent_today)
            .bind(wallet.limits.last_spending_date)
            .bind(wallet.limits.blocked_balance)
            .bind(next_version)
            .bind(now)
            .bind(wallet.account_id)
            .bind(expected)
            .execute(&mut *tx)
            .await?,
        };

        if written.rows_affected() == 0 {
            return Err(LedgerError::conflict("wallet", wallet.account_id));
        }

        for transaction in &commit.transactions {
            let inserted = sqlx::query(
                r#"
                INSERT INTO wallet_transactions (
                    id, account_id, transaction_type, amount, description, source_id,
                    balance_before, balance_after, created_at, metadata
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                ON CONFLICT (account_id, transaction_type, source_id) DO NOTHING
                "#,
            )
            .bind(transaction.id)
            .bind(transaction.account_id)
            .bind(transaction.transaction_type)
            .bind(transaction.amount)
            .bind(&transaction.description)
            .bind(&transaction.source_id)
            .bind(transaction.balance_before)
            .bind(transaction.balance_after)
            .bind(transaction.created_at)
            .bind(&transaction.metadata)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() == 0 {
                return Err(LedgerError::conflict("wallet_transaction", transaction.id));
            }
        }

        if let Some(withdrawal) = &commit.withdrawal {
            sqlx::query(
                r#"
                INSERT INTO withdrawals (
                    id, account_id, amount, fee, total_deducted, bank_details, status,
                    external_reference, failure_reason, refunded, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                "#,
            )
            .bind(withdrawal.id)
            .bind(withdrawal.account_id)
            .bind(withdrawal.amount)
            .bind(withdrawal.fee)
            .bind(withdrawal.total_deducted)
            .bind(Json(&withdrawal.bank_details))
            .bind(withdrawal.status)
            .bind(&withdrawal.external_reference)
            .bind(&withdrawal.failure_reason)
            .bind(withdrawal.refunded)
            .bind(withdrawal.created_at)
            .bind(withdrawal.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn find_wallet_transaction(
        &self,
        account_id: Uuid,
        transaction_type: TransactionType,
        source_id: &str,
    ) -> LedgerResult<Option<WalletTransaction>> {
        let transaction = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT id, account_id, transaction_type, amount, description, source_id,
                   balance_before, balance_after, created_at, metadata
            FROM wallet_transactions
            WHERE account_id = $1 AND transaction_type = $2 AND source_id = $3
            "#,
        )
        .bind(account_id)
        .bind(transaction_type)
        .bind(source_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(transaction)
    }

    async fn list_wallet_transactions(
        &self,
        account_id: Uuid,
    ) -> LedgerResult<Vec<WalletTransaction>> {
        let transactions = sqlx::query_as::<_, WalletTransaction>(
            r#"
            SELECT id, account_id, transaction_type, amount, description, source_id,
                   balance_before, balance_after, created_at, metadata
            FROM wallet_transactions
            WHERE account_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(transactions)
    }

    async fn referring_ambassador(&self, account_id: Uuid) -> LedgerResult<Option<Uuid>> {
        let row = sqlx::query_as::<_, (Uuid,)>(
            "SELECT ambassador_id FROM referrals WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row.map(|(id,)| id))
    }

    async fn set_referring_ambassador(
        &self,
        account_id: Uuid,
        ambassador_id: Uuid,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO referrals (account_id, ambassador_id, created_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (account_id) DO UPDATE SET ambassador_id = EXCLUDED.ambassador_id
            "#,
        )
        .bind(account_id)
        .bind(ambassador_id)
        .bind(Utc::now())
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn ambassador_tier(&self, ambassador_id: Uuid) -> LedgerResult<Option<AmbassadorTier>> {
        let row = sqlx::query_as::<_, (AmbassadorTier,)>(
            "SELECT tier FROM ambassadors WHERE ambassador_id = $1",
        )
        .bind(ambassador_id)
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(row.map(|(tier,)| tier))
    }

    async fn set_ambassador_tier(
        &self,
        ambassador_id: Uuid,
        tier: AmbassadorTier,
    ) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ambassadors (ambassador_id, tier, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (ambassador_id) DO UPDATE
            SET tier = EXCLUDED.tier, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(ambassador_id)
        .bind(tier)
        .bind(Utc::now())
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn insert_commission(&self, commission: &Commission) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO commissions (
                id, ambassador_id, commission_type, source_id, amount, percentage_bps,
                status, created_at, paid_at, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (ambassador_id, commission_type, source_id) DO NOTHING
            "#,
        )
        .bind(commission.id)
        .bind(commission.ambassador_id)
        .bind(commission.commission_type)
        .bind(&commission.source_id)
        .bind(commission.amount)
        .bind(commission.percentage_bps)
        .bind(commission.status)
        .bind(commission.created_at)
        .bind(commission.paid_at)
        .bind(&commission.metadata)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_commissions(&self, filter: &CommissionFilter) -> LedgerResult<Vec<Commission>> {
        let commissions = sqlx::query_as::<_, Commission>(
            r#"
            SELECT * FROM commissions
            WHERE ($1::uuid IS NULL OR ambassador_id = $1)
              AND ($2::text IS NULL OR source_id = $2)
              AND ($3::commission_type IS NULL OR commission_type = $3)
              AND ($4::commission_status IS NULL OR status = $4)
            ORDER BY created_at ASC
            "#,
        )
        .bind(filter.ambassador_id)
        .bind(&filter.source_id)
        .bind(filter.commission_type)
        .bind(filter.status)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(commissions)
    }

    async fn mark_commission_paid(&self, id: Uuid, paid_at: DateTime<Utc>) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE commissions SET status = $1, paid_at = $2 WHERE id = $3",
        )
        .bind(CommissionStatus::Paid)
        .bind(paid_at)
        .bind(id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("commission", id));
        }
        Ok(())
    }

    async fn insert_loyalty_points(&self, entry: &LoyaltyPointsEntry) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO loyalty_points (id, account_id, points, source_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, source_id) DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.account_id)
        .bind(entry.points)
        .bind(&entry.source_id)
        .bind(entry.created_at)
        .execute(&self.db_pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn loyalty_points_balance(&self, account_id: Uuid) -> LedgerResult<i64> {
        let (balance,) = sqlx::query_as::<_, (i64,)>(
            "SELECT COALESCE(SUM(points), 0)::BIGINT FROM loyalty_points WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_one(&self.db_pool)
        .await?;

        Ok(balance)
    }

    async fn append_loyalty_fund(
        &self,
        contribution: &LoyaltyFundContribution,
    ) -> LedgerResult<bool> {
        let mut tx = self.db_pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO loyalty_fund_contributions (id, source_id, amount, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id) DO NOTHING
            "#,
        )
        .bind(contribution.id)
        .bind(&contribution.source_id)
        .bind(contribution.amount)
        .bind(contribution.created_at)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            INSERT INTO loyalty_fund (id, total_amount, contributions, updated_at)
            VALUES (1, $1, 1, $2)
            ON CONFLICT (id) DO UPDATE
            SET total_amount = loyalty_fund.total_amount + EXCLUDED.total_amount,
                contributions = loyalty_fund.contributions + 1,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(contribution.amount)
        .bind(contribution.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn loyalty_fund(&self) -> LedgerResult<LoyaltyFund> {
        let fund = sqlx::query_as::<_, LoyaltyFund>(
            "SELECT total_amount, contributions, updated_at FROM loyalty_fund WHERE id = 1",
        )
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(fund.unwrap_or_default())
    }

    async fn insert_bonus_record(&self, record: &LoyaltyBonusRecord) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO loyalty_bonus_records (
                id, account_id, bonus_amount, threshold_reached, total_spent_at_time,
                granted, created_at, granted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(record.id)
        .bind(record.account_id)
        .bind(record.bonus_amount)
        .bind(record.threshold_reached)
        .bind(record.total_spent_at_time)
        .bind(record.granted)
        .bind(record.created_at)
        .bind(record.granted_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn list_bonus_records(&self, account_id: Uuid) -> LedgerResult<Vec<LoyaltyBonusRecord>> {
        let records = sqlx::query_as::<_, LoyaltyBonusRecord>(
            "SELECT * FROM loyalty_bonus_records WHERE account_id = $1 ORDER BY created_at ASC",
        )
        .bind(account_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(records)
    }

    async fn mark_bonus_granted(&self, id: Uuid, granted_at: DateTime<Utc>) -> LedgerResult<()> {
        let result = sqlx::query(
            "UPDATE loyalty_bonus_records SET granted = true, granted_at = $1 WHERE id = $2",
        )
        .bind(granted_at)
        .bind(id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("loyalty_bonus_record", id));
        }
        Ok(())
    }

    async fn get_withdrawal(&self, id: Uuid) -> LedgerResult<Option<WithdrawalRecord>> {
        let row = sqlx::query_as::<_, WithdrawalRow>("SELECT * FROM withdrawals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.db_pool)
            .await?;

        Ok(row.map(WithdrawalRecord::from))
    }

    async fn update_withdrawal(&self, record: &WithdrawalRecord) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE withdrawals
            SET status = $1, external_reference = $2, failure_reason = $3,
                refunded = $4, updated_at = $5
            WHERE id = $6
            "#,
        )
        .bind(record.status)
        .bind(&record.external_reference)
        .bind(&record.failure_reason)
        .bind(record.refunded)
        .bind(record.updated_at)
        .bind(record.id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("withdrawal", record.id));
        }
        Ok(())
    }

    async fn enqueue_pending_work(&self, item: &PendingWork) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_work (
                id, source_id, kind, account_id, reason, attempts, status, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(item.id)
        .bind(&item.source_id)
        .bind(item.kind)
        .bind(item.account_id)
        .bind(&item.reason)
        .bind(item.attempts)
        .bind(item.status)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.db_pool)
        .await?;

        Ok(())
    }

    async fn open_pending_work(&self, limit: i64) -> LedgerResult<Vec<PendingWork>> {
        let items = sqlx::query_as::<_, PendingWork>(
            "SELECT * FROM pending_work WHERE status = 'open' ORDER BY created_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(items)
    }

    async fn update_pending_work(&self, item: &PendingWork) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pending_work
            SET reason = $1, attempts = $2, status = $3, updated_at = $4
            WHERE id = $5
            "#,
        )
        .bind(&item.reason)
        .bind(item.attempts)
        .bind(item.status)
        .bind(item.updated_at)
        .bind(item.id)
        .execute(&self.db_pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::not_found("pending_work", item.id));
        }
        Ok(())
    }

    async fn list_pending_work(&self, source_id: Option<&str>) -> LedgerResult<Vec<PendingWork>> {
        let items = sqlx::query_as::<_, PendingWork>(
            r#"
            SELECT * FROM pending_work
            WHERE ($1::text IS NULL OR source_id = $1)
            ORDER BY created_at ASC
            "#,
        )
        .bind(source_id)
        .fetch_all(&self.db_pool)
        .await?;

        Ok(items)
    }
}

