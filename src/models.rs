//! Data models for the servimarket settlement core

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

// ===== Service requests =====

/// Fulfillment status of a service request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "service_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Scheduled,
    PendingUserConfirmation,
    ConfirmedByProvider,
    Paid,
    ProviderEnRoute,
    ServiceStarted,
    CompletedByProvider,
    CompletedByUser,
    CancelledByUser,
    CancelledByProvider,
    CancelledByAdmin,
    RejectedByProvider,
    InDispute,
    ClosedAuto,
    ClosedWithRating,
    ClosedDisputeResolved,
    ClosedForcedAdmin,
}

impl ServiceStatus {
    pub const TERMINAL: [ServiceStatus; 8] = [
        ServiceStatus::ClosedAuto,
        ServiceStatus::ClosedWithRating,
        ServiceStatus::ClosedDisputeResolved,
        ServiceStatus::CancelledByUser,
        ServiceStatus::CancelledByProvider,
        ServiceStatus::RejectedByProvider,
        ServiceStatus::CancelledByAdmin,
        ServiceStatus::ClosedForcedAdmin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Scheduled => "scheduled",
            ServiceStatus::PendingUserConfirmation => "pending_user_confirmation",
            ServiceStatus::ConfirmedByProvider => "confirmed_by_provider",
            ServiceStatus::Paid => "paid",
            ServiceStatus::ProviderEnRoute => "provider_en_route",
            ServiceStatus::ServiceStarted => "service_started",
            ServiceStatus::CompletedByProvider => "completed_by_provider",
            ServiceStatus::CompletedByUser => "completed_by_user",
            ServiceStatus::CancelledByUser => "cancelled_by_user",
            ServiceStatus::CancelledByProvider => "cancelled_by_provider",
            ServiceStatus::CancelledByAdmin => "cancelled_by_admin",
            ServiceStatus::RejectedByProvider => "rejected_by_provider",
            ServiceStatus::InDispute => "in_dispute",
            ServiceStatus::ClosedAuto => "closed_auto",
            ServiceStatus::ClosedWithRating => "closed_with_rating",
            ServiceStatus::ClosedDisputeResolved => "closed_dispute_resolved",
            ServiceStatus::ClosedForcedAdmin => "closed_forced_admin",
        }
    }

    /// Member of the terminal set.
    pub fn is_finalized(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_cancelled(&self) -> bool {
        self.as_str().starts_with("cancelled_") || *self == ServiceStatus::RejectedByProvider
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment status of a service request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    PendingUserConfirmation,
    HeldForRelease,
    ReleasedToProvider,
    FrozenDispute,
    RefundedPartial,
    RefundedTotal,
    PendingCharge,
    Charged,
    Failed,
    NotApplicable,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::PendingUserConfirmation => "pending_user_confirmation",
            PaymentStatus::HeldForRelease => "held_for_release",
            PaymentStatus::ReleasedToProvider => "released_to_provider",
            PaymentStatus::FrozenDispute => "frozen_dispute",
            PaymentStatus::RefundedPartial => "refunded_partial",
            PaymentStatus::RefundedTotal => "refunded_total",
            PaymentStatus::PendingCharge => "pending_charge",
            PaymentStatus::Charged => "charged",
            PaymentStatus::Failed => "failed",
            PaymentStatus::NotApplicable => "not_applicable",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who performed the last transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "actor_role", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    User,
    Provider,
    Admin,
    System,
}

impl ActorRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorRole::User => "user",
            ActorRole::Provider => "provider",
            ActorRole::Admin => "admin",
            ActorRole::System => "system",
        }
    }
}

/// Actor of a state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Uuid,
    pub role: ActorRole,
}

impl Actor {
    pub fn new(id: Uuid, role: ActorRole) -> Self {
        Self { id, role }
    }

    pub fn system() -> Self {
        Self {
            id: Uuid::nil(),
            role: ActorRole::System,
        }
    }
}

/// Settled split of an escrowed payment.
///
/// A request either has no breakdown (not yet settled) or a complete one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinancialBreakdown {
    pub total_amount: i64,
    pub processor_fee: i64,
    pub net_after_processor: i64,
    pub platform_commission: i64,
    pub loyalty_fund_amount: i64,
    pub provider_payout: i64,
    pub points_earned: i64,
    pub provider_ambassador_id: Option<Uuid>,
    pub requester_ambassador_id: Option<Uuid>,
    pub settled_at: DateTime<Utc>,
}

/// Service request model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub id: Uuid,
    pub requester_id: Uuid,
    pub provider_id: Uuid,
    pub status: ServiceStatus,
    pub payment_status: PaymentStatus,
    pub total_amount: i64,
    pub charged_amount: i64,
    /// Amount owed back to the requester once a refund is claimed.
    pub refunded_amount: i64,
    pub financial_breakdown: Option<FinancialBreakdown>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub actor_id: Option<Uuid>,
    pub actor_role: Option<ActorRole>,
    pub status_changed_at: DateTime<Utc>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ServiceRequest {
    pub fn new(requester_id: Uuid, provider_id: Uuid, total_amount: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            requester_id,
            provider_id,
            status: ServiceStatus::Scheduled,
            payment_status: PaymentStatus::PendingCharge,
            total_amount,
            charged_amount: 0,
            refunded_amount: 0,
            financial_breakdown: None,
            finalized_at: None,
            actor_id: None,
            actor_role: None,
            status_changed_at: now,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_finalized()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    pub fn is_settled(&self) -> bool {
        self.financial_breakdown.is_some()
    }
}

// ===== Wallets =====

/// Where earned money came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletBreakdown {
    pub earned_from_bonuses: i64,
    pub earned_from_commissions: i64,
    pub earned_from_refunds: i64,
}

/// Spending and withdrawal limits of a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletLimits {
    pub daily_spending_limit: i64,
    pub withdrawal_limit: i64,
    pub daily_spent_today: i64,
    pub last_spending_date: Option<NaiveDate>,
    pub blocked_balance: i64,
}

/// Wallet model, one per account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Wallet {
    pub account_id: Uuid,
    pub balance: i64,
    pub total_earned: i64,
    pub total_spent: i64,
    pub total_withdrawn: i64,
    pub bonuses_earned: i64,
    #[sqlx(flatten)]
    pub breakdown: WalletBreakdown,
    #[sqlx(flatten)]
    pub limits: WalletLimits,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn new(account_id: Uuid, daily_spending_limit: i64, withdrawal_limit: i64) -> Self {
        let now = Utc::now();
        Self {
            account_id,
            balance: 0,
            total_earned: 0,
            total_spent: 0,
            total_withdrawn: 0,
            bonuses_earned: 0,
            breakdown: WalletBreakdown::default(),
            limits: WalletLimits {
                daily_spending_limit,
                withdrawal_limit,
                daily_spent_today: 0,
                last_spending_date: None,
                blocked_balance: 0,
            },
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Balance not held back by a block.
    pub fn available(&self) -> i64 {
        self.balance - self.limits.blocked_balance
    }

    /// `balance == totalEarned - totalSpent - totalWithdrawn`
    pub fn balance_consistent(&self) -> bool {
        self.balance == self.total_earned - self.total_spent - self.total_withdrawn
    }

    /// Spent today, treating a stale `last_spending_date` as a fresh day.
    pub fn spent_on(&self, today: NaiveDate) -> i64 {
        if self.limits.last_spending_date == Some(today) {
            self.limits.daily_spent_today
        } else {
            0
        }
    }
}

/// Wallet transaction types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "wallet_transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Commission,
    Bonus,
    Refund,
    Payment,
    Withdrawal,
    WithdrawalFee,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Commission => "commission",
            TransactionType::Bonus => "bonus",
            TransactionType::Refund => "refund",
            TransactionType::Payment => "payment",
            TransactionType::Withdrawal => "withdrawal",
            TransactionType::WithdrawalFee => "withdrawal_fee",
        }
    }

    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionType::Commission | TransactionType::Bonus | TransactionType::Refund
        )
    }

    /// Apply the type's sign to an unsigned amount.
    pub fn signed(&self, amount: i64) -> i64 {
        if self.is_credit() {
            amount
        } else {
            -amount
        }
    }
}

/// Immutable wallet ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub account_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub description: String,
    pub source_id: Option<String>,
    pub balance_before: i64,
    pub balance_after: i64,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl WalletTransaction {
    pub fn signed_amount(&self) -> i64 {
        self.transaction_type.signed(self.amount)
    }
}

// ===== Commissions =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "commission_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommissionType {
    Service,
    Membership,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "commission_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Pending,
    Paid,
}

/// Ambassador commission record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Commission {
    pub id: Uuid,
    pub ambassador_id: Uuid,
    pub commission_type: CommissionType,
    pub source_id: String,
    pub amount: i64,
    /// Share of the base amount in basis points (10000 = 100%).
    pub percentage_bps: i64,
    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "ambassador_tier", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AmbassadorTier {
    Standard,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipTier {
    Base,
    Business,
}

impl MembershipTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipTier::Base => "base",
            MembershipTier::Business => "business",
        }
    }
}

// ===== Loyalty =====

/// Threshold bonus bookkeeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoyaltyBonusRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub bonus_amount: i64,
    pub threshold_reached: i64,
    pub total_spent_at_time: i64,
    pub granted: bool,
    pub created_at: DateTime<Utc>,
    pub granted_at: Option<DateTime<Utc>>,
}

/// Loyalty points accrued by one settlement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoyaltyPointsEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub points: i64,
    pub source_id: String,
    pub created_at: DateTime<Utc>,
}

/// Global loyalty fund record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoyaltyFund {
    pub total_amount: i64,
    pub contributions: i64,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LoyaltyFundContribution {
    pub id: Uuid,
    pub source_id: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Pending bonus summary for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingBonuses {
    pub count: i64,
    pub amount_per_bonus: i64,
    pub total_pending: i64,
}

// ===== Withdrawals =====

/// Destination bank account for a withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub account_holder: String,
    pub account_number: String,
    pub bank_code: String,
    /// ISO 3166-1 alpha-2 country code
    pub country: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "withdrawal_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
        }
    }
}

/// Withdrawal model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRecord {
    pub id: Uuid,
    pub account_id: Uuid,
    pub amount: i64,
    pub fee: i64,
    pub total_deducted: i64,
    pub bank_details: BankDetails,
    pub status: WithdrawalStatus,
    pub external_reference: Option<String>,
    pub failure_reason: Option<String>,
    /// Set once the compensating refund for a failed transfer was credited.
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fee quote for a withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalQuote {
    pub amount: i64,
    pub fee: i64,
    pub total_deducted: i64,
}

// ===== Reconciliation =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "pending_work_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PendingWorkKind {
    SettlementSideEffects,
    CommissionPayout,
    LoyaltyBonus,
    RefundCredit,
    WithdrawalReview,
}

impl PendingWorkKind {
    /// Kinds the worker may retry on its own.
    pub fn is_automatic(&self) -> bool {
        !matches!(self, PendingWorkKind::WithdrawalReview)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "pending_work_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PendingWorkStatus {
    Open,
    Resolved,
    Manual,
}

/// Unresolved follow-up work keyed by its idempotency source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PendingWork {
    pub id: Uuid,
    pub source_id: String,
    pub kind: PendingWorkKind,
    pub account_id: Option<Uuid>,
    pub reason: String,
    pub attempts: i32,
    pub status: PendingWorkStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PendingWork {
    pub fn new(
        source_id: impl Into<String>,
        kind: PendingWorkKind,
        account_id: Option<Uuid>,
        reason: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let status = if kind.is_automatic() {
            PendingWorkStatus::Open
        } else {
            PendingWorkStatus::Manual
        };
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            kind,
            account_id,
            reason: reason.into(),
            attempts: 0,
            status,
            created_at: now,
            updated_at: now,
        }
    }
}

// ===== API wrappers =====

/// API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_cancelled_sets() {
        assert!(ServiceStatus::ClosedAuto.is_finalized());
        assert!(ServiceStatus::RejectedByProvider.is_finalized());
        assert!(!ServiceStatus::InDispute.is_finalized());
        assert!(!ServiceStatus::CompletedByUser.is_finalized());

        assert!(ServiceStatus::CancelledByAdmin.is_cancelled());
        assert!(ServiceStatus::RejectedByProvider.is_cancelled());
        assert!(!ServiceStatus::ClosedForcedAdmin.is_cancelled());
    }

    #[test]
    fn status_serializes_as_snake_case() {
        let json = serde_json::to_string(&ServiceStatus::PendingUserConfirmation).unwrap();
        assert_eq!(json, "\"pending_user_confirmation\"");
        let parsed: PaymentStatus = serde_json::from_str("\"held_for_release\"").unwrap();
        assert_eq!(parsed, PaymentStatus::HeldForRelease);
    }

    #[test]
    fn transaction_sign_follows_type() {
        assert_eq!(TransactionType::Bonus.signed(2_000), 2_000);
        assert_eq!(TransactionType::WithdrawalFee.signed(350), -350);
        assert_eq!(TransactionType::Payment.signed(100), -100);
    }

    #[test]
    fn daily_spend_resets_on_new_day() {
        let mut wallet = Wallet::new(Uuid::new_v4(), 10_000, 10_000);
        let yesterday = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let today = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        wallet.limits.last_spending_date = Some(yesterday);
        wallet.limits.daily_spent_today = 9_000;

        assert_eq!(wallet.spent_on(yesterday), 9_000);
        assert_eq!(wallet.spent_on(today), 0);
    }
}
