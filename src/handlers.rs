//! API handlers for the servimarket settlement core

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::app_state::AppState;
use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    Actor, ActorRole, AmbassadorTier, ApiResponse, BankDetails, Commission, CommissionStatus,
    CommissionType, LoyaltyBonusRecord, LoyaltyFund, MembershipTier, PaymentStatus, PendingBonuses,
    PendingWork, ServiceRequest, ServiceStatus, Wallet, WalletTransaction, WithdrawalRecord,
};
use crate::services::{
    GrantedBonus, LoyaltyPoints, ReconciliationReport, TransitionOutcome, WalletVerification,
    WithdrawalOutcome,
};
use crate::store::CommissionFilter;

/// Error half of every handler result. Failures carry no data.
pub type ApiError = (StatusCode, Json<ApiResponse<()>>);
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn failure(err: LedgerError) -> ApiError {
    let status = err.status_code();
    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }
    (status, Json(ApiResponse::error(err.to_string())))
}

fn respond<T>(result: LedgerResult<T>) -> ApiResult<T> {
    result.map(|data| Json(ApiResponse::ok(data))).map_err(failure)
}

fn validated<R: Validate>(request: &R) -> Result<(), ApiError> {
    request.validate().map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error(format!("Validation error: {}", e))),
        )
    })
}

// ===== Request bodies =====

/// Who is acting. Omitted fields mean the platform itself.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct ActorFields {
    pub actor_id: Option<Uuid>,
    pub actor_role: Option<ActorRole>,
}

impl ActorFields {
    pub fn actor(&self) -> Actor {
        match (self.actor_id, self.actor_role) {
            (Some(id), Some(role)) => Actor::new(id, role),
            (Some(id), None) => Actor::new(id, ActorRole::User),
            _ => Actor::system(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateServiceRequestBody {
    pub requester_id: Uuid,
    pub provider_id: Uuid,
    #[validate(range(min = 1))]
    pub total_amount: i64,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize)]
pub struct TransitionBody {
    pub status: ServiceStatus,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize)]
pub struct PaymentStatusBody {
    pub payment_status: PaymentStatus,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundBody {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[serde(flatten)]
    pub actor: ActorFields,
}

/// Status report from the moderation/chat and scheduling modules
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub service_request_id: Uuid,
    pub status: Option<ServiceStatus>,
    pub payment_status: Option<PaymentStatus>,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LimitsBody {
    #[validate(range(min = 0))]
    pub daily_spending_limit: Option<i64>,
    #[validate(range(min = 0))]
    pub withdrawal_limit: Option<i64>,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BlockFundsBody {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate(length(min = 1, max = 500))]
    pub reason: String,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ReleaseFundsBody {
    #[validate(range(min = 1))]
    pub amount: i64,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize, Validate)]
pub struct BankDetailsBody {
    #[validate(length(min = 1, max = 200))]
    pub account_holder: String,
    #[validate(length(min = 4, max = 34))]
    pub account_number: String,
    #[validate(length(min = 1, max = 20))]
    pub bank_code: String,
    #[validate(length(equal = 2))]
    pub country: String,
}

impl From<BankDetailsBody> for BankDetails {
    fn from(body: BankDetailsBody) -> Self {
        BankDetails {
            account_holder: body.account_holder,
            account_number: body.account_number,
            bank_code: body.bank_code,
            country: body.country.to_uppercase(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct WithdrawalBody {
    pub account_id: Uuid,
    #[validate(range(min = 1))]
    pub amount: i64,
    #[validate]
    pub bank_details: BankDetailsBody,
    #[serde(default)]
    pub accept_fee: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActorBody {
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListCommissionsQuery {
    pub ambassador_id: Option<Uuid>,
    pub source_id: Option<String>,
    pub commission_type: Option<CommissionType>,
    pub status: Option<CommissionStatus>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MembershipCommissionBody {
    pub subscriber_id: Uuid,
    pub membership: MembershipTier,
    #[validate(range(min = 0))]
    pub membership_fee: i64,
    #[validate(length(min = 1, max = 200))]
    pub source_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReferralBody {
    pub account_id: Uuid,
    pub ambassador_id: Uuid,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Deserialize)]
pub struct AmbassadorBody {
    pub ambassador_id: Uuid,
    pub tier: AmbassadorTier,
    #[serde(flatten)]
    pub actor: ActorFields,
}

#[derive(Debug, Default, Deserialize)]
pub struct PendingWorkQuery {
    pub source_id: Option<String>,
}

// ===== Service request handlers =====

/// Book a service request
pub async fn create_service_request(
    State(app_state): State<AppState>,
    Json(request): Json<CreateServiceRequestBody>,
) -> ApiResult<ServiceRequest> {
    validated(&request)?;
    respond(
        app_state
            .services
            .lifecycle
            .create_service_request(
                request.requester_id,
                request.provider_id,
                request.total_amount,
                request.actor.actor(),
            )
            .await,
    )
}

pub async fn get_service_request(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<ServiceRequest> {
    respond(app_state.services.lifecycle.get(id).await)
}

/// Apply a status transition
pub async fn transition_service_request(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionBody>,
) -> ApiResult<TransitionOutcome> {
    respond(
        app_state
            .services
            .lifecycle
            .apply_transition(id, request.status, request.actor.actor())
            .await,
    )
}

pub async fn update_payment_status(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PaymentStatusBody>,
) -> ApiResult<TransitionOutcome> {
    respond(
        app_state
            .services
            .lifecycle
            .update_payment_status(id, request.payment_status, request.actor.actor())
            .await,
    )
}

pub async fn capture_payment(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorBody>,
) -> ApiResult<ServiceRequest> {
    respond(
        app_state
            .services
            .lifecycle
            .capture_payment(id, request.actor.actor())
            .await,
    )
}

pub async fn pay_with_wallet(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorBody>,
) -> ApiResult<ServiceRequest> {
    respond(
        app_state
            .services
            .lifecycle
            .pay_with_wallet(id, request.actor.actor())
            .await,
    )
}

pub async fn release_service_request(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorBody>,
) -> ApiResult<ServiceRequest> {
    respond(
        app_state
            .services
            .lifecycle
            .release(id, request.actor.actor())
            .await,
    )
}

pub async fn refund_service_request(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<RefundBody>,
) -> ApiResult<ServiceRequest> {
    validated(&request)?;
    respond(
        app_state
            .services
            .lifecycle
            .refund(id, request.amount, request.actor.actor())
            .await,
    )
}

/// Webhook endpoint for status reports from other modules
pub async fn webhook_service_update(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<WebhookPayload>,
) -> ApiResult<ServiceRequest> {
    // Authenticate webhook
    match &app_state.webhook_secret {
        Some(secret) if !secret.is_empty() => {
            let auth_header = headers
                .get("X-Webhook-Secret")
                .and_then(|h| h.to_str().ok())
                .unwrap_or_default();

            if auth_header != secret {
                return Err((
                    StatusCode::UNAUTHORIZED,
                    Json(ApiResponse::error("Unauthorized webhook request")),
                ));
            }
        }
        _ => {
            // Fail closed while no secret is configured.
            tracing::error!("Webhook secret not configured - rejecting request");
            return Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse::error("Webhook endpoint is not configured")),
            ));
        }
    }

    if payload.status.is_none() && payload.payment_status.is_none() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Webhook carries neither status nor payment_status")),
        ));
    }

    let lifecycle = &app_state.services.lifecycle;
    let actor = payload.actor.actor();
    let id = payload.service_request_id;

    if let Some(status) = payload.status {
        lifecycle
            .apply_transition(id, status, actor)
            .await
            .map_err(failure)?;
    }
    if let Some(payment_status) = payload.payment_status {
        lifecycle
            .update_payment_status(id, payment_status, actor)
            .await
            .map_err(failure)?;
    }

    respond(lifecycle.get(id).await)
}

// ===== Wallet handlers =====

pub async fn get_wallet(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Wallet> {
    respond(app_state.services.wallets.get_wallet(account_id).await)
}

pub async fn list_wallet_transactions(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Vec<WalletTransaction>> {
    respond(app_state.services.wallets.statement(account_id).await)
}

pub async fn verify_wallet(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<WalletVerification> {
    respond(app_state.services.wallets.verify_wallet(account_id).await)
}

pub async fn set_wallet_limits(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<LimitsBody>,
) -> ApiResult<Wallet> {
    validated(&request)?;
    respond(
        app_state
            .services
            .wallets
            .set_limits(
                account_id,
                request.daily_spending_limit,
                request.withdrawal_limit,
                request.actor.actor(),
            )
            .await,
    )
}

pub async fn block_funds(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<BlockFundsBody>,
) -> ApiResult<Wallet> {
    validated(&request)?;
    respond(
        app_state
            .services
            .wallets
            .block_funds(account_id, request.amount, &request.reason, request.actor.actor())
            .await,
    )
}

pub async fn release_blocked_funds(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
    Json(request): Json<ReleaseFundsBody>,
) -> ApiResult<Wallet> {
    validated(&request)?;
    respond(
        app_state
            .services
            .wallets
            .release_blocked_funds(account_id, request.amount, request.actor.actor())
            .await,
    )
}

// ===== Loyalty handlers =====

pub async fn get_pending_bonuses(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<PendingBonuses> {
    respond(app_state.services.loyalty.pending_bonuses(account_id).await)
}

pub async fn grant_bonuses(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Vec<GrantedBonus>> {
    respond(app_state.services.loyalty.grant_next(account_id).await)
}

pub async fn get_bonus_history(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<Vec<LoyaltyBonusRecord>> {
    respond(app_state.services.loyalty.bonus_history(account_id).await)
}

pub async fn get_loyalty_points(
    State(app_state): State<AppState>,
    Path(account_id): Path<Uuid>,
) -> ApiResult<LoyaltyPoints> {
    respond(app_state.services.loyalty.points(account_id).await)
}

pub async fn get_loyalty_fund(State(app_state): State<AppState>) -> ApiResult<LoyaltyFund> {
    respond(app_state.services.loyalty.fund().await)
}

// ===== Withdrawal handlers =====

/// Quote or submit a withdrawal
pub async fn create_withdrawal(
    State(app_state): State<AppState>,
    Json(request): Json<WithdrawalBody>,
) -> ApiResult<WithdrawalOutcome> {
    validated(&request)?;
    respond(
        app_state
            .services
            .withdrawals
            .withdraw(
                request.account_id,
                request.amount,
                request.bank_details.into(),
                request.accept_fee,
            )
            .await,
    )
}

pub async fn get_withdrawal(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<WithdrawalRecord> {
    respond(app_state.services.withdrawals.get(id).await)
}

pub async fn refund_withdrawal(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorBody>,
) -> ApiResult<WithdrawalRecord> {
    respond(
        app_state
            .services
            .withdrawals
            .refund_failed_withdrawal(id, request.actor.actor())
            .await,
    )
}

// ===== Commission and referral handlers =====

pub async fn list_commissions(
    State(app_state): State<AppState>,
    Query(query): Query<ListCommissionsQuery>,
) -> ApiResult<Vec<Commission>> {
    let filter = CommissionFilter {
        ambassador_id: query.ambassador_id,
        source_id: query.source_id,
        commission_type: query.commission_type,
        status: query.status,
    };
    respond(app_state.services.commissions.list(&filter).await)
}

pub async fn create_membership_commission(
    State(app_state): State<AppState>,
    Json(request): Json<MembershipCommissionBody>,
) -> ApiResult<Option<Commission>> {
    validated(&request)?;
    respond(
        app_state
            .services
            .commissions
            .distribute_membership(
                request.subscriber_id,
                request.membership,
                request.membership_fee,
                &request.source_id,
            )
            .await,
    )
}

pub async fn pay_commissions(
    State(app_state): State<AppState>,
    Path(source_id): Path<String>,
) -> ApiResult<Vec<Commission>> {
    respond(app_state.services.commissions.pay_pending(&source_id).await)
}

pub async fn set_referrer(
    State(app_state): State<AppState>,
    Json(request): Json<ReferralBody>,
) -> ApiResult<()> {
    respond(
        app_state
            .services
            .commissions
            .set_referrer(request.account_id, request.ambassador_id, request.actor.actor())
            .await,
    )
}

pub async fn set_ambassador_tier(
    State(app_state): State<AppState>,
    Json(request): Json<AmbassadorBody>,
) -> ApiResult<()> {
    respond(
        app_state
            .services
            .commissions
            .set_ambassador_tier(request.ambassador_id, request.tier, request.actor.actor())
            .await,
    )
}

// ===== Reconciliation handlers =====

pub async fn list_pending_work(
    State(app_state): State<AppState>,
    Query(query): Query<PendingWorkQuery>,
) -> ApiResult<Vec<PendingWork>> {
    respond(
        app_state
            .services
            .reconciliation
            .list(query.source_id.as_deref())
            .await,
    )
}

pub async fn run_reconciliation(State(app_state): State<AppState>) -> ApiResult<ReconciliationReport> {
    respond(app_state.services.reconciliation.run_once().await)
}
