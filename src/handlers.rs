use crate::errors::{LedgerError, LedgerResult};
use crate::extract::{AppJson, AppPath, AppQuery};
use crate::ledger::FeeSchedule;
use crate::models::*;
use crate::repository::LedgerRepository;
use axum::{
    extract::State,
    http::StatusCode,
    Json,
};
use rust_decimal::Decimal;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repository: LedgerRepository,
    pub fees: FeeSchedule,
    pub min_payout_amount: Decimal,
}

// === Wallets ===

/// Get a user's wallet, creating an empty one on first access
pub async fn get_wallet(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<WalletResponse>>> {
    tracing::debug!(user_id = %user_id, "Fetching wallet");

    let wallet = state.repository.get_or_create_wallet(&user_id).await?;

    Ok(Json(ApiResponse::success(WalletResponse::from(wallet))))
}

pub async fn get_wallet_history(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> LedgerResult<Json<ApiResponse<Vec<WalletHistory>>>> {
    tracing::debug!(user_id = %user_id, limit = query.limit(), "Fetching wallet history");

    let history = state
        .repository
        .wallet_history(&user_id, query.limit())
        .await?;

    Ok(Json(ApiResponse::success(history)))
}

/// Release pending earnings so they can be withdrawn
pub async fn release_pending(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
    AppJson(payload): AppJson<AmountRequest>,
) -> LedgerResult<Json<ApiResponse<WalletResponse>>> {
    tracing::info!(user_id = %user_id, amount = %payload.amount, "Releasing pending balance");

    let (wallet, _history) = state
        .repository
        .release_pending(&user_id, payload.amount)
        .await?;

    Ok(Json(ApiResponse::success(WalletResponse::from(wallet))))
}

pub async fn reconcile_wallet(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<ReconciliationReport>>> {
    let report = state.repository.reconcile_wallet(&user_id).await?;

    Ok(Json(ApiResponse::success(report)))
}

// === Platform wallet ===

pub async fn get_platform_wallet(
    State(state): State<AppState>,
) -> LedgerResult<Json<ApiResponse<PlatformWallet>>> {
    let wallet = state.repository.platform_wallet().await?;

    Ok(Json(ApiResponse::success(wallet)))
}

pub async fn get_platform_history(
    State(state): State<AppState>,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> LedgerResult<Json<ApiResponse<Vec<PlatformWalletHistory>>>> {
    let history = state.repository.platform_history(query.limit()).await?;

    Ok(Json(ApiResponse::success(history)))
}

/// Withdraw collected fees from the platform wallet
pub async fn withdraw_platform_funds(
    State(state): State<AppState>,
    AppJson(payload): AppJson<AmountRequest>,
) -> LedgerResult<Json<ApiResponse<PlatformWallet>>> {
    tracing::info!(amount = %payload.amount, "Withdrawing platform funds");

    let (wallet, _history) = state
        .repository
        .subtract_platform_funds(payload.amount, payload.description.as_deref())
        .await?;

    Ok(Json(ApiResponse::success(wallet)))
}

// === Tiers and subscriptions ===

pub async fn create_tier(
    State(state): State<AppState>,
    AppJson(payload): AppJson<CreateTierRequest>,
) -> LedgerResult<(StatusCode, Json<ApiResponse<Tier>>)> {
    tracing::info!(creator_id = %payload.creator_id, "Creating tier");

    let tier = state.repository.create_tier(&payload).await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(tier))))
}

pub async fn get_tier(
    State(state): State<AppState>,
    AppPath(tier_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<Tier>>> {
    let tier = state.repository.find_tier(&tier_id).await?;

    Ok(Json(ApiResponse::success(tier)))
}

/// Start a subscription: records a pending payment at the tier's price
pub async fn create_subscription(
    State(state): State<AppState>,
    AppJson(payload): AppJson<CreateSubscriptionRequest>,
) -> LedgerResult<(StatusCode, Json<ApiResponse<Transaction>>)> {
    tracing::info!(
        subscriber_id = %payload.subscriber_id,
        tier_id = %payload.tier_id,
        months = payload.duration.months(),
        "Creating subscription"
    );

    let transaction = state
        .repository
        .create_subscription_transaction(&payload.subscriber_id, &payload.tier_id, payload.duration)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(
            transaction,
            "Awaiting payment confirmation",
        )),
    ))
}

// === Transactions ===

/// Record a tip or purchase
pub async fn create_transaction(
    State(state): State<AppState>,
    AppJson(payload): AppJson<CreateTransactionRequest>,
) -> LedgerResult<(StatusCode, Json<ApiResponse<Transaction>>)> {
    if payload.transaction_type.is_subscription() {
        return Err(LedgerError::Validation(
            "Subscriptions are created through /subscriptions".to_string(),
        ));
    }

    let transaction = state
        .repository
        .create_transaction(NewTransaction {
            sender_id: payload.sender_id,
            receiver_id: payload.receiver_id,
            tier_id: None,
            amount: payload.amount,
            transaction_type: payload.transaction_type,
            purchasable_type: payload.purchasable_type,
            purchasable_id: payload.purchasable_id,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(transaction))))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    AppPath(transaction_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<Transaction>>> {
    let transaction = state.repository.find_transaction(&transaction_id).await?;

    Ok(Json(ApiResponse::success(transaction)))
}

pub async fn get_user_transactions(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> LedgerResult<Json<ApiResponse<Vec<Transaction>>>> {
    let transactions = state
        .repository
        .transactions_for_user(&user_id, query.limit())
        .await?;

    Ok(Json(ApiResponse::success(transactions)))
}

/// Payment gateway confirmed the charge
pub async fn approve_transaction(
    State(state): State<AppState>,
    AppPath(transaction_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<Transaction>>> {
    tracing::info!(transaction_id = %transaction_id, "Approving transaction");

    let transaction = state
        .repository
        .approve_transaction(&transaction_id, state.fees)
        .await?;

    Ok(Json(ApiResponse::success(transaction)))
}

pub async fn decline_transaction(
    State(state): State<AppState>,
    AppPath(transaction_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<Transaction>>> {
    tracing::info!(transaction_id = %transaction_id, "Declining transaction");

    let transaction = state.repository.decline_transaction(&transaction_id).await?;

    Ok(Json(ApiResponse::success(transaction)))
}

pub async fn refund_transaction(
    State(state): State<AppState>,
    AppPath(transaction_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<Transaction>>> {
    tracing::info!(transaction_id = %transaction_id, "Refunding transaction");

    let transaction = state.repository.refund_transaction(&transaction_id).await?;

    Ok(Json(ApiResponse::success(transaction)))
}

// === Payout methods ===

pub async fn list_payout_methods(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<Vec<PayoutMethod>>>> {
    let methods = state.repository.payout_methods_for_user(&user_id).await?;

    Ok(Json(ApiResponse::success(methods)))
}

pub async fn create_payout_method(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
    AppJson(payload): AppJson<CreatePayoutMethodRequest>,
) -> LedgerResult<(StatusCode, Json<ApiResponse<PayoutMethod>>)> {
    let method = state
        .repository
        .create_payout_method(&user_id, &payload)
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(method))))
}

pub async fn set_default_payout_method(
    State(state): State<AppState>,
    AppPath((user_id, method_id)): AppPath<(String, String)>,
) -> LedgerResult<Json<ApiResponse<PayoutMethod>>> {
    let method = state
        .repository
        .set_default_payout_method(&user_id, &method_id)
        .await?;

    Ok(Json(ApiResponse::success(method)))
}

// === Payout requests ===

pub async fn list_payout_requests(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
    AppQuery(query): AppQuery<HistoryQuery>,
) -> LedgerResult<Json<ApiResponse<Vec<PayoutRequest>>>> {
    let payouts = state
        .repository
        .payout_requests_for_user(&user_id, query.limit())
        .await?;

    Ok(Json(ApiResponse::success(payouts)))
}

/// Request a withdrawal; the amount is held until the payout settles
pub async fn create_payout_request(
    State(state): State<AppState>,
    AppPath(user_id): AppPath<String>,
    AppJson(payload): AppJson<CreatePayoutRequest>,
) -> LedgerResult<(StatusCode, Json<ApiResponse<PayoutRequest>>)> {
    tracing::info!(
        user_id = %user_id,
        payout_method_id = %payload.payout_method_id,
        amount = %payload.amount,
        "Requesting payout"
    );

    let payout = state
        .repository
        .create_payout_request(
            &user_id,
            &payload.payout_method_id,
            payload.amount,
            state.min_payout_amount,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::with_message(payout, "Payout request submitted")),
    ))
}

pub async fn process_payout(
    State(state): State<AppState>,
    AppPath(payout_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<PayoutRequest>>> {
    let payout = state.repository.mark_payout_processing(&payout_id).await?;

    Ok(Json(ApiResponse::success(payout)))
}

pub async fn complete_payout(
    State(state): State<AppState>,
    AppPath(payout_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<PayoutRequest>>> {
    let payout = state.repository.mark_payout_processed(&payout_id).await?;

    Ok(Json(ApiResponse::success(payout)))
}

pub async fn fail_payout(
    State(state): State<AppState>,
    AppPath(payout_id): AppPath<String>,
    AppJson(payload): AppJson<FailPayoutRequest>,
) -> LedgerResult<Json<ApiResponse<PayoutRequest>>> {
    tracing::warn!(payout_id = %payout_id, reason = %payload.reason, "Payout failed");

    let payout = state
        .repository
        .mark_payout_failed(&payout_id, &payload.reason)
        .await?;

    Ok(Json(ApiResponse::success(payout)))
}

pub async fn cancel_payout(
    State(state): State<AppState>,
    AppPath(payout_id): AppPath<String>,
) -> LedgerResult<Json<ApiResponse<PayoutRequest>>> {
    let payout = state.repository.cancel_payout_request(&payout_id).await?;

    Ok(Json(ApiResponse::success(payout)))
}

/// Health check endpoint
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "OK")
}
