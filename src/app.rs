use crate::config::Config;
use crate::handlers::{self, AppState};
use crate::middleware::cors::OriginPolicy;
use crate::middleware::rate_limit::{rate_limit_middleware, RateLimiter};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Build the HTTP router with rate limiting, CORS and request tracing.
pub fn create_router(state: AppState, config: &Config) -> Router {
    let limiter = Arc::new(RateLimiter::per_minute(
        config.rate_limit_per_minute,
        config.rate_limit_failure_policy,
        config.retry.clone(),
    ));

    Router::new()
        .route("/health", get(handlers::health_check))
        // Creator wallets
        .route("/users/:user_id/wallet", get(handlers::get_wallet))
        .route("/users/:user_id/wallet/history", get(handlers::get_wallet_history))
        .route("/users/:user_id/wallet/release", post(handlers::release_pending))
        .route("/users/:user_id/wallet/reconcile", get(handlers::reconcile_wallet))
        // Platform wallet
        .route("/platform-wallet", get(handlers::get_platform_wallet))
        .route("/platform-wallet/history", get(handlers::get_platform_history))
        .route("/platform-wallet/withdraw", post(handlers::withdraw_platform_funds))
        // Tiers and payments
        .route("/tiers", post(handlers::create_tier))
        .route("/tiers/:tier_id", get(handlers::get_tier))
        .route("/subscriptions", post(handlers::create_subscription))
        .route("/transactions", post(handlers::create_transaction))
        .route("/transactions/:transaction_id", get(handlers::get_transaction))
        .route("/users/:user_id/transactions", get(handlers::get_user_transactions))
        .route("/transactions/:transaction_id/approve", post(handlers::approve_transaction))
        .route("/transactions/:transaction_id/decline", post(handlers::decline_transaction))
        .route("/transactions/:transaction_id/refund", post(handlers::refund_transaction))
        // Payouts
        .route(
            "/users/:user_id/payout-methods",
            get(handlers::list_payout_methods).post(handlers::create_payout_method),
        )
        .route(
            "/users/:user_id/payout-methods/:method_id/default",
            post(handlers::set_default_payout_method),
        )
        .route(
            "/users/:user_id/payout-requests",
            get(handlers::list_payout_requests).post(handlers::create_payout_request),
        )
        .route("/payout-requests/:payout_id/process", post(handlers::process_payout))
        .route("/payout-requests/:payout_id/complete", post(handlers::complete_payout))
        .route("/payout-requests/:payout_id/fail", post(handlers::fail_payout))
        .route("/payout-requests/:payout_id/cancel", post(handlers::cancel_payout))
        .with_state(state)
        .layer(middleware::from_fn_with_state(limiter, rate_limit_middleware))
        .layer(OriginPolicy::new(config.cors_allowed_origins.clone()).into_layer())
        .layer(TraceLayer::new_for_http())
}
