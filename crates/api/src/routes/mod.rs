//! Route assembly

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth;
use crate::state::AppState;

pub mod billing;
pub mod health;
pub mod webhooks;

/// Build the application router
pub fn router(state: AppState) -> Router {
    let authenticated = Router::new()
        .route(
            "/billing/process-payment",
            post(billing::process_payment).get(billing::get_transaction),
        )
        .route("/billing/subscription", post(billing::create_subscription))
        .route(
            "/billing/subscription/change-plan",
            post(billing::change_plan),
        )
        .route(
            "/billing/subscription/cancel",
            post(billing::cancel_subscription),
        )
        .route("/billing/history", get(billing::billing_history))
        .route("/billing/wallet", get(billing::wallet_balance))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    Router::new()
        .merge(authenticated)
        // Webhooks are signature-verified, not token-authenticated
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        .route("/health", get(health::health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
