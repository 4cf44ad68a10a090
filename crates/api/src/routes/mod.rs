//! HTTP route definitions

pub mod admin;
pub mod billing;

use axum::routing::{get, post};
use axum::{middleware, Json, Router};
use serde_json::{json, Value};

use crate::auth::{require_admin, require_auth};
use crate::state::AppState;

/// Health check endpoint
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

/// Build the full application router
pub fn create_router(state: AppState) -> Router {
    let auth_state = state.auth_state();

    // Webhook deliveries authenticate via signature, not a session token
    let public = Router::new()
        .route("/health", get(health))
        .route("/api/billing/webhook", post(billing::handle_webhook));

    let authed = Router::new()
        .route("/api/billing/checkout", post(billing::create_checkout))
        .route("/api/billing/confirm", post(billing::confirm_checkout))
        .route("/api/billing/status", get(billing::billing_status))
        .route("/api/billing/sync", post(billing::sync_subscription))
        .route("/api/billing/cancel", post(billing::cancel_subscription))
        .route("/api/billing/portal", post(billing::create_portal))
        .route("/api/billing/credits/consume", post(billing::consume_credit))
        .layer(middleware::from_fn_with_state(
            auth_state.clone(),
            require_auth,
        ));

    let admin = Router::new()
        .route(
            "/api/admin/billing/activate",
            post(admin::activate_subscription),
        )
        .route("/api/admin/billing/cancel", post(admin::cancel_subscription))
        .route(
            "/api/admin/billing/status/{user_id}",
            get(admin::billing_status),
        )
        .route("/api/admin/billing/invariants", get(admin::run_invariants))
        .layer(middleware::from_fn_with_state(auth_state, require_admin));

    public.merge(authed).merge(admin).with_state(state)
}
