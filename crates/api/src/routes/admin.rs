//! Admin billing routes
//!
//! Support recovery tools, protected by the admin platform role. Manual
//! activation goes through the same idempotency ledger as the automated
//! paths; manual cancellation bypasses it since deactivation is naturally
//! idempotent. Every override is attributed to the acting admin in the logs.

use axum::extract::{Extension, Path, State};
use axum::Json;
use roost_billing::{InvariantCheckSummary, InvariantChecker, StatusComparison};
use serde::{Deserialize, Serialize};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ActivateRequest {
    pub user_id: String,
    /// Checkout session id to record in the ledger, so a late-arriving
    /// webhook for the same session cannot double-apply
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ActivateResponse {
    pub success: bool,
    pub applied: bool,
}

/// POST /api/admin/billing/activate
pub async fn activate_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(request): Json<ActivateRequest>,
) -> ApiResult<Json<ActivateResponse>> {
    let billing = state
        .billing_service()
        .ok_or(ApiError::BillingNotConfigured)?;

    tracing::warn!(
        admin_id = %admin.user_id,
        target_user = %request.user_id,
        session_id = %request.session_id,
        "Admin manual subscription activation"
    );

    let outcome = billing
        .subscriptions
        .manual_activate(&request.user_id, &request.session_id)
        .await?;

    Ok(Json(ActivateResponse {
        success: true,
        applied: outcome.is_applied(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub subscription_active: bool,
}

/// POST /api/admin/billing/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(admin): Extension<AuthUser>,
    Json(request): Json<CancelRequest>,
) -> ApiResult<Json<CancelResponse>> {
    let billing = state
        .billing_service()
        .ok_or(ApiError::BillingNotConfigured)?;

    tracing::warn!(
        admin_id = %admin.user_id,
        target_user = %request.user_id,
        "Admin manual subscription cancellation"
    );

    let record = billing.subscriptions.manual_cancel(&request.user_id).await?;

    Ok(Json(CancelResponse {
        success: true,
        subscription_active: record.subscription_active,
    }))
}

#[derive(Debug, Serialize)]
pub struct AdminStatusResponse {
    pub success: bool,
    #[serde(flatten)]
    pub comparison: StatusComparison,
}

/// GET /api/admin/billing/status/{user_id}
///
/// Read-only local vs provider comparison; never mutates the record.
pub async fn billing_status(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<AdminStatusResponse>> {
    let billing = state
        .billing_service()
        .ok_or(ApiError::BillingNotConfigured)?;

    let comparison = billing.subscriptions.status_comparison(&user_id).await?;

    Ok(Json(AdminStatusResponse {
        success: true,
        comparison,
    }))
}

#[derive(Debug, Serialize)]
pub struct InvariantsResponse {
    pub success: bool,
    #[serde(flatten)]
    pub summary: InvariantCheckSummary,
}

/// GET /api/admin/billing/invariants
///
/// Runs against the local records only, so it works without Stripe
/// configured.
pub async fn run_invariants(
    State(state): State<AppState>,
) -> ApiResult<Json<InvariantsResponse>> {
    let checker = InvariantChecker::new(state.pool.clone());
    let summary = checker.run_all_checks().await?;

    Ok(Json(InvariantsResponse {
        success: true,
        summary,
    }))
}
