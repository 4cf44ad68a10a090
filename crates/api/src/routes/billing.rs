//! Billing routes
//!
//! The webhook endpoint reads the raw request body because signature
//! verification must run over the exact bytes the provider signed. Everything
//! else is JSON in, JSON out behind session auth.
//!
//! Status and credit consumption only touch the local billing records, so
//! they work without Stripe configured; checkout, sync, cancellation, and the
//! portal need the provider and answer 501 when billing is disabled.

use axum::extract::{Extension, State};
use axum::http::HeaderMap;
use axum::Json;
use roost_billing::{BillingRecord, BillingRecordStore, Product};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use time::OffsetDateTime;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn billing_service(state: &AppState) -> ApiResult<&Arc<roost_billing::BillingService>> {
    state.billing_service().ok_or(ApiError::BillingNotConfigured)
}

// =============================================================================
// Webhook ingestion
// =============================================================================

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
}

/// POST /api/billing/webhook
///
/// Body must stay unparsed until the signature is verified.
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<WebhookAck>> {
    let billing = billing_service(&state)?;

    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::SignatureInvalid)?;

    let event = billing.webhooks.verify_event(&body, signature)?;
    billing.webhooks.handle_event(event).await?;

    Ok(Json(WebhookAck { received: true }))
}

// =============================================================================
// Checkout
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub product: String,
}

#[derive(Debug, Serialize)]
pub struct CreateCheckoutResponse {
    pub success: bool,
    pub session_id: String,
    pub url: String,
}

/// POST /api/billing/checkout
pub async fn create_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CreateCheckoutResponse>> {
    let billing = billing_service(&state)?;

    let product = Product::from_str(&request.product)
        .ok_or_else(|| ApiError::BadRequest(format!("unknown product: {}", request.product)))?;

    let redirect = billing
        .checkout
        .create_checkout(&user.user_id, product)
        .await?;

    Ok(Json(CreateCheckoutResponse {
        success: true,
        session_id: redirect.session_id,
        url: redirect.url,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ConfirmCheckoutRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ConfirmCheckoutResponse {
    pub success: bool,
    pub product: Product,
    /// False when the webhook already applied this purchase
    pub applied: bool,
}

/// POST /api/billing/confirm
pub async fn confirm_checkout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(request): Json<ConfirmCheckoutRequest>,
) -> ApiResult<Json<ConfirmCheckoutResponse>> {
    let billing = billing_service(&state)?;

    let report = billing
        .checkout
        .confirm_session(&user.user_id, &request.session_id)
        .await?;

    Ok(Json(ConfirmCheckoutResponse {
        success: true,
        product: report.product,
        applied: report.applied,
    }))
}

// =============================================================================
// Status and credits (local record only, no provider round trip)
// =============================================================================

#[derive(Debug, Serialize)]
pub struct BillingStatusResponse {
    pub success: bool,
    pub user_id: String,
    pub subscription_active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_since: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub subscription_canceled_at: Option<OffsetDateTime>,
    pub credit_balance: i32,
    pub founder: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub founder_since: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_at: Option<OffsetDateTime>,
}

impl BillingStatusResponse {
    fn from_record(record: BillingRecord) -> Self {
        Self {
            success: true,
            user_id: record.user_id,
            subscription_active: record.subscription_active,
            subscription_since: record.subscription_since,
            subscription_canceled_at: record.subscription_canceled_at,
            credit_balance: record.credit_balance,
            founder: record.founder,
            founder_since: record.founder_since,
            last_payment_at: record.last_payment_at,
        }
    }

    /// A user with no billing record has purchased nothing yet
    fn empty(user_id: String) -> Self {
        Self {
            success: true,
            user_id,
            subscription_active: false,
            subscription_since: None,
            subscription_canceled_at: None,
            credit_balance: 0,
            founder: false,
            founder_since: None,
            last_payment_at: None,
        }
    }
}

/// GET /api/billing/status
pub async fn billing_status(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<BillingStatusResponse>> {
    let store = BillingRecordStore::new(state.pool.clone());

    let response = match store.get(&user.user_id).await? {
        Some(record) => BillingStatusResponse::from_record(record),
        None => BillingStatusResponse::empty(user.user_id),
    };

    Ok(Json(response))
}

#[derive(Debug, Serialize)]
pub struct ConsumeCreditResponse {
    pub success: bool,
    pub credit_balance: i32,
}

/// POST /api/billing/credits/consume
pub async fn consume_credit(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<ConsumeCreditResponse>> {
    let store = BillingRecordStore::new(state.pool.clone());
    let remaining = store.consume_credit(&user.user_id).await?;

    Ok(Json(ConsumeCreditResponse {
        success: true,
        credit_balance: remaining,
    }))
}

// =============================================================================
// Subscription sync and cancellation
// =============================================================================

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub success: bool,
    pub provider_status: String,
    pub action_taken: String,
}

/// POST /api/billing/sync
pub async fn sync_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SyncResponse>> {
    let billing = billing_service(&state)?;
    let report = billing
        .subscriptions
        .sync_subscription_status(&user.user_id)
        .await?;

    Ok(Json(SyncResponse {
        success: true,
        provider_status: report.provider_status,
        action_taken: report.action_taken,
    }))
}

/// POST /api/billing/cancel
pub async fn cancel_subscription(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<SyncResponse>> {
    let billing = billing_service(&state)?;
    let report = billing
        .subscriptions
        .request_cancellation(&user.user_id)
        .await?;

    Ok(Json(SyncResponse {
        success: true,
        provider_status: report.provider_status,
        action_taken: report.action_taken,
    }))
}

// =============================================================================
// Billing portal
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub success: bool,
    pub url: String,
}

/// POST /api/billing/portal
pub async fn create_portal(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
) -> ApiResult<Json<PortalResponse>> {
    let billing = billing_service(&state)?;
    let redirect = billing.portal.create_portal_session(&user.user_id).await?;

    Ok(Json(PortalResponse {
        success: true,
        url: redirect.url,
    }))
}
