//! API error types and HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use roost_billing::BillingError;
use serde_json::json;
use thiserror::Error;

/// Errors surfaced to HTTP clients
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Forbidden")]
    Forbidden,

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Billing is not configured")]
    BillingNotConfigured,

    #[error("Checkout session is not completed")]
    SessionNotCompleted,

    #[error("Insufficient credits")]
    InsufficientCredits,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Billing provider error: {0}")]
    Provider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::AuthenticationRequired => {
                (StatusCode::UNAUTHORIZED, "authentication_required")
            }
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::SignatureInvalid => (StatusCode::BAD_REQUEST, "signature_invalid"),
            ApiError::BillingNotConfigured => {
                (StatusCode::NOT_IMPLEMENTED, "billing_not_configured")
            }
            ApiError::SessionNotCompleted => (StatusCode::CONFLICT, "session_not_completed"),
            ApiError::InsufficientCredits => (StatusCode::CONFLICT, "insufficient_credits"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::Provider(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
            ApiError::Database(_) | ApiError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // 5xx details stay in the logs, not the response body
        let message = if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
            "Internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "success": false,
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookSignatureInvalid => ApiError::SignatureInvalid,
            BillingError::WebhookEventNotSupported(msg) => ApiError::BadRequest(msg),
            BillingError::SessionNotCompleted(_) => ApiError::SessionNotCompleted,
            BillingError::InsufficientCredits(_) => ApiError::InsufficientCredits,
            BillingError::RecordNotFound(user) => {
                ApiError::NotFound(format!("no billing record for user {}", user))
            }
            BillingError::SubscriptionNotFound(user) => {
                ApiError::NotFound(format!("no subscription on record for user {}", user))
            }
            BillingError::CustomerNotFound(user) => {
                ApiError::NotFound(format!("no provider customer for user {}", user))
            }
            BillingError::NotConfigured => ApiError::BillingNotConfigured,
            BillingError::InvalidId(id) => {
                ApiError::BadRequest(format!("invalid provider identifier: {}", id))
            }
            // A provider 404 means the referenced object is gone, not that
            // the provider is unavailable
            BillingError::Stripe(stripe::StripeError::Stripe(req_err))
                if req_err.http_status == 404 =>
            {
                ApiError::NotFound("billing provider object not found".to_string())
            }
            BillingError::Stripe(e) => ApiError::Provider(e.to_string()),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        ApiError::Database(e.to_string())
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
