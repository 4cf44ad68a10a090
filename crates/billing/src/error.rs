//! Billing error types

use thiserror::Error;

/// Errors produced by the billing subsystem
#[derive(Debug, Error)]
pub enum BillingError {
    /// Outbound Stripe API call failed
    #[error("Stripe API error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Database error: {0}")]
    Database(String),

    /// Webhook signature missing, malformed, or mismatched.
    /// No state is mutated when this is returned.
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    /// Event carried an object shape we couldn't use
    #[error("Webhook event not supported: {0}")]
    WebhookEventNotSupported(String),

    /// Checkout session exists but hasn't reached a paid/complete state
    #[error("Checkout session {0} is not completed")]
    SessionNotCompleted(String),

    /// No billing record exists for the user
    #[error("No billing record for user {0}")]
    RecordNotFound(String),

    /// Record exists but carries no provider subscription reference
    #[error("No provider subscription on record for user {0}")]
    SubscriptionNotFound(String),

    /// Record exists but carries no provider customer reference
    #[error("No provider customer on record for user {0}")]
    CustomerNotFound(String),

    /// Credit consumption requested with a zero balance
    #[error("Insufficient credit balance for user {0}")]
    InsufficientCredits(String),

    /// Stripe credentials absent; billing is disabled, not broken
    #[error("Stripe is not configured")]
    NotConfigured,

    /// A provider-issued identifier failed to parse
    #[error("Invalid provider identifier: {0}")]
    InvalidId(String),

    #[error("Internal billing error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages_carry_no_secrets() {
        let e = BillingError::WebhookSignatureInvalid;
        assert_eq!(e.to_string(), "Webhook signature verification failed");

        let e = BillingError::SessionNotCompleted("cs_test_123".to_string());
        assert!(e.to_string().contains("cs_test_123"));
    }

    #[test]
    fn test_sqlx_error_maps_to_database() {
        let e: BillingError = sqlx::Error::RowNotFound.into();
        assert!(matches!(e, BillingError::Database(_)));
    }
}
