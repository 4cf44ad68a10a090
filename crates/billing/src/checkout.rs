//! Checkout session creation and confirmation
//!
//! Checkout is hosted by the provider: we create a session pointing at one of
//! the configured prices and redirect the user there. Entitlements are granted
//! when the provider tells us the session completed, either via webhook or via
//! the confirmation poll the success page performs. Both paths apply the
//! purchase keyed on the *session id*, so whichever arrives second is a
//! recorded no-op.

use std::collections::HashMap;

use serde::Serialize;
use sqlx::PgPool;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::Product;
use crate::records::{ApplyOutcome, BillingRecordStore};

/// A newly created hosted-checkout session
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRedirect {
    pub session_id: String,
    /// Provider-hosted payment page to send the user to
    pub url: String,
}

/// Result of confirming a session from the success page
#[derive(Debug, Clone, Serialize)]
pub struct ConfirmReport {
    pub session_id: String,
    pub product: Product,
    /// False when the purchase had already been applied (webhook won the race)
    pub applied: bool,
}

/// Hosted checkout: session creation and post-payment confirmation
pub struct CheckoutService {
    stripe: StripeClient,
    store: BillingRecordStore,
}

impl CheckoutService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            stripe,
            store: BillingRecordStore::new(pool),
        }
    }

    /// Create a hosted checkout session for one of the three products.
    ///
    /// The purchasing user and product are carried in the session metadata so
    /// the webhook handler can reconcile without any extra lookup;
    /// `client_reference_id` duplicates the user id as a fallback.
    pub async fn create_checkout(
        &self,
        user_id: &str,
        product: Product,
    ) -> BillingResult<CheckoutRedirect> {
        let config = self.stripe.config();
        let price_id = config.price_ids.for_product(product).to_string();

        let mut params = stripe::CreateCheckoutSession::new();
        params.mode = Some(match product {
            Product::Subscription => stripe::CheckoutSessionMode::Subscription,
            Product::CreditPack | Product::Founder => stripe::CheckoutSessionMode::Payment,
        });
        params.line_items = Some(vec![stripe::CreateCheckoutSessionLineItems {
            price: Some(price_id),
            quantity: Some(1),
            ..Default::default()
        }]);
        params.success_url = Some(&config.checkout_success_url);
        params.cancel_url = Some(&config.checkout_cancel_url);
        params.client_reference_id = Some(user_id);
        params.metadata = Some(HashMap::from([
            ("user_id".to_string(), user_id.to_string()),
            ("product".to_string(), product.as_str().to_string()),
        ]));

        // Reuse the provider customer when we already know it, so purchases
        // land on one customer object instead of accumulating duplicates
        if let Some(record) = self.store.get(user_id).await? {
            if let Some(customer_ref) = record.provider_customer_ref {
                let customer_id: stripe::CustomerId = customer_ref
                    .parse()
                    .map_err(|_| BillingError::InvalidId(customer_ref.clone()))?;
                params.customer = Some(customer_id);
            }
        }

        let session = stripe::CheckoutSession::create(self.stripe.inner(), params).await?;

        let url = session
            .url
            .clone()
            .ok_or_else(|| BillingError::Internal("checkout session has no URL".to_string()))?;

        tracing::info!(
            user_id = %user_id,
            product = %product,
            session_id = %session.id,
            "Created checkout session"
        );

        Ok(CheckoutRedirect {
            session_id: session.id.to_string(),
            url,
        })
    }

    /// Confirm a checkout session from the success page and apply the
    /// purchase. Safe to call any number of times and concurrently with the
    /// webhook: the session id is the idempotency key for both.
    pub async fn confirm_session(
        &self,
        caller_user_id: &str,
        session_id: &str,
    ) -> BillingResult<ConfirmReport> {
        let parsed_id: stripe::CheckoutSessionId = session_id
            .parse()
            .map_err(|_| BillingError::InvalidId(session_id.to_string()))?;

        let session =
            stripe::CheckoutSession::retrieve(self.stripe.inner(), &parsed_id, &[]).await?;

        if !session_is_paid(&session) {
            return Err(BillingError::SessionNotCompleted(session_id.to_string()));
        }

        let metadata = session.metadata.clone().unwrap_or_default();

        // Prefer the metadata written at session creation; fall back to the
        // client reference, then to the authenticated caller
        let user_id = metadata
            .get("user_id")
            .cloned()
            .or_else(|| session.client_reference_id.clone())
            .unwrap_or_else(|| caller_user_id.to_string());

        let product = metadata
            .get("product")
            .and_then(|p| Product::from_str(p))
            .ok_or_else(|| {
                BillingError::Internal(format!(
                    "checkout session {} has no recognizable product metadata",
                    session_id
                ))
            })?;

        let subscription_ref = session.subscription.as_ref().map(|s| s.id().to_string());
        let customer_ref = session.customer.as_ref().map(|c| c.id().to_string());

        let outcome = self
            .store
            .apply_product(
                &user_id,
                product,
                session_id,
                subscription_ref.as_deref(),
                customer_ref.as_deref(),
            )
            .await?;

        if let ApplyOutcome::AlreadyProcessed = outcome {
            tracing::info!(
                user_id = %user_id,
                session_id = %session_id,
                "Checkout confirmation found purchase already applied"
            );
        }

        Ok(ConfirmReport {
            session_id: session_id.to_string(),
            product,
            applied: outcome.is_applied(),
        })
    }
}

fn session_is_paid(session: &stripe::CheckoutSession) -> bool {
    payment_settled(session.payment_status)
}

/// `no_payment_required` covers 100%-discount and free-trial sessions; the
/// provider reports those completed without a charge.
fn payment_settled(status: stripe::CheckoutSessionPaymentStatus) -> bool {
    matches!(
        status,
        stripe::CheckoutSessionPaymentStatus::Paid
            | stripe::CheckoutSessionPaymentStatus::NoPaymentRequired
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use stripe::CheckoutSessionPaymentStatus;

    #[test]
    fn test_settled_statuses_grant_entitlement() {
        assert!(payment_settled(CheckoutSessionPaymentStatus::Paid));
        assert!(payment_settled(CheckoutSessionPaymentStatus::NoPaymentRequired));
    }

    #[test]
    fn test_unpaid_session_is_not_settled() {
        // An open session confirmed early must come back as a conflict, not
        // a grant
        assert!(!payment_settled(CheckoutSessionPaymentStatus::Unpaid));
    }
}
