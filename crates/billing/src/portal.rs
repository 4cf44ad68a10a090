//! Provider-hosted billing portal
//!
//! Users manage payment methods and invoices on the provider's portal rather
//! than in our UI. Requires a stored provider customer reference, which is
//! captured the first time any purchase completes.

use serde::Serialize;
use sqlx::PgPool;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::records::BillingRecordStore;

#[derive(Debug, Clone, Serialize)]
pub struct PortalRedirect {
    pub url: String,
}

pub struct PortalService {
    stripe: StripeClient,
    store: BillingRecordStore,
}

impl PortalService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            stripe,
            store: BillingRecordStore::new(pool),
        }
    }

    /// Create a portal session for the user's provider customer
    pub async fn create_portal_session(&self, user_id: &str) -> BillingResult<PortalRedirect> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::RecordNotFound(user_id.to_string()))?;

        let customer_ref = record
            .provider_customer_ref
            .ok_or_else(|| BillingError::CustomerNotFound(user_id.to_string()))?;

        let customer_id: stripe::CustomerId = customer_ref
            .parse()
            .map_err(|_| BillingError::InvalidId(customer_ref.clone()))?;

        let mut params = stripe::CreateBillingPortalSession::new(customer_id);
        let return_url = self.stripe.config().portal_return_url.clone();
        params.return_url = Some(&return_url);

        let session = stripe::BillingPortalSession::create(self.stripe.inner(), params).await?;

        tracing::info!(user_id = %user_id, "Created billing portal session");

        Ok(PortalRedirect { url: session.url })
    }
}
