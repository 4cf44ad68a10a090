//! Stripe client wrapper and configuration
//!
//! The client is constructed explicitly from configuration at startup. When
//! Stripe credentials are absent, `StripeConfig::from_env` returns
//! `BillingError::NotConfigured` and the caller leaves billing disabled
//! instead of crashing.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::events::Product;

/// Stripe price ids for the three purchasable products
#[derive(Debug, Clone)]
pub struct PriceIds {
    pub subscription: String,
    pub credit_pack: String,
    pub founder: String,
}

impl PriceIds {
    /// Price id to put on a checkout line item for the given product
    pub fn for_product(&self, product: Product) -> &str {
        match product {
            Product::Subscription => &self.subscription,
            Product::CreditPack => &self.credit_pack,
            Product::Founder => &self.founder,
        }
    }
}

/// Stripe configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub price_ids: PriceIds,
    pub checkout_success_url: String,
    pub checkout_cancel_url: String,
    pub portal_return_url: String,
}

impl StripeConfig {
    /// Load Stripe configuration from environment variables.
    ///
    /// Returns `NotConfigured` when STRIPE_SECRET_KEY is absent so callers
    /// can run with billing disabled (self-hosted deployments).
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(BillingError::NotConfigured)?;

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET").unwrap_or_default();
        if webhook_secret.is_empty() {
            tracing::warn!("STRIPE_WEBHOOK_SECRET not set - webhook deliveries will be rejected");
        }

        let price_ids = PriceIds {
            subscription: std::env::var("STRIPE_PRICE_SUBSCRIPTION").unwrap_or_default(),
            credit_pack: std::env::var("STRIPE_PRICE_CREDIT_PACK").unwrap_or_default(),
            founder: std::env::var("STRIPE_PRICE_FOUNDER").unwrap_or_default(),
        };

        let app_url =
            std::env::var("APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        Ok(Self {
            secret_key,
            webhook_secret,
            price_ids,
            checkout_success_url: std::env::var("CHECKOUT_SUCCESS_URL")
                .unwrap_or_else(|_| format!("{}/billing/success", app_url)),
            checkout_cancel_url: std::env::var("CHECKOUT_CANCEL_URL")
                .unwrap_or_else(|_| format!("{}/billing/cancel", app_url)),
            portal_return_url: std::env::var("PORTAL_RETURN_URL")
                .unwrap_or_else(|_| format!("{}/account", app_url)),
        })
    }
}

/// Shared Stripe client handle
#[derive(Clone)]
pub struct StripeClient {
    client: stripe::Client,
    config: Arc<StripeConfig>,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let client = stripe::Client::new(config.secret_key.clone());
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    /// The underlying SDK client for API calls
    pub fn inner(&self) -> &stripe::Client {
        &self.client
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> StripeConfig {
        StripeConfig {
            secret_key: "sk_test_abc".to_string(),
            webhook_secret: "whsec_test".to_string(),
            price_ids: PriceIds {
                subscription: "price_sub".to_string(),
                credit_pack: "price_credit".to_string(),
                founder: "price_founder".to_string(),
            },
            checkout_success_url: "http://localhost:3000/billing/success".to_string(),
            checkout_cancel_url: "http://localhost:3000/billing/cancel".to_string(),
            portal_return_url: "http://localhost:3000/account".to_string(),
        }
    }

    #[test]
    fn test_price_id_per_product() {
        let config = test_config();
        assert_eq!(config.price_ids.for_product(Product::Subscription), "price_sub");
        assert_eq!(config.price_ids.for_product(Product::CreditPack), "price_credit");
        assert_eq!(config.price_ids.for_product(Product::Founder), "price_founder");
    }

    #[test]
    fn test_client_exposes_config() {
        let client = StripeClient::new(test_config());
        assert_eq!(client.config().webhook_secret, "whsec_test");
    }
}
