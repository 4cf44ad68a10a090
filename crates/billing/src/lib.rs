// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::field_reassign_with_default)] // Used for conditional struct field setting
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Roost Billing Module
//!
//! Handles Stripe integration for entitlements: subscriptions, listing
//! credits, and founder grants.
//!
//! ## Features
//!
//! - **Checkout**: Hosted checkout sessions for the three products, plus
//!   post-payment confirmation from the success page
//! - **Webhooks**: Signature-verified Stripe event ingestion with
//!   at-most-once application per checkout session
//! - **Reconciliation**: On-demand sync of local subscription state against
//!   the provider, and manual support overrides
//! - **Portal**: Provider-hosted billing management
//! - **Invariants**: Runnable consistency checks over billing records

pub mod checkout;
pub mod client;
pub mod error;
pub mod events;
pub mod invariants;
pub mod portal;
pub mod records;
pub mod subscriptions;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;

// Checkout
pub use checkout::{CheckoutRedirect, CheckoutService, ConfirmReport};

// Client
pub use client::{PriceIds, StripeClient, StripeConfig};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{CheckoutCompleted, InvoicePayment, Product, ProviderEvent, SubscriptionChanged};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Portal
pub use portal::{PortalRedirect, PortalService};

// Records
pub use records::{ApplyOutcome, BillingRecord, BillingRecordStore};

// Subscriptions
pub use subscriptions::{
    plan_sync, ProviderSubscriptionState, StatusComparison, SubscriptionService, SyncAction,
    SyncReport,
};

// Webhooks
pub use webhooks::{verify_signature, WebhookHandler};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub checkout: CheckoutService,
    pub portal: PortalService,
    pub records: BillingRecordStore,
    pub subscriptions: SubscriptionService,
    pub webhooks: WebhookHandler,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let stripe = StripeClient::from_env()?;
        Ok(Self::with_client(stripe, pool))
    }

    /// Create a new billing service with explicit config
    pub fn new(config: StripeConfig, pool: PgPool) -> Self {
        Self::with_client(StripeClient::new(config), pool)
    }

    fn with_client(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            checkout: CheckoutService::new(stripe.clone(), pool.clone()),
            portal: PortalService::new(stripe.clone(), pool.clone()),
            records: BillingRecordStore::new(pool.clone()),
            subscriptions: SubscriptionService::new(stripe.clone(), pool.clone()),
            webhooks: WebhookHandler::new(stripe, pool.clone()),
            invariants: InvariantChecker::new(pool),
        }
    }
}
