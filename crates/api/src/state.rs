//! Application state

use sqlx::PgPool;
use std::sync::Arc;

use crate::auth::{AuthState, JwtManager};
use crate::config::Config;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub jwt_manager: JwtManager,
    /// Billing service; None when Stripe is not configured (self-hosted
    /// deployments run without it and billing routes answer 501)
    pub billing: Option<Arc<roost_billing::BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let jwt_manager = JwtManager::new(&config.jwt_secret, config.jwt_expiry_hours);

        let billing = if config.enable_billing {
            match roost_billing::BillingService::from_env(pool.clone()) {
                Ok(svc) => {
                    tracing::info!("Stripe billing service initialized");
                    Some(Arc::new(svc))
                }
                Err(e) => {
                    tracing::warn!("Stripe billing not configured: {}", e);
                    None
                }
            }
        } else {
            tracing::info!("Billing disabled via config (ENABLE_BILLING=false)");
            None
        };

        Self {
            pool,
            config,
            jwt_manager,
            billing,
        }
    }

    /// Get auth state for middleware
    pub fn auth_state(&self) -> AuthState {
        AuthState {
            jwt_manager: self.jwt_manager.clone(),
        }
    }

    /// Get billing service reference
    pub fn billing_service(&self) -> Option<&Arc<roost_billing::BillingService>> {
        self.billing.as_ref()
    }
}
