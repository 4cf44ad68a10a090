//! Subscription reconciliation
//!
//! On-demand comparison between the local billing record and the
//! provider-reported subscription state, with corrective update. The mapping
//! itself is a pure function ([`plan_sync`]) so the convergence rules are
//! testable without a Stripe round trip; applying the planned action is a
//! single store write. Running sync twice in a row is a no-op the second time.
//!
//! Manual overrides for support recovery live here too: force-activate goes
//! through the idempotency ledger exactly like the automated paths, while
//! force-cancel deliberately bypasses it (deactivation is naturally
//! idempotent).

use serde::Serialize;
use sqlx::PgPool;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::records::{ApplyOutcome, BillingRecord, BillingRecordStore};

/// Authoritative subscription state as reported by the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderSubscriptionState {
    /// Current and not scheduled for cancellation
    Active,
    /// Still running but set to cancel at period end
    Canceling { canceled_at: OffsetDateTime },
    Canceled,
    Unpaid,
    /// Any other provider status (incomplete, past_due, ...); no local change
    Other(String),
}

impl std::fmt::Display for ProviderSubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderSubscriptionState::Active => write!(f, "active"),
            ProviderSubscriptionState::Canceling { .. } => write!(f, "canceling"),
            ProviderSubscriptionState::Canceled => write!(f, "canceled"),
            ProviderSubscriptionState::Unpaid => write!(f, "unpaid"),
            ProviderSubscriptionState::Other(status) => write!(f, "other:{}", status),
        }
    }
}

/// Corrective action for a local record, derived from provider state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    MarkInactive { canceled_at: OffsetDateTime },
    MarkActive,
    NoChange,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::MarkInactive { .. } => "mark_inactive",
            SyncAction::MarkActive => "mark_active",
            SyncAction::NoChange => "no_change",
        }
    }
}

/// Decide what (if anything) to change on the local record so it matches the
/// provider-reported state. Side-effect free; returns `NoChange` whenever the
/// two already agree, which makes the overall sync idempotent.
pub fn plan_sync(
    record: &BillingRecord,
    provider: &ProviderSubscriptionState,
    now: OffsetDateTime,
) -> SyncAction {
    match provider {
        ProviderSubscriptionState::Canceling { canceled_at } => {
            if record.subscription_active || record.subscription_canceled_at.is_none() {
                SyncAction::MarkInactive {
                    canceled_at: *canceled_at,
                }
            } else {
                SyncAction::NoChange
            }
        }
        ProviderSubscriptionState::Active => {
            if !record.subscription_active || record.subscription_canceled_at.is_some() {
                SyncAction::MarkActive
            } else {
                SyncAction::NoChange
            }
        }
        ProviderSubscriptionState::Canceled | ProviderSubscriptionState::Unpaid => {
            if record.subscription_active || record.subscription_canceled_at.is_none() {
                SyncAction::MarkInactive { canceled_at: now }
            } else {
                SyncAction::NoChange
            }
        }
        ProviderSubscriptionState::Other(_) => SyncAction::NoChange,
    }
}

/// Classify a Stripe subscription object into the reconciliation state space
pub fn classify_subscription(subscription: &stripe::Subscription) -> ProviderSubscriptionState {
    if subscription.cancel_at_period_end {
        let canceled_at = subscription
            .canceled_at
            .or(subscription.cancel_at)
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
            .unwrap_or_else(OffsetDateTime::now_utc);
        return ProviderSubscriptionState::Canceling { canceled_at };
    }

    match subscription.status {
        stripe::SubscriptionStatus::Active | stripe::SubscriptionStatus::Trialing => {
            ProviderSubscriptionState::Active
        }
        stripe::SubscriptionStatus::Canceled | stripe::SubscriptionStatus::IncompleteExpired => {
            ProviderSubscriptionState::Canceled
        }
        stripe::SubscriptionStatus::Unpaid => ProviderSubscriptionState::Unpaid,
        other => ProviderSubscriptionState::Other(format!("{:?}", other).to_lowercase()),
    }
}

/// Result of an on-demand sync
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub provider_status: String,
    pub action_taken: String,
}

/// Read-only local vs provider comparison for debugging; never mutates
#[derive(Debug, Clone, Serialize)]
pub struct StatusComparison {
    pub user_id: String,
    pub local_active: bool,
    pub local_canceled_at: Option<String>,
    pub subscription_provider_ref: Option<String>,
    pub provider_status: Option<String>,
    /// Action sync *would* take; "no_change" means the states agree
    pub pending_action: String,
}

/// Subscription reconciliation service
pub struct SubscriptionService {
    stripe: StripeClient,
    store: BillingRecordStore,
}

impl SubscriptionService {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        Self {
            stripe,
            store: BillingRecordStore::new(pool),
        }
    }

    /// Fetch the authoritative state from the provider and correct the local
    /// record where they disagree.
    pub async fn sync_subscription_status(&self, user_id: &str) -> BillingResult<SyncReport> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::RecordNotFound(user_id.to_string()))?;

        let subscription_ref = record
            .subscription_provider_ref
            .clone()
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        let provider = self.fetch_provider_state(&subscription_ref).await?;
        let action = plan_sync(&record, &provider, OffsetDateTime::now_utc());

        self.apply_action(user_id, &action).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_ref = %subscription_ref,
            provider_status = %provider,
            action = action.as_str(),
            "Subscription sync complete"
        );

        Ok(SyncReport {
            provider_status: provider.to_string(),
            action_taken: action.as_str().to_string(),
        })
    }

    /// Read-only diagnostic view of local vs provider state
    pub async fn status_comparison(&self, user_id: &str) -> BillingResult<StatusComparison> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::RecordNotFound(user_id.to_string()))?;

        let (provider_status, pending_action) = match &record.subscription_provider_ref {
            Some(subscription_ref) => {
                let provider = self.fetch_provider_state(subscription_ref).await?;
                let action = plan_sync(&record, &provider, OffsetDateTime::now_utc());
                (Some(provider.to_string()), action.as_str().to_string())
            }
            None => (None, SyncAction::NoChange.as_str().to_string()),
        };

        Ok(StatusComparison {
            user_id: record.user_id.clone(),
            local_active: record.subscription_active,
            local_canceled_at: format_timestamp(record.subscription_canceled_at),
            subscription_provider_ref: record.subscription_provider_ref.clone(),
            provider_status,
            pending_action,
        })
    }

    /// Support recovery: force-apply the subscription grant for a session id.
    /// Goes through the idempotency ledger exactly like the webhook path, so
    /// repeating it (or racing the real webhook) cannot double-apply.
    pub async fn manual_activate(
        &self,
        user_id: &str,
        session_id: &str,
    ) -> BillingResult<ApplyOutcome> {
        let outcome = self
            .store
            .grant_subscription_once(user_id, session_id, None, None)
            .await?;

        tracing::warn!(
            user_id = %user_id,
            session_id = %session_id,
            applied = outcome.is_applied(),
            "Manual subscription activation"
        );

        Ok(outcome)
    }

    /// Support recovery: unconditionally mark the subscription inactive.
    /// Bypasses the ledger on purpose; setting inactive twice is harmless.
    pub async fn manual_cancel(&self, user_id: &str) -> BillingResult<BillingRecord> {
        let updated = self
            .store
            .mark_inactive(user_id, OffsetDateTime::now_utc())
            .await?;

        if !updated {
            return Err(BillingError::RecordNotFound(user_id.to_string()));
        }

        tracing::warn!(user_id = %user_id, "Manual subscription cancellation");

        self.store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::RecordNotFound(user_id.to_string()))
    }

    /// User-initiated cancellation: flag cancel-at-period-end at the provider
    /// and immediately apply the resulting state locally.
    pub async fn request_cancellation(&self, user_id: &str) -> BillingResult<SyncReport> {
        let record = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| BillingError::RecordNotFound(user_id.to_string()))?;

        let subscription_ref = record
            .subscription_provider_ref
            .clone()
            .ok_or_else(|| BillingError::SubscriptionNotFound(user_id.to_string()))?;

        let subscription_id: stripe::SubscriptionId = subscription_ref
            .parse()
            .map_err(|_| BillingError::InvalidId(subscription_ref.clone()))?;

        let subscription = stripe::Subscription::update(
            self.stripe.inner(),
            &subscription_id,
            stripe::UpdateSubscription {
                cancel_at_period_end: Some(true),
                ..Default::default()
            },
        )
        .await?;

        let provider = classify_subscription(&subscription);
        let action = plan_sync(&record, &provider, OffsetDateTime::now_utc());
        self.apply_action(user_id, &action).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_ref = %subscription_ref,
            provider_status = %provider,
            "Cancellation requested at provider"
        );

        Ok(SyncReport {
            provider_status: provider.to_string(),
            action_taken: action.as_str().to_string(),
        })
    }

    async fn fetch_provider_state(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<ProviderSubscriptionState> {
        let subscription_id: stripe::SubscriptionId = subscription_ref
            .parse()
            .map_err(|_| BillingError::InvalidId(subscription_ref.to_string()))?;

        let subscription =
            stripe::Subscription::retrieve(self.stripe.inner(), &subscription_id, &[]).await?;

        Ok(classify_subscription(&subscription))
    }

    async fn apply_action(&self, user_id: &str, action: &SyncAction) -> BillingResult<()> {
        match action {
            SyncAction::MarkInactive { canceled_at } => {
                self.store.mark_inactive(user_id, *canceled_at).await?;
            }
            SyncAction::MarkActive => {
                self.store.reactivate(user_id).await?;
            }
            SyncAction::NoChange => {}
        }
        Ok(())
    }
}

fn format_timestamp(ts: Option<OffsetDateTime>) -> Option<String> {
    ts.and_then(|t| t.format(&Rfc3339).ok())
}
