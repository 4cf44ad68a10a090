//! Billing record store
//!
//! One `billing_records` row per user holds the full entitlement state:
//! subscription flags, credit balance, founder grant, and the
//! `processed_events` idempotency ledger.
//!
//! Every guarded mutation is a single `INSERT ... ON CONFLICT ... DO UPDATE
//! ... WHERE NOT processed_events @> ARRAY[id] RETURNING` statement, so the
//! membership check, the mutation, and the ledger append commit atomically.
//! Two concurrent deliveries of the same event race on that one statement and
//! exactly one of them gets a row back. A read-then-write sequence here would
//! reopen the double-apply window under concurrent webhook retries.

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::Product;

/// Persistent per-user entitlement state
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BillingRecord {
    pub user_id: String,
    pub subscription_active: bool,
    pub subscription_since: Option<OffsetDateTime>,
    pub subscription_canceled_at: Option<OffsetDateTime>,
    pub subscription_provider_ref: Option<String>,
    pub provider_customer_ref: Option<String>,
    pub credit_balance: i32,
    pub last_payment_at: Option<OffsetDateTime>,
    pub processed_events: Vec<String>,
    pub founder: bool,
    pub founder_since: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Result of a guarded apply-once mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Mutation committed and the id joined the ledger
    Applied,
    /// Id was already in the ledger; nothing changed
    AlreadyProcessed,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied)
    }
}

/// Store for billing records. All writes go through here.
#[derive(Clone)]
pub struct BillingRecordStore {
    pool: PgPool,
}

impl BillingRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, user_id: &str) -> BillingResult<Option<BillingRecord>> {
        let record = sqlx::query_as::<_, BillingRecord>(
            "SELECT * FROM billing_records WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn get_by_subscription_ref(
        &self,
        subscription_ref: &str,
    ) -> BillingResult<Option<BillingRecord>> {
        let record = sqlx::query_as::<_, BillingRecord>(
            "SELECT * FROM billing_records WHERE subscription_provider_ref = $1",
        )
        .bind(subscription_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Apply a purchased product to the user's record, at most once per
    /// `session_or_event_id`. Both the webhook path and the confirmation
    /// poll call this with the checkout *session* id, so the two paths
    /// dedupe against each other.
    pub async fn apply_product(
        &self,
        user_id: &str,
        product: Product,
        session_or_event_id: &str,
        subscription_ref: Option<&str>,
        customer_ref: Option<&str>,
    ) -> BillingResult<ApplyOutcome> {
        let outcome = match product {
            Product::Subscription => {
                self.grant_subscription_once(
                    user_id,
                    session_or_event_id,
                    subscription_ref,
                    customer_ref,
                )
                .await?
            }
            Product::CreditPack => {
                self.add_credit_once(user_id, session_or_event_id, customer_ref)
                    .await?
            }
            Product::Founder => {
                self.grant_founder_once(user_id, session_or_event_id, customer_ref)
                    .await?
            }
        };

        tracing::info!(
            user_id = %user_id,
            product = %product,
            session_or_event_id = %session_or_event_id,
            outcome = ?outcome,
            "Applied product mutation"
        );

        Ok(outcome)
    }

    /// Grant the recurring subscription entitlement, guarded by the ledger
    pub async fn grant_subscription_once(
        &self,
        user_id: &str,
        session_or_event_id: &str,
        subscription_ref: Option<&str>,
        customer_ref: Option<&str>,
    ) -> BillingResult<ApplyOutcome> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_records (
                user_id, subscription_active, subscription_since, subscription_canceled_at,
                subscription_provider_ref, provider_customer_ref, last_payment_at,
                processed_events
            )
            VALUES ($1, TRUE, NOW(), NULL, $3, $4, NOW(), ARRAY[$2::TEXT])
            ON CONFLICT (user_id) DO UPDATE SET
                subscription_active = TRUE,
                subscription_since = NOW(),
                subscription_canceled_at = NULL,
                subscription_provider_ref =
                    COALESCE($3, billing_records.subscription_provider_ref),
                provider_customer_ref =
                    COALESCE($4, billing_records.provider_customer_ref),
                last_payment_at = NOW(),
                processed_events = array_append(billing_records.processed_events, $2),
                updated_at = NOW()
            WHERE NOT billing_records.processed_events @> ARRAY[$2::TEXT]
            RETURNING user_id
            "#,
        )
        .bind(user_id)
        .bind(session_or_event_id)
        .bind(subscription_ref)
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed(row))
    }

    /// Increment the credit balance by one, guarded by the ledger
    pub async fn add_credit_once(
        &self,
        user_id: &str,
        session_or_event_id: &str,
        customer_ref: Option<&str>,
    ) -> BillingResult<ApplyOutcome> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_records (
                user_id, credit_balance, provider_customer_ref, last_payment_at,
                processed_events
            )
            VALUES ($1, 1, $3, NOW(), ARRAY[$2::TEXT])
            ON CONFLICT (user_id) DO UPDATE SET
                credit_balance = billing_records.credit_balance + 1,
                provider_customer_ref =
                    COALESCE($3, billing_records.provider_customer_ref),
                last_payment_at = NOW(),
                processed_events = array_append(billing_records.processed_events, $2),
                updated_at = NOW()
            WHERE NOT billing_records.processed_events @> ARRAY[$2::TEXT]
            RETURNING user_id
            "#,
        )
        .bind(user_id)
        .bind(session_or_event_id)
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed(row))
    }

    /// Set the founder grant, guarded by the ledger. `founder_since` is
    /// preserved if a later purchase re-grants it.
    pub async fn grant_founder_once(
        &self,
        user_id: &str,
        session_or_event_id: &str,
        customer_ref: Option<&str>,
    ) -> BillingResult<ApplyOutcome> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_records (
                user_id, founder, founder_since, provider_customer_ref, last_payment_at,
                processed_events
            )
            VALUES ($1, TRUE, NOW(), $3, NOW(), ARRAY[$2::TEXT])
            ON CONFLICT (user_id) DO UPDATE SET
                founder = TRUE,
                founder_since = COALESCE(billing_records.founder_since, NOW()),
                provider_customer_ref =
                    COALESCE($3, billing_records.provider_customer_ref),
                last_payment_at = NOW(),
                processed_events = array_append(billing_records.processed_events, $2),
                updated_at = NOW()
            WHERE NOT billing_records.processed_events @> ARRAY[$2::TEXT]
            RETURNING user_id
            "#,
        )
        .bind(user_id)
        .bind(session_or_event_id)
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed(row))
    }

    /// Record a successful recurring payment. Only touches records that are
    /// currently active; setting `last_payment_at` to now is idempotent by
    /// construction, so no ledger guard is needed.
    pub async fn record_payment(&self, subscription_ref: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_records
            SET last_payment_at = NOW(), updated_at = NOW()
            WHERE subscription_provider_ref = $1
              AND subscription_active = TRUE
            "#,
        )
        .bind(subscription_ref)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Mark the subscription inactive with a cancellation timestamp.
    /// Unguarded: deactivation is naturally idempotent.
    pub async fn mark_inactive(
        &self,
        user_id: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_records
            SET subscription_active = FALSE,
                subscription_canceled_at = $2,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(canceled_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_inactive_by_subscription(
        &self,
        subscription_ref: &str,
        canceled_at: OffsetDateTime,
    ) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_records
            SET subscription_active = FALSE,
                subscription_canceled_at = $2,
                updated_at = NOW()
            WHERE subscription_provider_ref = $1
            "#,
        )
        .bind(subscription_ref)
        .bind(canceled_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Reactivate a subscription the provider reports as current.
    /// Clears any stale cancellation timestamp.
    pub async fn reactivate(&self, user_id: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_records
            SET subscription_active = TRUE,
                subscription_canceled_at = NULL,
                subscription_since = COALESCE(subscription_since, NOW()),
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn reactivate_by_subscription(&self, subscription_ref: &str) -> BillingResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE billing_records
            SET subscription_active = TRUE,
                subscription_canceled_at = NULL,
                subscription_since = COALESCE(subscription_since, NOW()),
                updated_at = NOW()
            WHERE subscription_provider_ref = $1
            "#,
        )
        .bind(subscription_ref)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Consume one credit. Atomic: decrements only where a positive balance
    /// exists, so concurrent consumers can't drive the balance negative.
    pub async fn consume_credit(&self, user_id: &str) -> BillingResult<i32> {
        let row: Option<(i32,)> = sqlx::query_as(
            r#"
            UPDATE billing_records
            SET credit_balance = credit_balance - 1, updated_at = NOW()
            WHERE user_id = $1 AND credit_balance > 0
            RETURNING credit_balance
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((remaining,)) => Ok(remaining),
            None => Err(BillingError::InsufficientCredits(user_id.to_string())),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn claimed(row: Option<(String,)>) -> ApplyOutcome {
    if row.is_some() {
        ApplyOutcome::Applied
    } else {
        ApplyOutcome::AlreadyProcessed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_outcome_predicates() {
        assert!(ApplyOutcome::Applied.is_applied());
        assert!(!ApplyOutcome::AlreadyProcessed.is_applied());
    }

    #[test]
    fn test_claimed_maps_row_presence() {
        assert_eq!(
            claimed(Some(("user_1".to_string(),))),
            ApplyOutcome::Applied
        );
        assert_eq!(claimed(None), ApplyOutcome::AlreadyProcessed);
    }

    // Database-backed checks of the guarded ledger statements. Each test
    // runs against its own migrated database.

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_replayed_credit_session_applies_once(pool: PgPool) {
        let store = BillingRecordStore::new(pool);

        let first = store
            .apply_product("user_1", Product::CreditPack, "cs_replay", None, Some("cus_1"))
            .await
            .unwrap();
        assert_eq!(first, ApplyOutcome::Applied);

        // Same session id again, as a webhook retry would deliver it
        let second = store
            .apply_product("user_1", Product::CreditPack, "cs_replay", None, Some("cus_1"))
            .await
            .unwrap();
        assert_eq!(second, ApplyOutcome::AlreadyProcessed);

        let record = store.get("user_1").await.unwrap().unwrap();
        assert_eq!(record.credit_balance, 1);
        assert_eq!(record.processed_events, vec!["cs_replay".to_string()]);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_replayed_subscription_grant_applies_once(pool: PgPool) {
        let store = BillingRecordStore::new(pool);

        let first = store
            .grant_subscription_once("user_1", "cs_sub", Some("sub_1"), Some("cus_1"))
            .await
            .unwrap();
        assert!(first.is_applied());

        let after_first = store.get("user_1").await.unwrap().unwrap();
        let since = after_first.subscription_since;
        assert!(after_first.subscription_active);
        assert!(since.is_some());

        let second = store
            .grant_subscription_once("user_1", "cs_sub", Some("sub_1"), Some("cus_1"))
            .await
            .unwrap();
        assert!(!second.is_applied());

        let record = store.get("user_1").await.unwrap().unwrap();
        assert_eq!(record.processed_events, vec!["cs_sub".to_string()]);
        // The guarded statement did not run, so the start date is untouched
        assert_eq!(record.subscription_since, since);
        assert_eq!(record.subscription_provider_ref.as_deref(), Some("sub_1"));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_distinct_sessions_accumulate_credits(pool: PgPool) {
        let store = BillingRecordStore::new(pool);

        store
            .add_credit_once("user_1", "cs_a", None)
            .await
            .unwrap();
        store
            .add_credit_once("user_1", "cs_b", None)
            .await
            .unwrap();

        let record = store.get("user_1").await.unwrap().unwrap();
        assert_eq!(record.credit_balance, 2);
        assert_eq!(record.processed_events.len(), 2);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_ledger_is_shared_across_products(pool: PgPool) {
        let store = BillingRecordStore::new(pool);

        store
            .add_credit_once("user_1", "cs_shared", None)
            .await
            .unwrap();

        // An id already in the ledger blocks any later mutation, even for a
        // different product
        let outcome = store
            .grant_founder_once("user_1", "cs_shared", None)
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::AlreadyProcessed);

        let record = store.get("user_1").await.unwrap().unwrap();
        assert!(!record.founder);
        assert_eq!(record.credit_balance, 1);
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_consume_credit_stops_at_zero(pool: PgPool) {
        let store = BillingRecordStore::new(pool);

        store
            .add_credit_once("user_1", "cs_a", None)
            .await
            .unwrap();

        let remaining = store.consume_credit("user_1").await.unwrap();
        assert_eq!(remaining, 0);

        assert!(matches!(
            store.consume_credit("user_1").await,
            Err(BillingError::InsufficientCredits(_))
        ));
    }

    #[sqlx::test(migrations = "../../migrations")]
    async fn test_reactivate_clears_cancellation(pool: PgPool) {
        let store = BillingRecordStore::new(pool);

        store
            .grant_subscription_once("user_1", "cs_sub", Some("sub_1"), None)
            .await
            .unwrap();
        store
            .mark_inactive_by_subscription("sub_1", OffsetDateTime::now_utc())
            .await
            .unwrap();

        let updated = store.reactivate_by_subscription("sub_1").await.unwrap();
        assert!(updated);

        let record = store.get("user_1").await.unwrap().unwrap();
        assert!(record.subscription_active);
        assert!(record.subscription_canceled_at.is_none());
        assert!(record.subscription_since.is_some());
    }
}
