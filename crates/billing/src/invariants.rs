//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the billing records table.
//! These invariants can be run after any mutation or webhook replay to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write
//! 4. **Complete**: Covers all critical billing consistency requirements

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// User(s) affected
    pub user_ids: Vec<String>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - entitlements may be granted or revoked incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for active-without-since violation
#[derive(Debug, sqlx::FromRow)]
struct ActiveNoSinceRow {
    user_id: String,
}

/// Row type for active-with-cancellation violation
#[derive(Debug, sqlx::FromRow)]
struct ActiveCanceledRow {
    user_id: String,
    subscription_canceled_at: Option<OffsetDateTime>,
}

/// Row type for duplicate ledger entry violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicateLedgerRow {
    user_id: String,
    total_entries: i64,
    distinct_entries: i64,
}

/// Row type for negative credit balance violation
#[derive(Debug, sqlx::FromRow)]
struct NegativeCreditsRow {
    user_id: String,
    credit_balance: i32,
}

/// Row type for founder-without-since violation
#[derive(Debug, sqlx::FromRow)]
struct FounderNoSinceRow {
    user_id: String,
}

/// Row type for active-without-provider-ref violation
#[derive(Debug, sqlx::FromRow)]
struct ActiveNoProviderRefRow {
    user_id: String,
    subscription_since: Option<OffsetDateTime>,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        // Run all checks
        violations.extend(self.check_active_has_since().await?);
        violations.extend(self.check_active_not_canceled().await?);
        violations.extend(self.check_no_duplicate_ledger_entries().await?);
        violations.extend(self.check_non_negative_credits().await?);
        violations.extend(self.check_founder_has_since().await?);
        violations.extend(self.check_active_has_provider_ref().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: Active subscriptions have an activation timestamp
    ///
    /// An active record with no `subscription_since` means a grant path
    /// skipped the timestamp, so entitlement age cannot be determined.
    async fn check_active_has_since(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveNoSinceRow> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM billing_records
            WHERE subscription_active = TRUE
              AND subscription_since IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_has_since".to_string(),
                user_ids: vec![row.user_id],
                description: "Active subscription has no activation timestamp".to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: Active subscriptions carry no cancellation timestamp
    ///
    /// Reactivation must clear `subscription_canceled_at`; a record that is
    /// both active and canceled confuses every downstream entitlement check.
    async fn check_active_not_canceled(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveCanceledRow> = sqlx::query_as(
            r#"
            SELECT user_id, subscription_canceled_at
            FROM billing_records
            WHERE subscription_active = TRUE
              AND subscription_canceled_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_not_canceled".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Active subscription still carries cancellation timestamp {:?}",
                    row.subscription_canceled_at
                ),
                context: serde_json::json!({
                    "subscription_canceled_at": row.subscription_canceled_at,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 3: No duplicate entries in the processed-events ledger
    ///
    /// The guarded single-statement updates append each id at most once.
    /// A duplicate means a mutation ran outside the guard and the user may
    /// have been granted a purchase twice.
    async fn check_no_duplicate_ledger_entries(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateLedgerRow> = sqlx::query_as(
            r#"
            SELECT
                user_id,
                COUNT(entry) AS total_entries,
                COUNT(DISTINCT entry) AS distinct_entries
            FROM billing_records, unnest(processed_events) AS entry
            GROUP BY user_id
            HAVING COUNT(entry) > COUNT(DISTINCT entry)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "no_duplicate_ledger_entries".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Processed-events ledger has {} entries but only {} distinct",
                    row.total_entries, row.distinct_entries
                ),
                context: serde_json::json!({
                    "total_entries": row.total_entries,
                    "distinct_entries": row.distinct_entries,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 4: Credit balances never go negative
    ///
    /// Consumption is a conditional decrement; a negative balance means a
    /// write bypassed it (the CHECK constraint should make this impossible).
    async fn check_non_negative_credits(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeCreditsRow> = sqlx::query_as(
            r#"
            SELECT user_id, credit_balance
            FROM billing_records
            WHERE credit_balance < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "non_negative_credits".to_string(),
                user_ids: vec![row.user_id],
                description: format!("Credit balance is negative ({})", row.credit_balance),
                context: serde_json::json!({
                    "credit_balance": row.credit_balance,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 5: Founder grants have a grant timestamp
    async fn check_founder_has_since(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<FounderNoSinceRow> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM billing_records
            WHERE founder = TRUE
              AND founder_since IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "founder_has_since".to_string(),
                user_ids: vec![row.user_id],
                description: "Founder grant has no grant timestamp".to_string(),
                context: serde_json::json!({}),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Active subscriptions have a provider reference
    ///
    /// Without `subscription_provider_ref` the record cannot be synced
    /// against the provider. Manual activation is the usual source.
    async fn check_active_has_provider_ref(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ActiveNoProviderRefRow> = sqlx::query_as(
            r#"
            SELECT user_id, subscription_since
            FROM billing_records
            WHERE subscription_active = TRUE
              AND subscription_provider_ref IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_has_provider_ref".to_string(),
                user_ids: vec![row.user_id],
                description: "Active subscription has no provider subscription reference"
                    .to_string(),
                context: serde_json::json!({
                    "subscription_since": row.subscription_since,
                    "likely_source": "manual activation",
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "active_has_since" => self.check_active_has_since().await,
            "active_not_canceled" => self.check_active_not_canceled().await,
            "no_duplicate_ledger_entries" => self.check_no_duplicate_ledger_entries().await,
            "non_negative_credits" => self.check_non_negative_credits().await,
            "founder_has_since" => self.check_founder_has_since().await,
            "active_has_provider_ref" => self.check_active_has_provider_ref().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "active_has_since",
            "active_not_canceled",
            "no_duplicate_ledger_entries",
            "non_negative_credits",
            "founder_has_since",
            "active_has_provider_ref",
        ]
    }
}
