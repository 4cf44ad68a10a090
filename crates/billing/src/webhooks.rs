//! Stripe webhook handling
//!
//! Verifies the delivery signature over the raw body, decodes the payload
//! into a typed [`ProviderEvent`], and routes it to the billing record store.
//! Signature verification must run on the exact bytes Stripe signed;
//! re-serializing a parsed body does not reproduce them.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::events::{CheckoutCompleted, InvoicePayment, ProviderEvent, SubscriptionChanged};
use crate::records::BillingRecordStore;

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (5 minutes)
const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    stripe: StripeClient,
    store: BillingRecordStore,
    pool: PgPool,
}

impl WebhookHandler {
    pub fn new(stripe: StripeClient, pool: PgPool) -> Self {
        let store = BillingRecordStore::new(pool.clone());
        Self {
            stripe,
            store,
            pool,
        }
    }

    /// Verify a delivery's signature and decode it into a typed event.
    ///
    /// `payload` must be the unparsed request body.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<ProviderEvent> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_err(|e| {
                tracing::error!(error = %e, "System time error during webhook verification");
                BillingError::WebhookSignatureInvalid
            })?
            .as_secs() as i64;

        verify_signature(
            payload,
            signature,
            &self.stripe.config().webhook_secret,
            now,
        )?;

        ProviderEvent::decode(payload)
    }

    /// Handle a verified event.
    ///
    /// Returns `Err` only for failures the provider's retry can fix (store
    /// round-trip failures). Unrecognized types and recognized events with
    /// unusable payloads are acknowledged, since retrying cannot repair them.
    pub async fn handle_event(&self, event: ProviderEvent) -> BillingResult<()> {
        let audit_id = self.record_delivery(&event).await;

        let result = match &event {
            ProviderEvent::CheckoutCompleted(checkout) => {
                self.handle_checkout_completed(checkout).await
            }
            ProviderEvent::SubscriptionUpdated(changed) => {
                self.handle_subscription_updated(changed).await
            }
            ProviderEvent::SubscriptionDeleted(changed) => {
                self.handle_subscription_ended(changed.event_id.as_str(), &changed.subscription_ref)
                    .await
            }
            ProviderEvent::InvoicePaymentSucceeded(payment) => {
                self.handle_invoice_paid(payment).await
            }
            ProviderEvent::InvoicePaymentFailed(payment) => {
                self.handle_invoice_failed(payment).await
            }
            ProviderEvent::Unrecognized {
                event_id,
                event_type,
            } => {
                // Log at info level so we can track which events we're not
                // handling; always acknowledged.
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        };

        self.finish_delivery(audit_id, &result).await;
        result
    }

    async fn handle_checkout_completed(&self, checkout: &CheckoutCompleted) -> BillingResult<()> {
        let (user_id, product) = match (&checkout.user_id, checkout.product) {
            (Some(user_id), Some(product)) => (user_id, product),
            _ => {
                // Retrying the delivery can't add the missing metadata, so
                // acknowledge and flag for manual follow-up.
                tracing::error!(
                    event_id = %checkout.event_id,
                    session_id = %checkout.session_id,
                    has_user = checkout.user_id.is_some(),
                    has_product = checkout.product.is_some(),
                    "Checkout completed without usable correlation metadata - \
                     manual reconciliation may be required"
                );
                return Ok(());
            }
        };

        // Keyed on the session id so the client confirmation poll and this
        // webhook dedupe against each other.
        let outcome = self
            .store
            .apply_product(
                user_id,
                product,
                &checkout.session_id,
                checkout.subscription_ref.as_deref(),
                checkout.customer_ref.as_deref(),
            )
            .await?;

        tracing::info!(
            event_id = %checkout.event_id,
            session_id = %checkout.session_id,
            user_id = %user_id,
            product = %product,
            applied = outcome.is_applied(),
            "Checkout session completed"
        );

        Ok(())
    }

    async fn handle_subscription_updated(
        &self,
        changed: &SubscriptionChanged,
    ) -> BillingResult<()> {
        if changed.cancel_at_period_end {
            if let Some(canceled_at) = changed.canceled_at {
                let updated = self
                    .store
                    .mark_inactive_by_subscription(&changed.subscription_ref, canceled_at)
                    .await?;
                tracing::info!(
                    event_id = %changed.event_id,
                    subscription_ref = %changed.subscription_ref,
                    record_updated = updated,
                    "Subscription canceling at period end"
                );
                return Ok(());
            }
        }

        // Cancellation was reverted (or the subscription came back to a
        // current state); same mapping the on-demand sync applies.
        if status_is_current(&changed.status) && !changed.cancel_at_period_end {
            let updated = self
                .store
                .reactivate_by_subscription(&changed.subscription_ref)
                .await?;
            tracing::info!(
                event_id = %changed.event_id,
                subscription_ref = %changed.subscription_ref,
                record_updated = updated,
                "Subscription reported active and not canceling"
            );
        }

        Ok(())
    }

    async fn handle_subscription_ended(
        &self,
        event_id: &str,
        subscription_ref: &str,
    ) -> BillingResult<()> {
        let updated = self
            .store
            .mark_inactive_by_subscription(subscription_ref, time::OffsetDateTime::now_utc())
            .await?;

        tracing::info!(
            event_id = %event_id,
            subscription_ref = %subscription_ref,
            record_updated = updated,
            "Subscription deleted, entitlement revoked"
        );

        Ok(())
    }

    async fn handle_invoice_paid(&self, payment: &InvoicePayment) -> BillingResult<()> {
        let subscription_ref = match &payment.subscription_ref {
            Some(subscription_ref) => subscription_ref,
            None => {
                // One-off invoices carry no subscription; nothing to update
                tracing::debug!(
                    event_id = %payment.event_id,
                    "Invoice payment succeeded without subscription reference"
                );
                return Ok(());
            }
        };

        let updated = self.store.record_payment(subscription_ref).await?;

        tracing::info!(
            event_id = %payment.event_id,
            subscription_ref = %subscription_ref,
            amount_cents = ?payment.amount_cents,
            record_updated = updated,
            "Invoice payment recorded"
        );

        Ok(())
    }

    async fn handle_invoice_failed(&self, payment: &InvoicePayment) -> BillingResult<()> {
        let subscription_ref = match &payment.subscription_ref {
            Some(subscription_ref) => subscription_ref,
            None => return Ok(()),
        };

        let updated = self
            .store
            .mark_inactive_by_subscription(subscription_ref, time::OffsetDateTime::now_utc())
            .await?;

        tracing::warn!(
            event_id = %payment.event_id,
            subscription_ref = %subscription_ref,
            amount_cents = ?payment.amount_cents,
            record_updated = updated,
            "Invoice payment failed, subscription marked inactive"
        );

        Ok(())
    }

    /// Best-effort audit row for the delivery. The correctness guard lives
    /// in the record ledger, so audit failures only log.
    async fn record_delivery(&self, event: &ProviderEvent) -> Option<Uuid> {
        let event_id = event.event_id()?;

        let row: Result<Option<(Uuid,)>, sqlx::Error> = sqlx::query_as(
            r#"
            INSERT INTO webhook_event_log (provider_event_id, event_type, processing_result)
            VALUES ($1, $2, 'processing')
            ON CONFLICT (provider_event_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event.event_type())
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(Some((id,))) => Some(id),
            Ok(None) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event.event_type(),
                    "Duplicate webhook delivery (already in audit log)"
                );
                None
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %event_id,
                    error = %e,
                    "Failed to write webhook audit row"
                );
                None
            }
        }
    }

    async fn finish_delivery(&self, audit_id: Option<Uuid>, result: &BillingResult<()>) {
        let Some(audit_id) = audit_id else { return };

        let (processing_result, error_message) = match result {
            Ok(()) => ("success", None),
            Err(e) => ("error", Some(e.to_string())),
        };

        if let Err(e) = sqlx::query(
            "UPDATE webhook_event_log SET processing_result = $1, error_message = $2 WHERE id = $3",
        )
        .bind(processing_result)
        .bind(&error_message)
        .bind(audit_id)
        .execute(&self.pool)
        .await
        {
            tracing::warn!(audit_id = %audit_id, error = %e, "Failed to update webhook audit row");
        }
    }
}

/// Statuses that mean the subscription is currently entitled. Trialing
/// counts, matching how the on-demand sync classifies provider state.
fn status_is_current(status: &str) -> bool {
    matches!(status, "active" | "trialing")
}

/// Verify a Stripe signature header against the raw payload.
///
/// The header has the form `t=<unix>,v1=<hex hmac>`; the signed message is
/// `"{t}.{payload}"` keyed by the webhook secret (the `whsec_` prefix is not
/// part of the key).
pub fn verify_signature(
    payload: &str,
    signature: &str,
    webhook_secret: &str,
    now_unix: i64,
) -> BillingResult<()> {
    if webhook_secret.is_empty() {
        tracing::error!("Webhook secret not configured, rejecting delivery");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    // Parse the signature header: t=timestamp,v1=signature,v0=signature
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::WebhookSignatureInvalid
    })?;

    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
        tracing::error!(
            timestamp = timestamp,
            now = now_unix,
            diff = (now_unix - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = webhook_secret
        .strip_prefix("whsec_")
        .unwrap_or(webhook_secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        BillingError::WebhookSignatureInvalid
    })?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}
