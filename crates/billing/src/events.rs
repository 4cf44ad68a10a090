//! Webhook event decoding
//!
//! Stripe events arrive as JSON with a string `type` discriminant. Instead of
//! switching on raw strings throughout the handler, the payload is decoded
//! once at the boundary into the closed [`ProviderEvent`] enum. Unknown types
//! become an explicit `Unrecognized` variant so the no-op path is type-checked
//! rather than a silent fallthrough.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Purchasable products, carried in checkout session metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    /// Recurring paid subscription
    Subscription,
    /// One-time purchase of a consumable credit
    CreditPack,
    /// One-time, non-expiring founder grant
    Founder,
}

impl Product {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "subscription" => Some(Product::Subscription),
            "credit_pack" => Some(Product::CreditPack),
            "founder" => Some(Product::Founder),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Product::Subscription => "subscription",
            Product::CreditPack => "credit_pack",
            Product::Founder => "founder",
        }
    }
}

impl std::fmt::Display for Product {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed checkout session, correlated back to a user via metadata
#[derive(Debug, Clone)]
pub struct CheckoutCompleted {
    pub event_id: String,
    pub session_id: String,
    pub user_id: Option<String>,
    pub product: Option<Product>,
    pub subscription_ref: Option<String>,
    pub customer_ref: Option<String>,
}

/// Subscription state change reported by the provider
#[derive(Debug, Clone)]
pub struct SubscriptionChanged {
    pub event_id: String,
    pub subscription_ref: String,
    pub status: String,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<OffsetDateTime>,
}

/// Invoice payment outcome for a subscription
#[derive(Debug, Clone)]
pub struct InvoicePayment {
    pub event_id: String,
    pub subscription_ref: Option<String>,
    pub amount_cents: Option<i64>,
}

/// Recognized provider webhook events
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    CheckoutCompleted(CheckoutCompleted),
    SubscriptionUpdated(SubscriptionChanged),
    SubscriptionDeleted(SubscriptionChanged),
    InvoicePaymentSucceeded(InvoicePayment),
    InvoicePaymentFailed(InvoicePayment),
    /// Acknowledged and ignored; carries the ids so the delivery still
    /// lands in the audit log
    Unrecognized {
        event_id: String,
        event_type: String,
    },
}

impl ProviderEvent {
    /// The provider event id, where one exists
    pub fn event_id(&self) -> Option<&str> {
        match self {
            ProviderEvent::CheckoutCompleted(c) => Some(&c.event_id),
            ProviderEvent::SubscriptionUpdated(s) | ProviderEvent::SubscriptionDeleted(s) => {
                Some(&s.event_id)
            }
            ProviderEvent::InvoicePaymentSucceeded(i) | ProviderEvent::InvoicePaymentFailed(i) => {
                Some(&i.event_id)
            }
            ProviderEvent::Unrecognized { event_id, .. } => Some(event_id),
        }
    }

    pub fn event_type(&self) -> &str {
        match self {
            ProviderEvent::CheckoutCompleted(_) => "checkout.session.completed",
            ProviderEvent::SubscriptionUpdated(_) => "customer.subscription.updated",
            ProviderEvent::SubscriptionDeleted(_) => "customer.subscription.deleted",
            ProviderEvent::InvoicePaymentSucceeded(_) => "invoice.payment_succeeded",
            ProviderEvent::InvoicePaymentFailed(_) => "invoice.payment_failed",
            ProviderEvent::Unrecognized { event_type, .. } => event_type,
        }
    }

    /// Decode a raw webhook payload into a typed event.
    ///
    /// Errors only on malformed JSON or a missing envelope. A well-formed
    /// event of an unknown type decodes to `Unrecognized`, never an error,
    /// since the provider retries indefinitely on error responses.
    pub fn decode(payload: &str) -> BillingResult<ProviderEvent> {
        let envelope: WireEvent = serde_json::from_str(payload)
            .map_err(|e| BillingError::WebhookEventNotSupported(e.to_string()))?;
        let object = &envelope.data.object;

        let event = match envelope.type_.as_str() {
            "checkout.session.completed" => {
                let session: WireCheckoutSession = serde_json::from_value(object.clone())
                    .map_err(|e| BillingError::WebhookEventNotSupported(e.to_string()))?;
                let user_id = session
                    .metadata
                    .get("user_id")
                    .cloned()
                    .or(session.client_reference_id);
                let product = session
                    .metadata
                    .get("product")
                    .and_then(|p| Product::from_str(p));
                ProviderEvent::CheckoutCompleted(CheckoutCompleted {
                    event_id: envelope.id,
                    session_id: session.id,
                    user_id,
                    product,
                    subscription_ref: session.subscription.as_ref().and_then(expandable_id),
                    customer_ref: session.customer.as_ref().and_then(expandable_id),
                })
            }
            "customer.subscription.updated" | "customer.subscription.deleted" => {
                let sub: WireSubscription = serde_json::from_value(object.clone())
                    .map_err(|e| BillingError::WebhookEventNotSupported(e.to_string()))?;
                let changed = SubscriptionChanged {
                    event_id: envelope.id,
                    subscription_ref: sub.id,
                    status: sub.status,
                    cancel_at_period_end: sub.cancel_at_period_end,
                    canceled_at: sub
                        .canceled_at
                        .or(sub.cancel_at)
                        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
                };
                if envelope.type_ == "customer.subscription.deleted" {
                    ProviderEvent::SubscriptionDeleted(changed)
                } else {
                    ProviderEvent::SubscriptionUpdated(changed)
                }
            }
            "invoice.payment_succeeded" | "invoice.payment_failed" => {
                let invoice: WireInvoice = serde_json::from_value(object.clone())
                    .map_err(|e| BillingError::WebhookEventNotSupported(e.to_string()))?;
                let payment = InvoicePayment {
                    event_id: envelope.id,
                    subscription_ref: invoice.subscription.as_ref().and_then(expandable_id),
                    amount_cents: invoice.amount_paid.or(invoice.amount_due),
                };
                if envelope.type_ == "invoice.payment_succeeded" {
                    ProviderEvent::InvoicePaymentSucceeded(payment)
                } else {
                    ProviderEvent::InvoicePaymentFailed(payment)
                }
            }
            other => ProviderEvent::Unrecognized {
                event_type: other.to_string(),
                event_id: envelope.id,
            },
        };

        Ok(event)
    }
}

/// Expandable references arrive either as a bare id string or as the full
/// object with an `id` field, depending on expansion settings.
fn expandable_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: String,
    #[serde(rename = "type")]
    type_: String,
    data: WireEventData,
}

#[derive(Debug, Deserialize)]
struct WireEventData {
    object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct WireCheckoutSession {
    id: String,
    #[serde(default)]
    metadata: std::collections::HashMap<String, String>,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    subscription: Option<serde_json::Value>,
    #[serde(default)]
    customer: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WireSubscription {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    canceled_at: Option<i64>,
    #[serde(default)]
    cancel_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct WireInvoice {
    #[serde(default)]
    subscription: Option<serde_json::Value>,
    #[serde(default)]
    amount_paid: Option<i64>,
    #[serde(default)]
    amount_due: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_round_trip() {
        for product in [Product::Subscription, Product::CreditPack, Product::Founder] {
            assert_eq!(Product::from_str(product.as_str()), Some(product));
        }
        assert_eq!(Product::from_str("premium_gold"), None);
    }

    #[test]
    fn test_decode_checkout_completed() {
        let payload = r#"{
            "id": "evt_1",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test_1",
                "metadata": { "user_id": "user_42", "product": "credit_pack" },
                "client_reference_id": "user_42",
                "subscription": null,
                "customer": "cus_9"
            }}
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::CheckoutCompleted(c) => {
                assert_eq!(c.session_id, "cs_test_1");
                assert_eq!(c.user_id.as_deref(), Some("user_42"));
                assert_eq!(c.product, Some(Product::CreditPack));
                assert_eq!(c.customer_ref.as_deref(), Some("cus_9"));
                assert!(c.subscription_ref.is_none());
            }
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_checkout_falls_back_to_client_reference_id() {
        let payload = r#"{
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_test_2",
                "metadata": { "product": "subscription" },
                "client_reference_id": "user_77",
                "subscription": { "id": "sub_55" }
            }}
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::CheckoutCompleted(c) => {
                assert_eq!(c.user_id.as_deref(), Some("user_77"));
                assert_eq!(c.subscription_ref.as_deref(), Some("sub_55"));
            }
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_subscription_updated_with_cancellation() {
        let payload = r#"{
            "id": "evt_3",
            "type": "customer.subscription.updated",
            "data": { "object": {
                "id": "sub_55",
                "status": "active",
                "cancel_at_period_end": true,
                "canceled_at": 1700000000
            }}
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::SubscriptionUpdated(s) => {
                assert_eq!(s.subscription_ref, "sub_55");
                assert!(s.cancel_at_period_end);
                assert_eq!(s.canceled_at.map(|t| t.unix_timestamp()), Some(1700000000));
            }
            other => panic!("expected SubscriptionUpdated, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_invoice_payment_succeeded() {
        let payload = r#"{
            "id": "evt_4",
            "type": "invoice.payment_succeeded",
            "data": { "object": {
                "subscription": "sub_55",
                "amount_paid": 999
            }}
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::InvoicePaymentSucceeded(i) => {
                assert_eq!(i.subscription_ref.as_deref(), Some("sub_55"));
                assert_eq!(i.amount_cents, Some(999));
            }
            other => panic!("expected InvoicePaymentSucceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_not_an_error() {
        let payload = r#"{
            "id": "evt_5",
            "type": "customer.tax_id.created",
            "data": { "object": { "id": "txi_1" } }
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match &event {
            ProviderEvent::Unrecognized {
                event_id,
                event_type,
            } => {
                assert_eq!(event_type, "customer.tax_id.created");
                assert_eq!(event_id, "evt_5");
            }
            other => panic!("expected Unrecognized, got {:?}", other),
        }

        // Unrecognized deliveries still carry their id for the audit log
        assert_eq!(event.event_id(), Some("evt_5"));
        assert_eq!(event.event_type(), "customer.tax_id.created");
    }

    #[test]
    fn test_decode_rejects_malformed_json() {
        assert!(ProviderEvent::decode("not json").is_err());
        assert!(ProviderEvent::decode(r#"{"id": "evt_6"}"#).is_err());
    }
}
