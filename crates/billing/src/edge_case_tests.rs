// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for Billing Reconciliation
//!
//! Tests critical boundary conditions in:
//! - Webhook signature verification headers
//! - Event decoding under degenerate payloads
//! - Subscription sync convergence

#[cfg(test)]
mod signature_header_tests {
    use crate::error::BillingError;
    use crate::webhooks::verify_signature;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    const SECRET: &str = "whsec_edge_secret";

    fn v1(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // =========================================================================
    // Extra schemes in the header (v0=...) must be ignored, not rejected
    // =========================================================================
    #[test]
    fn test_extra_schemes_ignored() {
        let payload = "{}";
        let now = 1_700_000_000;
        let header = format!("t={},v1={},v0=deadbeef", now, v1(payload, now, SECRET));
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    // =========================================================================
    // Header part order is not significant
    // =========================================================================
    #[test]
    fn test_reordered_header_parts_accepted() {
        let payload = "{}";
        let now = 1_700_000_000;
        let header = format!("v1={},t={}", v1(payload, now, SECRET), now);
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    // =========================================================================
    // Clock skew forward (timestamp in the future) within tolerance
    // =========================================================================
    #[test]
    fn test_future_timestamp_within_tolerance_accepted() {
        let payload = "{}";
        let now = 1_700_000_000;
        let ts = now + 200;
        let header = format!("t={},v1={}", ts, v1(payload, ts, SECRET));
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    // =========================================================================
    // Non-numeric timestamp is a parse failure, not a panic
    // =========================================================================
    #[test]
    fn test_non_numeric_timestamp_rejected() {
        let result = verify_signature("{}", "t=abc,v1=deadbeef", SECRET, 1_700_000_000);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    // =========================================================================
    // Empty header
    // =========================================================================
    #[test]
    fn test_empty_header_rejected() {
        assert!(verify_signature("{}", "", SECRET, 1_700_000_000).is_err());
    }

    // =========================================================================
    // Signature computed without the whsec_ prefix must match a prefixed
    // secret (the prefix is not part of the key)
    // =========================================================================
    #[test]
    fn test_prefix_stripped_from_key() {
        let payload = "{}";
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, v1(payload, now, "edge_secret"));
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }
}

#[cfg(test)]
mod event_decoding_tests {
    use crate::events::{Product, ProviderEvent};

    // =========================================================================
    // Checkout without any correlation metadata still decodes; the handler
    // decides what to do with the missing fields
    // =========================================================================
    #[test]
    fn test_checkout_without_metadata_decodes() {
        let payload = r#"{
            "id": "evt_nometa",
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_bare" } }
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::CheckoutCompleted(c) => {
                assert_eq!(c.session_id, "cs_bare");
                assert!(c.user_id.is_none());
                assert!(c.product.is_none());
            }
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        }
    }

    // =========================================================================
    // Unknown product string in metadata decodes as no product rather than
    // failing the whole event
    // =========================================================================
    #[test]
    fn test_unknown_product_string_decodes_as_none() {
        let payload = r#"{
            "id": "evt_badprod",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_badprod",
                "metadata": { "user_id": "user_1", "product": "gold_tier" }
            }}
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::CheckoutCompleted(c) => {
                assert_eq!(c.user_id.as_deref(), Some("user_1"));
                assert!(c.product.is_none());
            }
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        }
    }

    // =========================================================================
    // Expanded object references resolve to their id the same as bare strings
    // =========================================================================
    #[test]
    fn test_expanded_references_resolve_to_ids() {
        let payload = r#"{
            "id": "evt_expanded",
            "type": "checkout.session.completed",
            "data": { "object": {
                "id": "cs_exp",
                "metadata": { "user_id": "user_1", "product": "subscription" },
                "subscription": { "id": "sub_exp", "status": "active" },
                "customer": { "id": "cus_exp", "email": "x@example.com" }
            }}
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::CheckoutCompleted(c) => {
                assert_eq!(c.subscription_ref.as_deref(), Some("sub_exp"));
                assert_eq!(c.customer_ref.as_deref(), Some("cus_exp"));
            }
            other => panic!("expected CheckoutCompleted, got {:?}", other),
        }
    }

    // =========================================================================
    // cancel_at is used when canceled_at is absent
    // =========================================================================
    #[test]
    fn test_cancel_at_fallback_timestamp() {
        let payload = r#"{
            "id": "evt_cancelat",
            "type": "customer.subscription.updated",
            "data": { "object": {
                "id": "sub_ca",
                "status": "active",
                "cancel_at_period_end": true,
                "cancel_at": 1700001234
            }}
        }"#;

        let event = ProviderEvent::decode(payload).unwrap();
        match event {
            ProviderEvent::SubscriptionUpdated(s) => {
                assert_eq!(s.canceled_at.map(|t| t.unix_timestamp()), Some(1700001234));
            }
            other => panic!("expected SubscriptionUpdated, got {:?}", other),
        }
    }

    // =========================================================================
    // deleted and updated share a wire shape but map to distinct variants
    // =========================================================================
    #[test]
    fn test_deleted_and_updated_are_distinct_variants() {
        let template = |ty: &str| {
            format!(
                r#"{{
                    "id": "evt_shape",
                    "type": "{}",
                    "data": {{ "object": {{ "id": "sub_shape", "status": "canceled" }} }}
                }}"#,
                ty
            )
        };

        assert!(matches!(
            ProviderEvent::decode(&template("customer.subscription.updated")).unwrap(),
            ProviderEvent::SubscriptionUpdated(_)
        ));
        assert!(matches!(
            ProviderEvent::decode(&template("customer.subscription.deleted")).unwrap(),
            ProviderEvent::SubscriptionDeleted(_)
        ));
    }

    // =========================================================================
    // Decoding the same payload twice yields the same event (replay safety
    // starts with deterministic decoding)
    // =========================================================================
    #[test]
    fn test_decode_is_deterministic() {
        let payload = r#"{
            "id": "evt_replay",
            "type": "invoice.payment_failed",
            "data": { "object": { "subscription": "sub_r", "amount_due": 500 } }
        }"#;

        let first = ProviderEvent::decode(payload).unwrap();
        let second = ProviderEvent::decode(payload).unwrap();
        assert_eq!(first.event_id(), second.event_id());
        assert_eq!(first.event_type(), second.event_type());
    }

    #[test]
    fn test_product_display_matches_wire_string() {
        for product in [Product::Subscription, Product::CreditPack, Product::Founder] {
            assert_eq!(product.to_string(), product.as_str());
        }
    }
}

#[cfg(test)]
mod sync_convergence_tests {
    use crate::records::BillingRecord;
    use crate::subscriptions::{plan_sync, ProviderSubscriptionState, SyncAction};
    use time::OffsetDateTime;

    fn record(active: bool, canceled_at: Option<i64>) -> BillingRecord {
        let now = OffsetDateTime::now_utc();
        BillingRecord {
            user_id: "user_edge".to_string(),
            subscription_active: active,
            subscription_since: active.then_some(now),
            subscription_canceled_at: canceled_at
                .map(|ts| OffsetDateTime::from_unix_timestamp(ts).unwrap()),
            subscription_provider_ref: Some("sub_edge".to_string()),
            provider_customer_ref: Some("cus_edge".to_string()),
            credit_balance: 3,
            last_payment_at: None,
            processed_events: vec!["cs_old".to_string()],
            founder: false,
            founder_since: None,
            created_at: now,
            updated_at: now,
        }
    }

    // =========================================================================
    // The cancellation timestamp written locally is the provider's, not ours
    // =========================================================================
    #[test]
    fn test_canceling_uses_provider_timestamp() {
        let provider_ts = OffsetDateTime::from_unix_timestamp(1_690_000_000).unwrap();
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();

        let action = plan_sync(
            &record(true, None),
            &ProviderSubscriptionState::Canceling {
                canceled_at: provider_ts,
            },
            now,
        );
        assert_eq!(
            action,
            SyncAction::MarkInactive {
                canceled_at: provider_ts
            }
        );
    }

    // =========================================================================
    // A record already canceled at a different timestamp is left alone when
    // the provider agrees it is canceling (no timestamp churn)
    // =========================================================================
    #[test]
    fn test_already_canceled_record_not_rewritten() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let action = plan_sync(
            &record(false, Some(1_680_000_000)),
            &ProviderSubscriptionState::Canceling {
                canceled_at: OffsetDateTime::from_unix_timestamp(1_690_000_000).unwrap(),
            },
            now,
        );
        assert_eq!(action, SyncAction::NoChange);
    }

    // =========================================================================
    // Sync never touches credits, founder state, or the ledger; it only
    // plans subscription flag changes
    // =========================================================================
    #[test]
    fn test_sync_scope_is_subscription_only() {
        let now = OffsetDateTime::now_utc();
        let rec = record(true, None);
        let action = plan_sync(&rec, &ProviderSubscriptionState::Canceled, now);

        // The action itself carries nothing but subscription state
        assert!(matches!(action, SyncAction::MarkInactive { .. }));
        assert_eq!(rec.credit_balance, 3);
        assert_eq!(rec.processed_events, vec!["cs_old".to_string()]);
    }
}
