//! Stripe webhook intake
//!
//! Verifies the `Stripe-Signature` header, turns the handful of events the
//! engine cares about into [`GatewayNotification`]s, and applies them through
//! the ledger. Replayed or out-of-order deliveries are absorbed by the state
//! machine: a second `invoice.payment_failed` inside an open episode and a
//! second `invoice.paid` for the same invoice are both no-ops.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{Event, EventObject, EventType, Expandable};
use time::OffsetDateTime;

use tenantops_shared::SubscriptionStatus;

use crate::error::{BillingError, BillingResult};
use crate::ledger::Applied;
use crate::services::BillingServices;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Check a `t=<unix>,v1=<hex>` signature header against the raw body
pub fn verify_signature(
    payload: &str,
    header: &str,
    secret: &str,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<&str> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::warn!("Missing timestamp in webhook signature header");
        BillingError::WebhookSignatureInvalid
    })?;
    if signatures.is_empty() {
        tracing::warn!("Missing v1 signature in webhook signature header");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let age = (now.unix_timestamp() - timestamp).abs();
    if age > SIGNATURE_TOLERANCE_SECS {
        tracing::warn!(timestamp = timestamp, age_secs = age, "Webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let signed_payload = format!("{}.{}", timestamp, payload);
    for candidate in signatures {
        let Ok(expected) = hex::decode(candidate) else {
            continue;
        };
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
        mac.update(signed_payload.as_bytes());
        // verify_slice compares in constant time
        if mac.verify_slice(&expected).is_ok() {
            return Ok(());
        }
    }

    tracing::warn!("Webhook signature mismatch");
    Err(BillingError::WebhookSignatureInvalid)
}

/// Gateway events that change billing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayNotification {
    PaymentFailed {
        customer_ref: String,
        invoice_ref: String,
        at: OffsetDateTime,
    },
    InvoicePaid {
        customer_ref: String,
        invoice_ref: String,
        at: OffsetDateTime,
    },
    SubscriptionStatusChanged {
        customer_ref: String,
        status: SubscriptionStatus,
        at: OffsetDateTime,
    },
}

impl GatewayNotification {
    pub fn customer_ref(&self) -> &str {
        match self {
            GatewayNotification::PaymentFailed { customer_ref, .. }
            | GatewayNotification::InvoicePaid { customer_ref, .. }
            | GatewayNotification::SubscriptionStatusChanged { customer_ref, .. } => customer_ref,
        }
    }

    /// Extract a notification from a Stripe event; `Ok(None)` for event types we ignore
    pub fn from_stripe(event: Event) -> BillingResult<Option<Self>> {
        let at = OffsetDateTime::from_unix_timestamp(event.created)
            .map_err(|e| BillingError::WebhookPayload(format!("bad event timestamp: {}", e)))?;

        let notification = match (event.type_, event.data.object) {
            (EventType::InvoicePaymentFailed, EventObject::Invoice(invoice)) => {
                GatewayNotification::PaymentFailed {
                    customer_ref: customer_id(invoice.customer.as_ref())?,
                    invoice_ref: invoice.id.to_string(),
                    at,
                }
            }
            (EventType::InvoicePaid, EventObject::Invoice(invoice)) => {
                GatewayNotification::InvoicePaid {
                    customer_ref: customer_id(invoice.customer.as_ref())?,
                    invoice_ref: invoice.id.to_string(),
                    at,
                }
            }
            (
                EventType::CustomerSubscriptionUpdated | EventType::CustomerSubscriptionDeleted,
                EventObject::Subscription(subscription),
            ) => {
                let raw = subscription.status.as_str();
                let Some(status) = SubscriptionStatus::from_gateway(raw) else {
                    tracing::debug!(status = raw, "Ignoring unmapped subscription status");
                    return Ok(None);
                };
                GatewayNotification::SubscriptionStatusChanged {
                    customer_ref: customer_id(Some(&subscription.customer))?,
                    status,
                    at,
                }
            }
            (event_type, _) => {
                tracing::debug!(event_type = %event_type, "Ignoring webhook event");
                return Ok(None);
            }
        };

        Ok(Some(notification))
    }
}

fn customer_id(customer: Option<&Expandable<stripe::Customer>>) -> BillingResult<String> {
    match customer {
        Some(Expandable::Id(id)) => Ok(id.to_string()),
        Some(Expandable::Object(c)) => Ok(c.id.to_string()),
        None => Err(BillingError::WebhookPayload(
            "event has no customer".to_string(),
        )),
    }
}

/// What happened to a delivered notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied { version: i64 },
    Unchanged { reason: &'static str },
    /// Event type or customer unknown to the engine
    Ignored,
}

#[derive(Clone)]
pub struct WebhookHandler {
    services: BillingServices,
    secret: String,
}

impl WebhookHandler {
    pub fn new(services: BillingServices, secret: impl Into<String>) -> Self {
        Self {
            services,
            secret: secret.into(),
        }
    }

    /// Verify, parse and apply one delivery
    pub async fn handle(
        &self,
        payload: &str,
        signature: &str,
        now: OffsetDateTime,
    ) -> BillingResult<WebhookOutcome> {
        verify_signature(payload, signature, &self.secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayload(e.to_string())
        })?;
        let event_id = event.id.to_string();

        match GatewayNotification::from_stripe(event)? {
            Some(notification) => {
                tracing::info!(event_id = %event_id, "Processing webhook event");
                self.apply(notification).await
            }
            None => Ok(WebhookOutcome::Ignored),
        }
    }

    pub async fn apply(&self, notification: GatewayNotification) -> BillingResult<WebhookOutcome> {
        let ledger = &self.services.ledger;
        let record = match ledger
            .store()
            .find_by_customer_ref(notification.customer_ref())
            .await?
        {
            Some(record) => record,
            None => {
                tracing::warn!(
                    customer_ref = %notification.customer_ref(),
                    "Webhook for unknown customer"
                );
                return Ok(WebhookOutcome::Ignored);
            }
        };
        let tenant_id = record.tenant_id();

        let applied = match &notification {
            GatewayNotification::PaymentFailed { invoice_ref, at, .. } => {
                ledger
                    .record_payment_failure(tenant_id, *at, Some(invoice_ref))
                    .await?
            }
            GatewayNotification::InvoicePaid { invoice_ref, at, .. } => {
                ledger.record_invoice_paid(tenant_id, *at, invoice_ref).await?
            }
            GatewayNotification::SubscriptionStatusChanged { status, at, .. } => {
                ledger.sync_subscription_status(tenant_id, *status, *at).await?
            }
        };

        Ok(match applied {
            Applied::Committed { record, .. } => WebhookOutcome::Applied {
                version: record.version,
            },
            Applied::Unchanged { reason, .. } => WebhookOutcome::Unchanged { reason },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::audit::{ActorType, MemoryAuditLog};
    use crate::config::DunningConfig;
    use crate::memory_store::MemoryStore;
    use crate::store::{BillingStore, TenantStore};
    use crate::testing::{FakeGateway, RecordingNotifier};
    use tenantops_shared::{Tenant, TenantId, TenantStatus};
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 06:00 UTC);
    const SECRET: &str = "whsec_test_secret";

    fn sign(payload: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        )
    }

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, NOW.unix_timestamp());
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"id":"evt_1"}"#, NOW.unix_timestamp());
        let err = verify_signature(r#"{"id":"evt_2"}"#, &header, SECRET, NOW).unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = r#"{"id":"evt_1"}"#;
        let header = sign(payload, NOW.unix_timestamp() - SIGNATURE_TOLERANCE_SECS - 1);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_err());
    }

    #[test]
    fn test_any_matching_v1_accepted() {
        let payload = r#"{"id":"evt_1"}"#;
        let good = sign(payload, NOW.unix_timestamp());
        let header = format!("{},v1=deadbeef", good);
        assert!(verify_signature(payload, &header, SECRET, NOW).is_ok());
        assert!(verify_signature(payload, "v1=deadbeef", SECRET, NOW).is_err());
    }

    async fn handler() -> (WebhookHandler, Arc<MemoryStore>, TenantId) {
        let store = Arc::new(MemoryStore::new());
        let services = BillingServices::new(
            store.clone(),
            store.clone(),
            Arc::new(FakeGateway::new(4_900)),
            Arc::new(RecordingNotifier::new()),
            Arc::new(MemoryAuditLog::new()),
            DunningConfig::default(),
        );
        let tenant = Tenant::new("Lakeside Pottery", None, NOW);
        let tenant_id = tenant.tenant_id();
        store.insert_tenant(tenant);
        services
            .ledger
            .attach_payment_method(tenant_id, "cus_w", "sub_w", "pm_w", ActorType::User, NOW)
            .await
            .unwrap();
        (WebhookHandler::new(services, SECRET), store, tenant_id)
    }

    #[tokio::test]
    async fn test_payment_failed_opens_episode_once() {
        let (handler, store, tenant_id) = handler().await;
        let notification = GatewayNotification::PaymentFailed {
            customer_ref: "cus_w".to_string(),
            invoice_ref: "in_1".to_string(),
            at: NOW,
        };

        let first = handler.apply(notification.clone()).await.unwrap();
        let replay = handler.apply(notification).await.unwrap();

        assert_eq!(first, WebhookOutcome::Applied { version: 2 });
        assert!(matches!(replay, WebhookOutcome::Unchanged { .. }));
        let record = store.get(tenant_id).await.unwrap();
        assert_eq!(record.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(record.retry_count, 0);
        assert_eq!(
            store.get_tenant(tenant_id).await.unwrap().status,
            TenantStatus::PastDue
        );
    }

    #[tokio::test]
    async fn test_invoice_paid_restores_tenant() {
        let (handler, store, tenant_id) = handler().await;
        handler
            .apply(GatewayNotification::PaymentFailed {
                customer_ref: "cus_w".to_string(),
                invoice_ref: "in_1".to_string(),
                at: NOW,
            })
            .await
            .unwrap();

        let outcome = handler
            .apply(GatewayNotification::InvoicePaid {
                customer_ref: "cus_w".to_string(),
                invoice_ref: "in_1".to_string(),
                at: NOW + time::Duration::days(2),
            })
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Applied { .. }));
        let record = store.get(tenant_id).await.unwrap();
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(record.first_failure_at, None);
        assert_eq!(
            store.get_tenant(tenant_id).await.unwrap().status,
            TenantStatus::Active
        );
    }

    #[tokio::test]
    async fn test_unknown_customer_ignored() {
        let (handler, _, _) = handler().await;
        let outcome = handler
            .apply(GatewayNotification::SubscriptionStatusChanged {
                customer_ref: "cus_nobody".to_string(),
                status: SubscriptionStatus::Canceled,
                at: NOW,
            })
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_bad_signature_never_touches_state() {
        let (handler, store, tenant_id) = handler().await;
        let err = handler
            .handle(r#"{"id":"evt_1"}"#, "t=1,v1=00", NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::WebhookSignatureInvalid));
        assert_eq!(store.get(tenant_id).await.unwrap().version, 1);
    }
}
