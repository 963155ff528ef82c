//! Manual "pay now" recovery
//!
//! Tenant-initiated, synchronous, and independent of the retry cadence. The
//! gateway part of the request is bounded by `manual_timeout`; the success
//! commit uses the same version-checked transition as the scheduler, so a
//! near-simultaneous scheduler retry resolves to one charge and one commit.
//!
//! Declines and step-up requests never change the billing record.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use tenantops_shared::{SubscriptionStatus, TenantId};

use crate::audit::{AuditAction, AuditEntryBuilder};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ensure_charged_for_current_period, with_timeout, ChargeOutcome, ChargeRequest, ChargeResult,
    DeclineReason, GatewayError, GatewayInvoice,
};
use crate::ledger::Applied;
use crate::record::BillingRecord;
use crate::services::BillingServices;

/// Invoice summary returned to the tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceSummary {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    pub status: String,
}

impl From<&GatewayInvoice> for InvoiceSummary {
    fn from(invoice: &GatewayInvoice) -> Self {
        Self {
            id: invoice.id.clone(),
            amount: invoice.amount_due_cents,
            currency: invoice.currency.clone(),
            status: invoice.status.as_str().to_string(),
        }
    }
}

/// Successful outcomes of a manual payment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualPaymentOutcome {
    Paid {
        message: String,
        invoice: InvoiceSummary,
    },
    /// The customer must complete authentication client-side
    RequiresAction {
        action_token: String,
        amount: i64,
        currency: String,
        invoice_id: String,
    },
}

/// What the tenant sees on the overdue banner
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueStatus {
    pub has_overdue: bool,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub subscription_status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_billed_at: Option<OffsetDateTime>,
    pub invoice_id: Option<String>,
    pub hosted_invoice_url: Option<String>,
}

#[derive(Clone)]
pub struct ManualRecoveryService {
    services: BillingServices,
}

impl ManualRecoveryService {
    pub fn new(services: BillingServices) -> Self {
        Self { services }
    }

    /// Pay the tenant's overdue balance now.
    ///
    /// Payment method precedence: `payment_method_ref`, then the record's
    /// default, then the gateway's default for the customer.
    pub async fn pay_overdue(
        &self,
        tenant_id: TenantId,
        actor_id: Option<Uuid>,
        payment_method_ref: Option<&str>,
        now: OffsetDateTime,
    ) -> BillingResult<ManualPaymentOutcome> {
        let record = self.services.ledger.get(tenant_id).await?;
        if record.subscription_status == SubscriptionStatus::Active {
            return Err(BillingError::NothingOverdue(tenant_id.to_string()));
        }

        let config = self.services.config();
        let charged = tokio::time::timeout(
            config.manual_timeout,
            self.charge(&record, payment_method_ref),
        )
        .await;

        let outcome = match charged {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Manual payment could not be attempted"
                );
                self.audit_failure(tenant_id, actor_id, &e.to_string(), None, now)
                    .await;
                return Err(match e {
                    GatewayError::NotConfigured(_) => BillingError::PaymentFailed {
                        reason: DeclineReason::NoPaymentMethod.to_string(),
                        details: DeclineReason::NoPaymentMethod.code().to_string(),
                    },
                    other => BillingError::Gateway(other),
                });
            }
            Err(_) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    timeout_ms = config.manual_timeout.as_millis() as u64,
                    "Manual payment timed out"
                );
                self.audit_failure(tenant_id, actor_id, "timeout", None, now)
                    .await;
                return Err(BillingError::Timeout(
                    "payment gateway did not answer in time".to_string(),
                ));
            }
        };

        let invoice = outcome.invoice;
        match outcome.result {
            ChargeResult::Paid => self.apply_paid(&record, actor_id, invoice, now).await,
            ChargeResult::RequiresAction { action_token } => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice.id,
                    "Manual payment requires customer authentication"
                );
                let mut entry =
                    AuditEntryBuilder::new(tenant_id, AuditAction::ManualPaymentRequiresAction)
                        .data(serde_json::json!({
                            "invoice_id": invoice.id,
                            "amount_cents": invoice.amount_due_cents,
                        }));
                if let Some(user) = actor_id {
                    entry = entry.actor_user(user);
                }
                self.services.audit.record(entry, now).await;

                Ok(ManualPaymentOutcome::RequiresAction {
                    action_token,
                    amount: invoice.amount_due_cents,
                    currency: invoice.currency,
                    invoice_id: invoice.id,
                })
            }
            ChargeResult::Failed(reason) => {
                tracing::info!(
                    tenant_id = %tenant_id,
                    invoice_id = %invoice.id,
                    decline = reason.code(),
                    "Manual payment declined"
                );
                self.audit_failure(
                    tenant_id,
                    actor_id,
                    &reason.to_string(),
                    Some(&invoice),
                    now,
                )
                .await;
                Err(BillingError::PaymentFailed {
                    reason: reason.to_string(),
                    details: reason.code().to_string(),
                })
            }
        }
    }

    async fn charge(
        &self,
        record: &BillingRecord,
        payment_method_ref: Option<&str>,
    ) -> Result<ChargeOutcome, GatewayError> {
        let config = self.services.config();

        let payment_method = match payment_method_ref
            .filter(|pm| !pm.is_empty())
            .map(str::to_string)
            .or_else(|| record.default_payment_method_ref.clone())
        {
            Some(pm) => pm,
            None => with_timeout(
                config.gateway_timeout,
                "default_payment_method",
                self.services
                    .gateway
                    .default_payment_method(&record.external_customer_ref),
            )
            .await?
            .ok_or_else(|| GatewayError::NotConfigured("no payment method on file".to_string()))?,
        };

        ensure_charged_for_current_period(
            self.services.gateway.as_ref(),
            ChargeRequest {
                customer_ref: &record.external_customer_ref,
                subscription_ref: &record.external_subscription_ref,
                payment_method_ref: &payment_method,
            },
            config.gateway_timeout,
        )
        .await
    }

    async fn apply_paid(
        &self,
        record: &BillingRecord,
        actor_id: Option<Uuid>,
        invoice: GatewayInvoice,
        now: OffsetDateTime,
    ) -> BillingResult<ManualPaymentOutcome> {
        let tenant_id = record.tenant_id();
        let applied = self
            .services
            .ledger
            .settle_charge(tenant_id, now, &invoice.id)
            .await?;

        let committed = applied.is_committed();
        if let Applied::Unchanged { reason, .. } = &applied {
            tracing::info!(
                tenant_id = %tenant_id,
                invoice_id = %invoice.id,
                reason = reason,
                "Overdue invoice was already applied"
            );
        } else {
            tracing::info!(
                tenant_id = %tenant_id,
                invoice_id = %invoice.id,
                amount_cents = invoice.amount_due_cents,
                "Overdue balance paid"
            );
        }

        let mut entry = AuditEntryBuilder::new(tenant_id, AuditAction::OverduePaid).data(
            serde_json::json!({
                "invoice_id": invoice.id,
                "amount_cents": invoice.amount_due_cents,
                "currency": invoice.currency,
                "previous_retry_count": record.retry_count,
                "applied": committed,
            }),
        );
        if let Some(user) = actor_id {
            entry = entry.actor_user(user);
        }
        self.services.audit.record(entry, now).await;

        Ok(ManualPaymentOutcome::Paid {
            message: "Payment successful. Your account is active again.".to_string(),
            invoice: InvoiceSummary::from(&invoice),
        })
    }

    async fn audit_failure(
        &self,
        tenant_id: TenantId,
        actor_id: Option<Uuid>,
        error: &str,
        invoice: Option<&GatewayInvoice>,
        now: OffsetDateTime,
    ) {
        let mut entry = AuditEntryBuilder::new(tenant_id, AuditAction::ManualPaymentFailed).data(
            serde_json::json!({
                "error": error,
                "invoice_id": invoice.map(|i| i.id.clone()),
                "amount_cents": invoice.map(|i| i.amount_due_cents),
            }),
        );
        if let Some(user) = actor_id {
            entry = entry.actor_user(user);
        }
        self.services.audit.record(entry, now).await;
    }

    /// Overdue banner data. A gateway outage hides the amount instead of failing.
    pub async fn overdue_status(&self, tenant_id: TenantId) -> BillingResult<OverdueStatus> {
        let record = self.services.ledger.get(tenant_id).await?;
        let mut status = OverdueStatus {
            has_overdue: record.subscription_status != SubscriptionStatus::Active,
            amount: None,
            currency: None,
            subscription_status: record.subscription_status,
            last_billed_at: record.last_billed_at,
            invoice_id: None,
            hosted_invoice_url: None,
        };
        if !status.has_overdue {
            return Ok(status);
        }

        let open = with_timeout(
            self.services.config().gateway_timeout,
            "find_open_invoice",
            self.services.gateway.find_open_invoice(
                &record.external_customer_ref,
                &record.external_subscription_ref,
            ),
        )
        .await;

        match open {
            Ok(Some(invoice)) => {
                status.amount = Some(invoice.amount_due_cents);
                status.currency = Some(invoice.currency);
                status.invoice_id = Some(invoice.id);
                status.hosted_invoice_url = invoice.hosted_invoice_url;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(
                    tenant_id = %tenant_id,
                    error = %e,
                    "Could not load open invoice for overdue status"
                );
            }
        }

        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use crate::audit::{ActorType, MemoryAuditLog};
    use crate::config::DunningConfig;
    use crate::memory_store::MemoryStore;
    use crate::store::{BillingStore, TenantStore};
    use crate::testing::{FakeGateway, RecordingNotifier, ScriptedCharge};
    use tenantops_shared::{Tenant, TenantStatus};
    use time::macros::datetime;
    use time::Duration;

    const DAY0: OffsetDateTime = datetime!(2026-03-01 06:00 UTC);

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<FakeGateway>,
        audit: Arc<MemoryAuditLog>,
        services: BillingServices,
        tenant_id: TenantId,
    }

    async fn harness(config: DunningConfig, past_due: bool) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(FakeGateway::new(4_900));
        let audit = Arc::new(MemoryAuditLog::new());
        let services = BillingServices::new(
            store.clone(),
            store.clone(),
            gateway.clone(),
            Arc::new(RecordingNotifier::new()),
            audit.clone(),
            config,
        );

        let tenant = Tenant::new("Maple Tutoring", Some("owner@maple.example".into()), DAY0);
        let tenant_id = tenant.tenant_id();
        store.insert_tenant(tenant);
        services
            .ledger
            .attach_payment_method(tenant_id, "cus_m", "sub_m", "pm_card", ActorType::User, DAY0)
            .await
            .unwrap();
        if past_due {
            services
                .ledger
                .record_payment_failure(tenant_id, DAY0, None)
                .await
                .unwrap();
        }

        Harness {
            store,
            gateway,
            audit,
            services,
            tenant_id,
        }
    }

    #[tokio::test]
    async fn test_nothing_overdue_makes_no_gateway_call() {
        let h = harness(DunningConfig::default(), false).await;
        let err = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, None, None, DAY0)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::NothingOverdue(_)));
        assert_eq!(h.gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_pay_overdue_ignores_cadence_and_restores_tenant() {
        let h = harness(DunningConfig::default(), true).await;
        h.store
            .restrict(h.tenant_id, TenantStatus::Paused, "grace period expired", DAY0)
            .await
            .unwrap();
        let user = Uuid::new_v4();

        let outcome = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, Some(user), None, DAY0 + Duration::hours(1))
            .await
            .unwrap();

        match outcome {
            ManualPaymentOutcome::Paid { invoice, .. } => {
                assert_eq!(invoice.amount, 4_900);
                assert_eq!(invoice.status, "paid");
            }
            other => panic!("expected paid, got {:?}", other),
        }
        let record = h.store.get(h.tenant_id).await.unwrap();
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        let tenant = h.store.get_tenant(h.tenant_id).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(tenant.status_reason, None);
        assert_eq!(tenant.last_payment_date, Some(DAY0 + Duration::hours(1)));

        let paid = h
            .audit
            .entries()
            .into_iter()
            .find(|e| e.action == "OVERDUE_PAID")
            .unwrap();
        assert_eq!(paid.actor_id, Some(user));
    }

    #[tokio::test]
    async fn test_requires_action_leaves_record_untouched() {
        let h = harness(DunningConfig::default(), true).await;
        h.gateway
            .script(ScriptedCharge::RequireAction("pi_123_secret_456".to_string()));
        let before = h.store.get(h.tenant_id).await.unwrap();

        let outcome = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, None, None, DAY0)
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            ManualPaymentOutcome::RequiresAction { amount: 4_900, .. }
        ));
        assert_eq!(h.store.get(h.tenant_id).await.unwrap(), before);
        assert!(h
            .audit
            .actions_for(h.tenant_id)
            .contains(&"MANUAL_PAYMENT_REQUIRES_ACTION".to_string()));
    }

    #[tokio::test]
    async fn test_decline_is_structured_error_without_mutation() {
        let h = harness(DunningConfig::default(), true).await;
        h.gateway.script(ScriptedCharge::InsufficientFunds);
        let before = h.store.get(h.tenant_id).await.unwrap();

        let err = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, None, Some("pm_other"), DAY0)
            .await
            .unwrap_err();

        match err {
            BillingError::PaymentFailed { details, .. } => {
                assert_eq!(details, "insufficient_funds")
            }
            other => panic!("expected payment failure, got {:?}", other),
        }
        assert_eq!(h.store.get(h.tenant_id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_falls_back_to_gateway_default_payment_method() {
        let h = harness(DunningConfig::default(), true).await;
        let mut record = h.store.get(h.tenant_id).await.unwrap();
        record.default_payment_method_ref = None;
        h.store.put_record(record);

        let err = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, None, None, DAY0)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::PaymentFailed { .. }));

        h.gateway.set_default_payment_method("cus_m", "pm_gateway");
        let outcome = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, None, None, DAY0)
            .await
            .unwrap();
        assert!(matches!(outcome, ManualPaymentOutcome::Paid { .. }));
    }

    #[tokio::test]
    async fn test_manual_timeout() {
        let h = harness(
            DunningConfig {
                manual_timeout: StdDuration::from_millis(30),
                ..Default::default()
            },
            true,
        )
        .await;
        h.gateway.script(ScriptedCharge::Hang);

        let err = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, None, None, DAY0)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Timeout(_)));
        assert_eq!(h.store.get(h.tenant_id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_overdue_status_shows_open_invoice_amount() {
        let h = harness(DunningConfig::default(), true).await;
        h.gateway.script(ScriptedCharge::Decline("do_not_honor".to_string()));
        let _ = h
            .services
            .recovery()
            .pay_overdue(h.tenant_id, None, None, DAY0)
            .await;

        let status = h
            .services
            .recovery()
            .overdue_status(h.tenant_id)
            .await
            .unwrap();

        assert!(status.has_overdue);
        assert_eq!(status.amount, Some(4_900));
        assert_eq!(status.subscription_status, SubscriptionStatus::PastDue);
        assert!(status.invoice_id.is_some());
    }

    #[tokio::test]
    async fn test_overdue_status_survives_gateway_outage() {
        let h = harness(DunningConfig::default(), true).await;
        h.gateway.set_unavailable(true);

        let status = h
            .services
            .recovery()
            .overdue_status(h.tenant_id)
            .await
            .unwrap();

        assert!(status.has_overdue);
        assert_eq!(status.amount, None);
    }
}
