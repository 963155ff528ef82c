//! Version-checked billing transitions
//!
//! [`BillingLedger`] is the single place that turns a [`BillingEvent`] into a
//! committed record change. It reads the record, runs [`apply`], and commits
//! with a version compare-and-swap. Callers that lose a race re-read and try
//! again, up to `max_conflict_retries` times.

use std::future::Future;
use std::sync::Arc;

use time::OffsetDateTime;

use tenantops_shared::{SubscriptionStatus, TenantId};

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog};
use crate::config::DunningConfig;
use crate::error::{BillingError, BillingResult};
use crate::record::{apply, BillingEvent, BillingRecord, TransitionOutcome};
use crate::store::BillingStore;

/// Result of applying one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The change is committed
    Committed {
        record: BillingRecord,
        /// The commit flipped `warning_sent`; the caller owes one warning
        send_warning: bool,
    },
    /// The event had no effect on the current record
    Unchanged {
        record: BillingRecord,
        reason: &'static str,
    },
}

impl Applied {
    pub fn record(&self) -> &BillingRecord {
        match self {
            Applied::Committed { record, .. } | Applied::Unchanged { record, .. } => record,
        }
    }

    pub fn into_record(self) -> BillingRecord {
        match self {
            Applied::Committed { record, .. } | Applied::Unchanged { record, .. } => record,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Applied::Committed { .. })
    }

    pub fn send_warning(&self) -> bool {
        matches!(
            self,
            Applied::Committed {
                send_warning: true,
                ..
            }
        )
    }
}

#[derive(Clone)]
pub struct BillingLedger {
    store: Arc<dyn BillingStore>,
    audit: Arc<dyn AuditLog>,
    config: DunningConfig,
}

impl BillingLedger {
    pub fn new(
        store: Arc<dyn BillingStore>,
        audit: Arc<dyn AuditLog>,
        config: DunningConfig,
    ) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    pub fn config(&self) -> &DunningConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BillingStore> {
        &self.store
    }

    pub async fn get(&self, tenant_id: TenantId) -> BillingResult<BillingRecord> {
        self.store.get(tenant_id).await
    }

    /// Single compare-and-swap attempt of `event` against `expected_version`
    pub async fn transition(
        &self,
        tenant_id: TenantId,
        event: &BillingEvent,
        expected_version: i64,
    ) -> BillingResult<Applied> {
        let current = self.store.get(tenant_id).await?;
        if current.version != expected_version {
            return Err(BillingError::ConcurrencyConflict {
                tenant_id: tenant_id.to_string(),
                expected_version,
            });
        }
        self.commit_event(current, event).await
    }

    async fn commit_event(
        &self,
        current: BillingRecord,
        event: &BillingEvent,
    ) -> BillingResult<Applied> {
        let tenant_id = current.tenant_id();
        match apply(&current, event, &self.config) {
            TransitionOutcome::Unchanged { reason } => {
                tracing::debug!(
                    tenant_id = %tenant_id,
                    event = event.name(),
                    reason = reason,
                    "Billing event had no effect"
                );
                Ok(Applied::Unchanged {
                    record: current,
                    reason,
                })
            }
            TransitionOutcome::Changed(transition) => {
                self.store.commit(&transition).await?;
                tracing::info!(
                    tenant_id = %tenant_id,
                    event = event.name(),
                    version = transition.next.version,
                    subscription_status = %transition.next.subscription_status,
                    retry_count = transition.next.retry_count,
                    "Billing record updated"
                );
                Ok(Applied::Committed {
                    record: transition.next,
                    send_warning: transition.send_warning,
                })
            }
        }
    }

    /// A definitive charge failure at `now`: counts a retry and may flip `warning_sent`
    pub async fn transition_on_failure(
        &self,
        tenant_id: TenantId,
        now: OffsetDateTime,
        expected_version: i64,
    ) -> BillingResult<Applied> {
        self.transition(tenant_id, &BillingEvent::RetryFailed { at: now }, expected_version)
            .await
    }

    /// A successful charge: closes the failure episode and restores the tenant
    pub async fn transition_on_success(
        &self,
        tenant_id: TenantId,
        billed_at: OffsetDateTime,
        invoice_ref: &str,
        expected_version: i64,
    ) -> BillingResult<Applied> {
        self.transition(
            tenant_id,
            &BillingEvent::ChargeSucceeded {
                billed_at,
                invoice_ref: invoice_ref.to_string(),
            },
            expected_version,
        )
        .await
    }

    /// Read-compute-write with bounded re-reads on version conflict.
    ///
    /// Exhausting the attempts is audited as `CONCURRENCY_CONFLICT` and
    /// surfaces the last conflict.
    pub async fn apply_event(
        &self,
        tenant_id: TenantId,
        event: &BillingEvent,
    ) -> BillingResult<Applied> {
        self.retry_on_conflict(tenant_id, event, |version| {
            self.transition(tenant_id, event, version)
        })
        .await
    }

    /// [`Self::transition_on_success`] against the latest version, re-read on conflict
    pub async fn settle_charge(
        &self,
        tenant_id: TenantId,
        billed_at: OffsetDateTime,
        invoice_ref: &str,
    ) -> BillingResult<Applied> {
        let event = BillingEvent::ChargeSucceeded {
            billed_at,
            invoice_ref: invoice_ref.to_string(),
        };
        self.retry_on_conflict(tenant_id, &event, |version| {
            self.transition_on_success(tenant_id, billed_at, invoice_ref, version)
        })
        .await
    }

    /// [`Self::transition_on_failure`] against the latest version, re-read on conflict
    pub async fn count_failed_retry(
        &self,
        tenant_id: TenantId,
        at: OffsetDateTime,
    ) -> BillingResult<Applied> {
        self.retry_on_conflict(tenant_id, &BillingEvent::RetryFailed { at }, |version| {
            self.transition_on_failure(tenant_id, at, version)
        })
        .await
    }

    async fn retry_on_conflict<F, Fut>(
        &self,
        tenant_id: TenantId,
        event: &BillingEvent,
        attempt_at: F,
    ) -> BillingResult<Applied>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = BillingResult<Applied>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let version = self.store.get(tenant_id).await?.version;
            match attempt_at(version).await {
                Err(e) if e.is_conflict() && attempt < self.config.max_conflict_retries => {
                    tracing::debug!(
                        tenant_id = %tenant_id,
                        event = event.name(),
                        attempt = attempt,
                        "Version conflict, re-reading billing record"
                    );
                }
                Err(e) if e.is_conflict() => {
                    tracing::warn!(
                        tenant_id = %tenant_id,
                        event = event.name(),
                        attempts = attempt,
                        "Giving up after repeated version conflicts"
                    );
                    self.audit
                        .record(
                            AuditEntryBuilder::new(tenant_id, AuditAction::ConcurrencyConflict)
                                .data(serde_json::json!({
                                    "event": event.name(),
                                    "attempts": attempt,
                                })),
                            event.occurred_at(),
                        )
                        .await;
                    return Err(e);
                }
                other => return other,
            }
        }
    }

    /// Create the record on first attachment, otherwise switch the default payment method
    pub async fn attach_payment_method(
        &self,
        tenant_id: TenantId,
        customer_ref: &str,
        subscription_ref: &str,
        payment_method_ref: &str,
        actor: ActorType,
        now: OffsetDateTime,
    ) -> BillingResult<BillingRecord> {
        let applied = match self.store.get(tenant_id).await {
            Ok(_) => {
                self.apply_event(
                    tenant_id,
                    &BillingEvent::PaymentMethodAttached {
                        payment_method_ref: payment_method_ref.to_string(),
                        at: now,
                    },
                )
                .await?
            }
            Err(BillingError::RecordNotFound(_)) => {
                let record = BillingRecord::new(
                    tenant_id,
                    customer_ref,
                    subscription_ref,
                    Some(payment_method_ref.to_string()),
                    now,
                );
                self.store.insert(&record).await?;
                tracing::info!(
                    tenant_id = %tenant_id,
                    customer_ref = %customer_ref,
                    "Billing record created"
                );
                Applied::Committed {
                    record,
                    send_warning: false,
                }
            }
            Err(e) => return Err(e),
        };

        if applied.is_committed() {
            self.audit
                .record(
                    AuditEntryBuilder::new(tenant_id, AuditAction::PaymentMethodAttached)
                        .actor_type(actor)
                        .data(serde_json::json!({
                            "payment_method_ref": payment_method_ref,
                            "version": applied.record().version,
                        })),
                    now,
                )
                .await;
        }

        Ok(applied.into_record())
    }

    /// Open a failure episode from a gateway notification. Does not count a retry.
    pub async fn record_payment_failure(
        &self,
        tenant_id: TenantId,
        at: OffsetDateTime,
        invoice_ref: Option<&str>,
    ) -> BillingResult<Applied> {
        let applied = self
            .apply_event(tenant_id, &BillingEvent::PaymentFailed { at })
            .await?;
        self.audit
            .record(
                AuditEntryBuilder::new(tenant_id, AuditAction::PaymentFailed)
                    .actor_type(ActorType::Gateway)
                    .data(outcome_payload(&applied, invoice_ref)),
                at,
            )
            .await;
        Ok(applied)
    }

    /// Mirror a subscription status change reported by the gateway
    pub async fn sync_subscription_status(
        &self,
        tenant_id: TenantId,
        status: SubscriptionStatus,
        at: OffsetDateTime,
    ) -> BillingResult<Applied> {
        let applied = self
            .apply_event(tenant_id, &BillingEvent::SubscriptionSynced { status, at })
            .await?;
        self.audit
            .record(
                AuditEntryBuilder::new(tenant_id, AuditAction::SubscriptionSynced)
                    .actor_type(ActorType::Gateway)
                    .data(serde_json::json!({
                        "status": status,
                        "applied": applied.is_committed(),
                        "version": applied.record().version,
                    })),
                at,
            )
            .await;
        Ok(applied)
    }

    /// Apply a gateway-reported payment (e.g. `invoice.paid`)
    pub async fn record_invoice_paid(
        &self,
        tenant_id: TenantId,
        billed_at: OffsetDateTime,
        invoice_ref: &str,
    ) -> BillingResult<Applied> {
        let applied = self.settle_charge(tenant_id, billed_at, invoice_ref).await?;
        self.audit
            .record(
                AuditEntryBuilder::new(tenant_id, AuditAction::InvoicePaid)
                    .actor_type(ActorType::Gateway)
                    .data(outcome_payload(&applied, Some(invoice_ref))),
                billed_at,
            )
            .await;
        Ok(applied)
    }
}

fn outcome_payload(applied: &Applied, invoice_ref: Option<&str>) -> serde_json::Value {
    let record = applied.record();
    let mut payload = serde_json::json!({
        "applied": applied.is_committed(),
        "subscription_status": record.subscription_status,
        "retry_count": record.retry_count,
        "version": record.version,
        "invoice_id": invoice_ref,
    });
    if let Applied::Unchanged { reason, .. } = applied {
        payload["reason"] = serde_json::json!(reason);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLog;
    use crate::memory_store::MemoryStore;
    use tenantops_shared::{Tenant, TenantStatus};
    use crate::store::TenantStore;
    use time::macros::datetime;
    use time::Duration;

    const DAY0: OffsetDateTime = datetime!(2026-03-01 06:00 UTC);

    struct Fixture {
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditLog>,
        ledger: BillingLedger,
        tenant_id: TenantId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditLog::new());
        let ledger = BillingLedger::new(store.clone(), audit.clone(), DunningConfig::default());

        let tenant = Tenant::new("Harbor Chess Academy", None, DAY0);
        let tenant_id = tenant.tenant_id();
        store.insert_tenant(tenant);
        ledger
            .attach_payment_method(tenant_id, "cus_1", "sub_1", "pm_1", ActorType::User, DAY0)
            .await
            .unwrap();

        Fixture {
            store,
            audit,
            ledger,
            tenant_id,
        }
    }

    #[tokio::test]
    async fn test_first_attach_creates_record() {
        let f = fixture().await;
        let record = f.ledger.get(f.tenant_id).await.unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.default_payment_method_ref.as_deref(), Some("pm_1"));
        assert_eq!(
            f.audit.actions_for(f.tenant_id),
            vec!["PAYMENT_METHOD_ATTACHED".to_string()]
        );

        let updated = f
            .ledger
            .attach_payment_method(f.tenant_id, "cus_1", "sub_1", "pm_2", ActorType::User, DAY0)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.default_payment_method_ref.as_deref(), Some("pm_2"));
    }

    #[tokio::test]
    async fn test_stale_expected_version_conflicts() {
        let f = fixture().await;
        f.ledger
            .record_payment_failure(f.tenant_id, DAY0, Some("in_1"))
            .await
            .unwrap();

        let err = f
            .ledger
            .transition_on_failure(f.tenant_id, DAY0 + Duration::days(3), 1)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let applied = f
            .ledger
            .transition_on_failure(f.tenant_id, DAY0 + Duration::days(3), 2)
            .await
            .unwrap();
        assert_eq!(applied.record().retry_count, 1);
    }

    #[tokio::test]
    async fn test_success_transition_checks_version_and_clears_episode() {
        let f = fixture().await;
        f.ledger
            .record_payment_failure(f.tenant_id, DAY0, Some("in_1"))
            .await
            .unwrap();
        f.ledger
            .transition_on_failure(f.tenant_id, DAY0 + Duration::days(3), 2)
            .await
            .unwrap();
        let before = f.ledger.get(f.tenant_id).await.unwrap();
        assert_eq!(before.version, 3);
        assert_eq!(before.retry_count, 1);

        let err = f
            .ledger
            .transition_on_success(f.tenant_id, DAY0 + Duration::days(4), "in_1", 2)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(f.ledger.get(f.tenant_id).await.unwrap(), before);

        let applied = f
            .ledger
            .transition_on_success(f.tenant_id, DAY0 + Duration::days(4), "in_1", 3)
            .await
            .unwrap();
        assert!(applied.is_committed());

        let record = f.ledger.get(f.tenant_id).await.unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(record.first_failure_at, None);
        assert_eq!(record.last_retry_at, None);
        assert_eq!(record.retry_count, 0);
        assert!(!record.warning_sent);
        assert_eq!(record.last_billed_at, Some(DAY0 + Duration::days(4)));
        assert_eq!(record.last_paid_invoice_ref.as_deref(), Some("in_1"));
        assert_eq!(
            f.store.get_tenant(f.tenant_id).await.unwrap().status,
            TenantStatus::Active
        );
    }

    #[tokio::test]
    async fn test_settle_charge_retries_through_conflicts() {
        let f = fixture().await;
        f.ledger
            .record_payment_failure(f.tenant_id, DAY0, Some("in_1"))
            .await
            .unwrap();
        f.store.inject_conflicts(2);

        let applied = f
            .ledger
            .settle_charge(f.tenant_id, DAY0 + Duration::days(3), "in_1")
            .await
            .unwrap();

        assert!(applied.is_committed());
        assert_eq!(applied.record().subscription_status, SubscriptionStatus::Active);
        assert_eq!(applied.record().version, 3);
    }

    #[tokio::test]
    async fn test_apply_event_retries_through_conflicts() {
        let f = fixture().await;
        f.store.inject_conflicts(2);

        let applied = f
            .ledger
            .record_payment_failure(f.tenant_id, DAY0, None)
            .await
            .unwrap();

        assert!(applied.is_committed());
        assert_eq!(
            f.store.get_tenant(f.tenant_id).await.unwrap().status,
            TenantStatus::PastDue
        );
    }

    #[tokio::test]
    async fn test_exhausted_conflicts_are_audited() {
        let f = fixture().await;
        f.store.inject_conflicts(10);

        let err = f
            .ledger
            .apply_event(f.tenant_id, &BillingEvent::PaymentFailed { at: DAY0 })
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(f
            .audit
            .actions_for(f.tenant_id)
            .contains(&"CONCURRENCY_CONFLICT".to_string()));
        assert_eq!(f.ledger.get(f.tenant_id).await.unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_invoice_paid_restores_suspended_tenant() {
        let f = fixture().await;
        f.ledger
            .record_payment_failure(f.tenant_id, DAY0, Some("in_1"))
            .await
            .unwrap();
        f.store
            .restrict(f.tenant_id, TenantStatus::Suspended, "grace period expired", DAY0)
            .await
            .unwrap();

        let applied = f
            .ledger
            .record_invoice_paid(f.tenant_id, DAY0 + Duration::days(5), "in_1")
            .await
            .unwrap();

        assert_eq!(applied.record().subscription_status, SubscriptionStatus::Active);
        let tenant = f.store.get_tenant(f.tenant_id).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(tenant.status_reason, None);
        assert_eq!(tenant.last_payment_date, Some(DAY0 + Duration::days(5)));
    }
}
