//! In-memory store for tests and local runs
//!
//! Holds tenants and billing records behind one lock, so a commit updates
//! both atomically just like the PostgreSQL transaction does.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use tenantops_shared::{Tenant, TenantId, TenantStatus};

use crate::error::{BillingError, BillingResult};
use crate::record::{BillingRecord, Transition};
use crate::store::{BillingStore, TenantStore};

#[derive(Default)]
struct Tables {
    tenants: BTreeMap<Uuid, Tenant>,
    records: BTreeMap<Uuid, BillingRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    injected_conflicts: AtomicUsize,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_tenant(&self, tenant: Tenant) {
        self.lock().tenants.insert(tenant.id, tenant);
    }

    /// Overwrite a record without a version check (test setup only)
    pub fn put_record(&self, record: BillingRecord) {
        self.lock().records.insert(record.tenant_id, record);
    }

    /// Make the next `n` commits fail with a version conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.injected_conflicts.store(n, Ordering::SeqCst);
    }

    /// Successful commits so far
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn get(&self, tenant_id: TenantId) -> BillingResult<BillingRecord> {
        self.lock()
            .records
            .get(&tenant_id.0)
            .cloned()
            .ok_or_else(|| BillingError::RecordNotFound(tenant_id.to_string()))
    }

    async fn find_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<BillingRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .find(|r| r.external_customer_ref == customer_ref)
            .cloned())
    }

    async fn insert(&self, record: &BillingRecord) -> BillingResult<()> {
        let mut tables = self.lock();
        if !tables.tenants.contains_key(&record.tenant_id) {
            return Err(BillingError::TenantNotFound(record.tenant_id.to_string()));
        }
        if tables.records.contains_key(&record.tenant_id) {
            return Err(BillingError::AlreadyExists(record.tenant_id.to_string()));
        }
        tables.records.insert(record.tenant_id, record.clone());
        Ok(())
    }

    async fn commit(&self, transition: &Transition) -> BillingResult<()> {
        let tenant_id = transition.next.tenant_id;
        let conflict = || BillingError::ConcurrencyConflict {
            tenant_id: tenant_id.to_string(),
            expected_version: transition.previous_version,
        };

        if self.take_injected_conflict() {
            return Err(conflict());
        }

        let mut tables = self.lock();
        let Tables { tenants, records } = &mut *tables;

        let current = records
            .get_mut(&tenant_id)
            .ok_or_else(|| BillingError::RecordNotFound(tenant_id.to_string()))?;
        if current.version != transition.previous_version {
            return Err(conflict());
        }
        let tenant = tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;

        *current = transition.next.clone();
        transition
            .tenant
            .apply_to(tenant, transition.next.updated_at);
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_retry_candidates(&self) -> BillingResult<Vec<BillingRecord>> {
        let tables = self.lock();
        Ok(tables
            .records
            .values()
            .filter(|r| r.is_retry_candidate())
            .filter(|r| {
                tables
                    .tenants
                    .get(&r.tenant_id)
                    .is_some_and(|t| t.status != TenantStatus::Active)
            })
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> BillingResult<Vec<BillingRecord>> {
        Ok(self.lock().records.values().cloned().collect())
    }
}

#[async_trait]
impl TenantStore for MemoryStore {
    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Tenant> {
        self.lock()
            .tenants
            .get(&tenant_id.0)
            .cloned()
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))
    }

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>> {
        Ok(self.lock().tenants.values().cloned().collect())
    }

    async fn restrict(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Tenant> {
        let status = status.require_policy_restriction()?;
        let mut tables = self.lock();
        let Tables { tenants, records } = &mut *tables;
        let tenant = tenants
            .get_mut(&tenant_id.0)
            .ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))?;
        if !records.get(&tenant_id.0).is_some_and(|r| r.is_overdue()) {
            return Err(BillingError::InvalidTransition(format!(
                "tenant {} has nothing overdue and cannot be restricted",
                tenant_id
            )));
        }
        tenant.status = status;
        tenant.status_reason = Some(reason.to_string());
        tenant.updated_at = now;
        Ok(tenant.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DunningConfig;
    use crate::record::{apply, BillingEvent, TransitionOutcome};
    use tenantops_shared::SubscriptionStatus;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2026-03-01 06:00 UTC);

    fn seeded() -> (MemoryStore, TenantId) {
        let store = MemoryStore::new();
        let tenant = Tenant::new("Lakeside Swim Club", None, NOW);
        let tenant_id = tenant.tenant_id();
        store.insert_tenant(tenant);
        store.put_record(BillingRecord::new(
            tenant_id,
            "cus_1",
            "sub_1",
            Some("pm_1".to_string()),
            NOW,
        ));
        (store, tenant_id)
    }

    fn failure(record: &BillingRecord) -> Transition {
        match apply(
            record,
            &BillingEvent::PaymentFailed { at: NOW },
            &DunningConfig::default(),
        ) {
            TransitionOutcome::Changed(t) => t,
            other => panic!("expected change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commit_updates_record_and_tenant_together() {
        let (store, tenant_id) = seeded();
        let record = store.get(tenant_id).await.unwrap();

        store.commit(&failure(&record)).await.unwrap();

        let record = store.get(tenant_id).await.unwrap();
        let tenant = store.get_tenant(tenant_id).await.unwrap();
        assert_eq!(record.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(record.version, 2);
        assert_eq!(tenant.status, TenantStatus::PastDue);
        assert_eq!(tenant.payment_failure_count, 1);
    }

    #[tokio::test]
    async fn test_stale_commit_is_rejected() {
        let (store, tenant_id) = seeded();
        let record = store.get(tenant_id).await.unwrap();
        let transition = failure(&record);

        store.commit(&transition).await.unwrap();
        let err = store.commit(&transition).await.unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(store.commits(), 1);
        assert_eq!(store.get(tenant_id).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_insert_twice_fails() {
        let (store, tenant_id) = seeded();
        let record = store.get(tenant_id).await.unwrap();
        assert!(matches!(
            store.insert(&record).await,
            Err(BillingError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_candidates_include_every_restricted_tenant() {
        let (store, tenant_id) = seeded();
        let record = store.get(tenant_id).await.unwrap();
        store.commit(&failure(&record)).await.unwrap();
        assert_eq!(store.list_retry_candidates().await.unwrap().len(), 1);

        for status in [
            TenantStatus::Suspended,
            TenantStatus::Paused,
            TenantStatus::Deactivated,
        ] {
            store
                .restrict(tenant_id, status, "grace period expired", NOW)
                .await
                .unwrap();
            assert_eq!(store.list_retry_candidates().await.unwrap().len(), 1);
        }
    }

    #[tokio::test]
    async fn test_candidates_skip_tenant_resolved_out_of_band() {
        let (store, tenant_id) = seeded();
        let record = store.get(tenant_id).await.unwrap();
        store.commit(&failure(&record)).await.unwrap();

        // Tenant row flipped back without the record catching up
        if let Some(tenant) = store.lock().tenants.get_mut(&tenant_id.0) {
            tenant.status = TenantStatus::Active;
        }
        assert!(store.list_retry_candidates().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restrict_rejects_tenant_in_good_standing() {
        let (store, tenant_id) = seeded();

        let err = store
            .restrict(tenant_id, TenantStatus::Suspended, "grace period expired", NOW)
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::InvalidTransition(_)));
        let tenant = store.get_tenant(tenant_id).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(tenant.status_reason, None);
    }

    #[tokio::test]
    async fn test_restrict_rejects_non_policy_status() {
        let (store, tenant_id) = seeded();
        let err = store
            .restrict(tenant_id, TenantStatus::Active, "manual", NOW)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidTransition(_)));
    }
}
