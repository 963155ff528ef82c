//! Persistence seams for billing records and tenants
//!
//! [`BillingStore::commit`] is the only way a record changes after creation.
//! It writes the record conditioned on `version == previous_version` and
//! applies the tenant-side update in the same all-or-nothing unit, so a
//! tenant's status can never drift from its record's.

use async_trait::async_trait;
use time::OffsetDateTime;

use tenantops_shared::{Tenant, TenantId, TenantStatus};

use crate::error::BillingResult;
use crate::record::{BillingRecord, Transition};

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// The tenant's record, or `RecordNotFound`
    async fn get(&self, tenant_id: TenantId) -> BillingResult<BillingRecord>;

    async fn find_by_customer_ref(&self, customer_ref: &str)
        -> BillingResult<Option<BillingRecord>>;

    /// Create a record; `AlreadyExists` if the tenant has one
    async fn insert(&self, record: &BillingRecord) -> BillingResult<()>;

    /// Version-checked write of `transition.next` plus its tenant update.
    ///
    /// Fails with `ConcurrencyConflict` when the stored version is no longer
    /// `transition.previous_version`; nothing is written in that case.
    async fn commit(&self, transition: &Transition) -> BillingResult<()>;

    /// Past-due records with an open episode and a payment method, whose
    /// tenant is not already back to ACTIVE. Restricted tenants stay in.
    /// Ordered by tenant id.
    async fn list_retry_candidates(&self) -> BillingResult<Vec<BillingRecord>>;

    async fn list_all(&self) -> BillingResult<Vec<BillingRecord>>;
}

#[async_trait]
pub trait TenantStore: Send + Sync {
    /// The tenant, or `TenantNotFound`
    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Tenant>;

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>>;

    /// Apply a grace-period policy decision (SUSPENDED / PAUSED / DEACTIVATED).
    ///
    /// Only touches the tenant row; the billing record is left as it is.
    /// `InvalidTransition` unless the tenant's record is overdue.
    async fn restrict(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Tenant>;
}
