//! PostgreSQL store
//!
//! Every commit is one transaction: a version-conditioned `UPDATE` on
//! `billing_records` followed by the matching `tenants` update.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use tenantops_shared::{Tenant, TenantId, TenantStatus};

use crate::error::{BillingError, BillingResult};
use crate::record::{BillingRecord, TenantUpdate, Transition};
use crate::store::{BillingStore, TenantStore};

const RECORD_COLUMNS: &str = r#"
    tenant_id,
    external_customer_ref,
    external_subscription_ref,
    subscription_status,
    default_payment_method_ref,
    first_failure_at,
    last_retry_at,
    retry_count,
    warning_sent,
    last_billed_at,
    last_paid_invoice_ref,
    version,
    created_at,
    updated_at
"#;

const TENANT_COLUMNS: &str = r#"
    id,
    name,
    owner_email,
    status,
    status_reason,
    last_payment_date,
    payment_failure_count,
    created_at,
    updated_at
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn get(&self, tenant_id: TenantId) -> BillingResult<BillingRecord> {
        let record: Option<BillingRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records WHERE tenant_id = $1",
            RECORD_COLUMNS
        ))
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| BillingError::RecordNotFound(tenant_id.to_string()))
    }

    async fn find_by_customer_ref(
        &self,
        customer_ref: &str,
    ) -> BillingResult<Option<BillingRecord>> {
        let record: Option<BillingRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records WHERE external_customer_ref = $1",
            RECORD_COLUMNS
        ))
        .bind(customer_ref)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn insert(&self, record: &BillingRecord) -> BillingResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO billing_records (
                tenant_id,
                external_customer_ref,
                external_subscription_ref,
                subscription_status,
                default_payment_method_ref,
                first_failure_at,
                last_retry_at,
                retry_count,
                warning_sent,
                last_billed_at,
                last_paid_invoice_ref,
                version,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (tenant_id) DO NOTHING
            "#,
        )
        .bind(record.tenant_id)
        .bind(&record.external_customer_ref)
        .bind(&record.external_subscription_ref)
        .bind(record.subscription_status)
        .bind(&record.default_payment_method_ref)
        .bind(record.first_failure_at)
        .bind(record.last_retry_at)
        .bind(record.retry_count)
        .bind(record.warning_sent)
        .bind(record.last_billed_at)
        .bind(&record.last_paid_invoice_ref)
        .bind(record.version)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BillingError::AlreadyExists(record.tenant_id.to_string()));
        }
        Ok(())
    }

    async fn commit(&self, transition: &Transition) -> BillingResult<()> {
        let next = &transition.next;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE billing_records
            SET subscription_status = $3,
                default_payment_method_ref = $4,
                first_failure_at = $5,
                last_retry_at = $6,
                retry_count = $7,
                warning_sent = $8,
                last_billed_at = $9,
                last_paid_invoice_ref = $10,
                version = $11,
                updated_at = $12
            WHERE tenant_id = $1 AND version = $2
            "#,
        )
        .bind(next.tenant_id)
        .bind(transition.previous_version)
        .bind(next.subscription_status)
        .bind(&next.default_payment_method_ref)
        .bind(next.first_failure_at)
        .bind(next.last_retry_at)
        .bind(next.retry_count)
        .bind(next.warning_sent)
        .bind(next.last_billed_at)
        .bind(&next.last_paid_invoice_ref)
        .bind(next.version)
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            let exists: (bool,) =
                sqlx::query_as("SELECT EXISTS(SELECT 1 FROM billing_records WHERE tenant_id = $1)")
                    .bind(next.tenant_id)
                    .fetch_one(&self.pool)
                    .await?;
            return Err(if exists.0 {
                BillingError::ConcurrencyConflict {
                    tenant_id: next.tenant_id.to_string(),
                    expected_version: transition.previous_version,
                }
            } else {
                BillingError::RecordNotFound(next.tenant_id.to_string())
            });
        }

        match transition.tenant {
            TenantUpdate::Keep => {}
            TenantUpdate::MarkPastDue { count_failure } => {
                sqlx::query(
                    r#"
                    UPDATE tenants
                    SET status = CASE WHEN status = 'ACTIVE' THEN 'PAST_DUE' ELSE status END,
                        payment_failure_count = payment_failure_count + $2,
                        updated_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(next.tenant_id)
                .bind(i32::from(count_failure))
                .bind(next.updated_at)
                .execute(&mut *tx)
                .await?;
            }
            TenantUpdate::Restore { last_payment_date } => {
                sqlx::query(
                    r#"
                    UPDATE tenants
                    SET status = 'ACTIVE',
                        status_reason = NULL,
                        payment_failure_count = 0,
                        last_payment_date = COALESCE($2, last_payment_date),
                        updated_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(next.tenant_id)
                .bind(last_payment_date)
                .bind(next.updated_at)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_retry_candidates(&self) -> BillingResult<Vec<BillingRecord>> {
        let records: Vec<BillingRecord> = sqlx::query_as(
            r#"
            SELECT b.tenant_id,
                   b.external_customer_ref,
                   b.external_subscription_ref,
                   b.subscription_status,
                   b.default_payment_method_ref,
                   b.first_failure_at,
                   b.last_retry_at,
                   b.retry_count,
                   b.warning_sent,
                   b.last_billed_at,
                   b.last_paid_invoice_ref,
                   b.version,
                   b.created_at,
                   b.updated_at
            FROM billing_records b
            JOIN tenants t ON t.id = b.tenant_id
            WHERE b.subscription_status = 'past_due'
              AND b.first_failure_at IS NOT NULL
              AND b.default_payment_method_ref IS NOT NULL
              AND t.status <> 'ACTIVE'
            ORDER BY b.tenant_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_all(&self) -> BillingResult<Vec<BillingRecord>> {
        let records: Vec<BillingRecord> = sqlx::query_as(&format!(
            "SELECT {} FROM billing_records ORDER BY tenant_id",
            RECORD_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[async_trait]
impl TenantStore for PgStore {
    async fn get_tenant(&self, tenant_id: TenantId) -> BillingResult<Tenant> {
        let tenant: Option<Tenant> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants WHERE id = $1",
            TENANT_COLUMNS
        ))
        .bind(tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        tenant.ok_or_else(|| BillingError::TenantNotFound(tenant_id.to_string()))
    }

    async fn list_tenants(&self) -> BillingResult<Vec<Tenant>> {
        let tenants: Vec<Tenant> = sqlx::query_as(&format!(
            "SELECT {} FROM tenants ORDER BY id",
            TENANT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(tenants)
    }

    async fn restrict(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Tenant> {
        let status = status.require_policy_restriction()?;

        let tenant: Option<Tenant> = sqlx::query_as(&format!(
            r#"
            UPDATE tenants
            SET status = $2, status_reason = $3, updated_at = $4
            WHERE id = $1
              AND EXISTS (
                  SELECT 1 FROM billing_records
                  WHERE tenant_id = $1 AND subscription_status <> 'active'
              )
            RETURNING {}
            "#,
            TENANT_COLUMNS
        ))
        .bind(tenant_id.0)
        .bind(status)
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(tenant) = tenant {
            return Ok(tenant);
        }

        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM tenants WHERE id = $1)")
                .bind(tenant_id.0)
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Err(BillingError::InvalidTransition(format!(
                "tenant {} has nothing overdue and cannot be restricted",
                tenant_id
            )))
        } else {
            Err(BillingError::TenantNotFound(tenant_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DunningConfig;
    use crate::record::{apply, BillingEvent, TransitionOutcome};
    use tenantops_shared::SubscriptionStatus;

    // Requires a migrated database: DATABASE_URL=... cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn test_commit_round_trip() {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = tenantops_shared::create_pool(&url, 2).await.unwrap();
        let store = PgStore::new(pool.clone());
        let now = OffsetDateTime::now_utc();

        let tenant = Tenant::new("Pg Test Tenant", None, now);
        sqlx::query("INSERT INTO tenants (id, name, status, payment_failure_count, created_at, updated_at) VALUES ($1, $2, 'ACTIVE', 0, $3, $3)")
            .bind(tenant.id)
            .bind(&tenant.name)
            .bind(now)
            .execute(&pool)
            .await
            .unwrap();

        let record = BillingRecord::new(tenant.tenant_id(), "cus_pg", "sub_pg", Some("pm_pg".into()), now);
        store.insert(&record).await.unwrap();

        // Nothing overdue yet: the policy seam must refuse
        assert!(matches!(
            store
                .restrict(tenant.tenant_id(), TenantStatus::Suspended, "grace period expired", now)
                .await,
            Err(BillingError::InvalidTransition(_))
        ));

        let transition = match apply(&record, &BillingEvent::PaymentFailed { at: now }, &DunningConfig::default()) {
            TransitionOutcome::Changed(t) => t,
            other => panic!("expected change, got {:?}", other),
        };
        store.commit(&transition).await.unwrap();
        assert!(store.commit(&transition).await.unwrap_err().is_conflict());

        let stored = store.get(tenant.tenant_id()).await.unwrap();
        assert_eq!(stored.subscription_status, SubscriptionStatus::PastDue);
        let tenant_id = tenant.tenant_id();
        let tenant = store.get_tenant(tenant_id).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::PastDue);

        let restricted = store
            .restrict(tenant_id, TenantStatus::Deactivated, "grace period expired", now)
            .await
            .unwrap();
        assert_eq!(restricted.status, TenantStatus::Deactivated);
        assert!(store
            .list_retry_candidates()
            .await
            .unwrap()
            .iter()
            .any(|r| r.tenant_id == tenant_id.0));
    }
}
