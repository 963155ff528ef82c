//! Wiring for the reconciliation paths
//!
//! [`BillingServices`] bundles the injected collaborators (store, gateway,
//! notifier, audit log) and hands out the retry scheduler and the manual
//! recovery service, which share the same ledger and dunning config.

use std::sync::Arc;

use sqlx::PgPool;
use time::OffsetDateTime;

use tenantops_shared::{Tenant, TenantId, TenantStatus};

use crate::audit::{ActorType, AuditAction, AuditEntryBuilder, AuditLog, PgAuditLog};
use crate::client::StripeClient;
use crate::config::DunningConfig;
use crate::email::{BillingEmailService, Notifier};
use crate::error::BillingResult;
use crate::gateway::PaymentGateway;
use crate::ledger::BillingLedger;
use crate::pg_store::PgStore;
use crate::recovery::ManualRecoveryService;
use crate::scheduler::RetryScheduler;
use crate::store::{BillingStore, TenantStore};
use crate::stripe_gateway::StripeGateway;

#[derive(Clone)]
pub struct BillingServices {
    pub ledger: BillingLedger,
    pub tenants: Arc<dyn TenantStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub audit: Arc<dyn AuditLog>,
}

impl BillingServices {
    pub fn new(
        store: Arc<dyn BillingStore>,
        tenants: Arc<dyn TenantStore>,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<dyn Notifier>,
        audit: Arc<dyn AuditLog>,
        config: DunningConfig,
    ) -> Self {
        Self {
            ledger: BillingLedger::new(store, audit.clone(), config),
            tenants,
            gateway,
            notifier,
            audit,
        }
    }

    /// Postgres store and audit log, Stripe gateway, Resend notifier
    pub fn production(pool: PgPool, stripe: StripeClient, config: DunningConfig) -> Self {
        let store = Arc::new(PgStore::new(pool.clone()));
        Self::new(
            store.clone(),
            store,
            Arc::new(StripeGateway::new(stripe)),
            Arc::new(BillingEmailService::from_env()),
            Arc::new(PgAuditLog::new(pool)),
            config,
        )
    }

    pub fn config(&self) -> &DunningConfig {
        self.ledger.config()
    }

    pub fn scheduler(&self) -> RetryScheduler {
        RetryScheduler::new(self.clone())
    }

    pub fn recovery(&self) -> ManualRecoveryService {
        ManualRecoveryService::new(self.clone())
    }

    /// Apply a grace-period policy decision to a past-due tenant
    pub async fn restrict_tenant(
        &self,
        tenant_id: TenantId,
        status: TenantStatus,
        reason: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Tenant> {
        let tenant = self.tenants.restrict(tenant_id, status, reason, now).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            status = %status,
            reason = %reason,
            "Tenant restricted by grace-period policy"
        );

        self.audit
            .record(
                AuditEntryBuilder::new(tenant_id, AuditAction::TenantRestricted)
                    .actor_type(ActorType::System)
                    .data(serde_json::json!({
                        "status": status,
                        "reason": reason,
                    })),
                now,
            )
            .await;

        Ok(tenant)
    }
}
