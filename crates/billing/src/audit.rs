//! Billing audit log
//!
//! Append-only record of every state-transition attempt, whatever its outcome.
//! Entries answer "why is this tenant past due?" and "who paid the overdue
//! balance?" without reconstructing history from the gateway.
//!
//! ## Actions
//!
//! - Scheduler: `RETRY_SUCCEEDED`, `RETRY_FAILED`, `RETRY_DEFERRED`
//! - Manual recovery: `OVERDUE_PAID`, `MANUAL_PAYMENT_FAILED`, `MANUAL_PAYMENT_REQUIRES_ACTION`
//! - Gateway notifications: `PAYMENT_FAILED`, `INVOICE_PAID`, `SUBSCRIPTION_SYNCED`
//! - Other: `PAYMENT_METHOD_ATTACHED`, `WARNING_SENT`, `TENANT_RESTRICTED`, `CONCURRENCY_CONFLICT`

use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use tenantops_shared::TenantId;

use crate::error::BillingResult;

/// Types of audited billing actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    // Scheduler
    RetrySucceeded,
    RetryFailed,
    RetryDeferred,

    // Manual recovery
    OverduePaid,
    ManualPaymentFailed,
    ManualPaymentRequiresAction,

    // Gateway notifications
    PaymentFailed,
    InvoicePaid,
    SubscriptionSynced,

    PaymentMethodAttached,
    WarningSent,
    TenantRestricted,
    ConcurrencyConflict,
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditAction::RetrySucceeded => "RETRY_SUCCEEDED",
            AuditAction::RetryFailed => "RETRY_FAILED",
            AuditAction::RetryDeferred => "RETRY_DEFERRED",
            AuditAction::OverduePaid => "OVERDUE_PAID",
            AuditAction::ManualPaymentFailed => "MANUAL_PAYMENT_FAILED",
            AuditAction::ManualPaymentRequiresAction => "MANUAL_PAYMENT_REQUIRES_ACTION",
            AuditAction::PaymentFailed => "PAYMENT_FAILED",
            AuditAction::InvoicePaid => "INVOICE_PAID",
            AuditAction::SubscriptionSynced => "SUBSCRIPTION_SYNCED",
            AuditAction::PaymentMethodAttached => "PAYMENT_METHOD_ATTACHED",
            AuditAction::WarningSent => "WARNING_SENT",
            AuditAction::TenantRestricted => "TENANT_RESTRICTED",
            AuditAction::ConcurrencyConflict => "CONCURRENCY_CONFLICT",
        };
        write!(f, "{}", s)
    }
}

/// Who triggered the action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    /// Scheduler or other automation
    System,
    /// Tenant user through the API
    User,
    /// Payment gateway webhook
    Gateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::System => write!(f, "system"),
            ActorType::User => write!(f, "user"),
            ActorType::Gateway => write!(f, "gateway"),
        }
    }
}

/// A persisted audit entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub action: String,
    pub actor: String,
    pub actor_id: Option<Uuid>,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Builder for audit entries
#[derive(Debug, Clone)]
pub struct AuditEntryBuilder {
    tenant_id: Uuid,
    action: AuditAction,
    actor: ActorType,
    actor_id: Option<Uuid>,
    payload: serde_json::Value,
}

impl AuditEntryBuilder {
    /// Create a new entry builder; the actor defaults to `system`
    pub fn new(tenant_id: TenantId, action: AuditAction) -> Self {
        Self {
            tenant_id: tenant_id.0,
            action,
            actor: ActorType::System,
            actor_id: None,
            payload: serde_json::json!({}),
        }
    }

    /// Set the payload
    pub fn data(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Set the actor type without a specific user
    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor = actor;
        self
    }

    /// Set the user who triggered the action
    pub fn actor_user(mut self, user_id: Uuid) -> Self {
        self.actor = ActorType::User;
        self.actor_id = Some(user_id);
        self
    }

    pub fn action(&self) -> AuditAction {
        self.action
    }

    pub fn build(self, now: OffsetDateTime) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            tenant_id: self.tenant_id,
            action: self.action.to_string(),
            actor: self.actor.to_string(),
            actor_id: self.actor_id,
            payload: self.payload,
            created_at: now,
        }
    }
}

/// Append-only audit sink
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()>;

    /// Most recent entries first
    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>>;

    /// Append, logging instead of failing. An audit write never undoes the
    /// billing change it describes.
    async fn record(&self, builder: AuditEntryBuilder, now: OffsetDateTime) {
        let action = builder.action();
        let entry = builder.build(now);
        let tenant_id = entry.tenant_id;
        if let Err(e) = self.append(entry).await {
            tracing::warn!(
                tenant_id = %tenant_id,
                action = %action,
                error = %e,
                "Failed to write billing audit entry - non-fatal"
            );
        }
    }
}

/// PostgreSQL audit log (`billing_audit_log`)
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_audit_log (
                id,
                tenant_id,
                action,
                actor,
                actor_id,
                payload,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(&entry.action)
        .bind(&entry.actor)
        .bind(entry.actor_id)
        .bind(&entry.payload)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let entries: Vec<AuditEntry> = sqlx::query_as(
            r#"
            SELECT
                id,
                tenant_id,
                action,
                actor,
                actor_id,
                payload,
                created_at
            FROM billing_audit_log
            WHERE tenant_id = $1
            ORDER BY created_at DESC, id
            LIMIT $2
            "#,
        )
        .bind(tenant_id.0)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(entries)
    }
}

/// In-memory audit log for tests and local runs
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every entry, oldest first
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Actions recorded for a tenant, oldest first
    pub fn actions_for(&self, tenant_id: TenantId) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.tenant_id == tenant_id.0)
            .map(|e| e.action)
            .collect()
    }
}

#[async_trait]
impl AuditLog for MemoryAuditLog {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(entry);
        Ok(())
    }

    async fn list_for_tenant(
        &self,
        tenant_id: TenantId,
        limit: i64,
    ) -> BillingResult<Vec<AuditEntry>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .entries()
            .into_iter()
            .rev()
            .filter(|e| e.tenant_id == tenant_id.0)
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_names_are_screaming_snake_case() {
        assert_eq!(AuditAction::OverduePaid.to_string(), "OVERDUE_PAID");
        assert_eq!(
            AuditAction::ManualPaymentRequiresAction.to_string(),
            "MANUAL_PAYMENT_REQUIRES_ACTION"
        );
        assert_eq!(
            serde_json::to_string(&AuditAction::RetryDeferred).unwrap(),
            "\"RETRY_DEFERRED\""
        );
    }

    #[test]
    fn test_builder_defaults_to_system_actor() {
        let tenant_id = TenantId::new();
        let entry = AuditEntryBuilder::new(tenant_id, AuditAction::RetryFailed)
            .data(serde_json::json!({ "retry_count": 2 }))
            .build(OffsetDateTime::UNIX_EPOCH);

        assert_eq!(entry.tenant_id, tenant_id.0);
        assert_eq!(entry.action, "RETRY_FAILED");
        assert_eq!(entry.actor, "system");
        assert_eq!(entry.actor_id, None);
        assert_eq!(entry.payload["retry_count"], 2);
    }

    #[tokio::test]
    async fn test_memory_log_lists_newest_first() {
        let log = MemoryAuditLog::new();
        let tenant_id = TenantId::new();
        let user = Uuid::new_v4();

        log.record(
            AuditEntryBuilder::new(tenant_id, AuditAction::PaymentFailed)
                .actor_type(ActorType::Gateway),
            OffsetDateTime::UNIX_EPOCH,
        )
        .await;
        log.record(
            AuditEntryBuilder::new(tenant_id, AuditAction::OverduePaid).actor_user(user),
            OffsetDateTime::UNIX_EPOCH + time::Duration::days(1),
        )
        .await;
        log.record(
            AuditEntryBuilder::new(TenantId::new(), AuditAction::RetryFailed),
            OffsetDateTime::UNIX_EPOCH,
        )
        .await;

        let listed = log.list_for_tenant(tenant_id, 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].action, "OVERDUE_PAID");
        assert_eq!(listed[0].actor, "user");
        assert_eq!(listed[0].actor_id, Some(user));
        assert_eq!(listed[1].actor, "gateway");
        assert_eq!(
            log.actions_for(tenant_id),
            vec!["PAYMENT_FAILED".to_string(), "OVERDUE_PAID".to_string()]
        );
    }
}
